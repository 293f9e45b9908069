//! Weight reordering into the blocked layouts generated kernels read.
//!
//! Weights are supplied in logical `[G][OC/G][IC/G][KH][KW]` order (GEMM B
//! is seen as `G = 1, KH = KW = 1`, `oc = n`, `ic = k`) through an accessor
//! and packed once, at primitive creation.
//!
//! Dense and GEMM layout, one vector per (group, oc block, kh, kw, ic pack):
//!
//! ```text
//! F32Fma   lane l = w[oc0 + l][ic]                       f32
//! Pairs16  lane l = (w[oc0 + l][2p], w[oc0 + l][2p + 1])  i16 x 2
//! Quads8   lane l = w[oc0 + l][4p .. 4p + 4]              i8 x 4
//! ```
//!
//! Depthwise: one vector per (channel block, kh, kw), lane `l` holding the
//! weight of channel `c0 + l` as i32 (8-bit weights) or f32.
//!
//! Lanes past the last channel and pack slots past the last input channel
//! are zero. For 8-bit sources the per-channel compensation
//! `-(shift + zero_point) * sum(w)` is produced in the same pass.

use crate::cache_params::AlignedBytes;
use crate::compiler::planner::{CompensationMode, DotProduct, ExecutionPlan, KernelFamily, WeightLayout};
use crate::types::{DataType, JitError, JitResult};

/// Logical coordinates of one weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightIndex {
    pub g: usize,
    pub oc: usize,
    pub ic: usize,
    pub kh: usize,
    pub kw: usize,
}

/// Reads logical weights of the element type the plan expects.
#[derive(Clone, Copy)]
pub enum WeightAccessor<'a> {
    F32(&'a dyn Fn(WeightIndex) -> f32),
    S8(&'a dyn Fn(WeightIndex) -> i8),
}

impl WeightAccessor<'_> {
    fn data_type(&self) -> DataType {
        match self {
            WeightAccessor::F32(_) => DataType::F32,
            WeightAccessor::S8(_) => DataType::S8,
        }
    }
}

/// Weights in kernel layout plus their compensation vector.
pub struct PackedWeights {
    bytes: AlignedBytes,
    compensation: Vec<i32>,
    layout: WeightLayout,
}

impl PackedWeights {
    pub fn pack(plan: &ExecutionPlan, at: WeightAccessor<'_>) -> JitResult<Self> {
        if at.data_type() != plan.wei_type {
            return Err(JitError::BufferMismatch(format!(
                "plan expects {} weights, accessor yields {}",
                plan.wei_type,
                at.data_type()
            )));
        }
        let mut bytes = AlignedBytes::zeroed(plan.weights.total_bytes)?;
        match plan.family {
            KernelFamily::DepthwiseConv => pack_depthwise(plan, at, bytes.as_mut_slice()),
            KernelFamily::DenseConv | KernelFamily::Gemm => pack_blocked(plan, at, bytes.as_mut_slice())?,
        }
        let compensation = compensation(plan, at);
        log::debug!(
            "packed {} weights: {} bytes, {} compensation terms",
            plan.family,
            bytes.len(),
            compensation.len()
        );
        Ok(PackedWeights {
            bytes,
            compensation,
            layout: plan.weights,
        })
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    #[inline(always)]
    pub fn compensation(&self) -> &[i32] {
        &self.compensation
    }

    pub fn layout(&self) -> &WeightLayout {
        &self.layout
    }

    #[inline(always)]
    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    #[inline(always)]
    pub(crate) fn compensation_ptr(&self) -> *const i32 {
        self.compensation.as_ptr()
    }
}

impl std::fmt::Debug for PackedWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedWeights")
            .field("bytes", &self.bytes.len())
            .field("compensation", &self.compensation.len())
            .finish()
    }
}

fn pack_blocked(plan: &ExecutionPlan, at: WeightAccessor<'_>, out: &mut [u8]) -> JitResult<()> {
    let g = &plan.geometry;
    let w = &plan.weights;
    let lanes = plan.simd_lanes;
    let pack = plan.ic_pack;
    for grp in 0..g.ngroups {
        for b in 0..plan.nb_oc_total {
            for kh in 0..g.kh {
                for kw in 0..g.kw {
                    for p in 0..plan.n_packs {
                        let base = grp * w.group_stride
                            + b * w.block_stride
                            + kh * w.row_stride
                            + (kw * plan.n_packs + p) * w.vector_bytes;
                        for l in 0..lanes {
                            let oc = b * lanes + l;
                            if oc >= g.oc {
                                break;
                            }
                            for i in 0..pack {
                                let ic = p * pack + i;
                                if ic >= g.ic {
                                    break;
                                }
                                let idx = WeightIndex { g: grp, oc, ic, kh, kw };
                                let lane = base + l * 4;
                                match (plan.dot, at) {
                                    (DotProduct::F32Fma, WeightAccessor::F32(f)) => {
                                        out[lane..lane + 4].copy_from_slice(&f(idx).to_le_bytes());
                                    }
                                    (DotProduct::Pairs16, WeightAccessor::S8(f)) => {
                                        let o = lane + i * 2;
                                        out[o..o + 2].copy_from_slice(&i16::from(f(idx)).to_le_bytes());
                                    }
                                    (DotProduct::Quads8, WeightAccessor::S8(f)) => {
                                        out[lane + i] = f(idx) as u8;
                                    }
                                    (dot, _) => {
                                        return Err(JitError::BufferMismatch(format!(
                                            "{dot:?} kernel cannot take {} weights",
                                            at.data_type()
                                        )))
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn pack_depthwise(plan: &ExecutionPlan, at: WeightAccessor<'_>, out: &mut [u8]) {
    let g = &plan.geometry;
    let w = &plan.weights;
    let lanes = plan.simd_lanes;
    let words: &mut [u32] = bytemuck::cast_slice_mut(out);
    for b in 0..plan.nb_oc_total {
        for kh in 0..g.kh {
            for kw in 0..g.kw {
                let base = (b * w.block_stride + kh * w.row_stride + kw * w.vector_bytes) / 4;
                for l in 0..lanes {
                    let c = b * lanes + l;
                    if c >= g.ngroups {
                        break;
                    }
                    let idx = WeightIndex { g: c, oc: 0, ic: 0, kh, kw };
                    words[base + l] = match at {
                        WeightAccessor::F32(f) => f(idx).to_bits(),
                        WeightAccessor::S8(f) => i32::from(f(idx)) as u32,
                    };
                }
            }
        }
    }
}

fn compensation(plan: &ExecutionPlan, at: WeightAccessor<'_>) -> Vec<i32> {
    let WeightAccessor::S8(f) = at else {
        return Vec::new();
    };
    if plan.compensation != CompensationMode::Precomputed {
        return Vec::new();
    }
    let g = &plan.geometry;
    let factor = -(plan.src_shift + plan.src_zero_point);
    let padded = plan.padded_oc();
    let mut comp = vec![0i32; plan.weights.compensation_len];
    for grp in 0..g.ngroups {
        for oc in 0..g.oc {
            let mut sum = 0i32;
            for ic in 0..g.ic {
                for kh in 0..g.kh {
                    for kw in 0..g.kw {
                        sum += i32::from(f(WeightIndex { g: grp, oc, ic, kh, kw }));
                    }
                }
            }
            comp[grp * padded + oc] = factor.wrapping_mul(sum);
        }
    }
    comp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{ConvDesc, GemmDesc};
    use crate::compiler::planner::{plan_dense, plan_depthwise, plan_gemm};
    use crate::config::JitConfig;
    use crate::dispatch::{CapabilitySet, IsaLevel};

    fn caps(level: IsaLevel) -> CapabilitySet {
        CapabilitySet::for_level(level)
    }

    #[test]
    fn pairs16_layout_and_compensation() {
        // ic = 3 → two packs, the second half empty
        let desc = ConvDesc::new(1, 3, 2, (4, 4), (1, 1)).types(DataType::S8, DataType::S8, DataType::S32);
        let plan = plan_dense(&desc, &caps(IsaLevel::Avx2), &JitConfig::default()).unwrap();
        assert_eq!(plan.dot, DotProduct::Pairs16);
        let f = |i: WeightIndex| (i.oc * 10 + i.ic) as i8 + 1;
        let packed = PackedWeights::pack(&plan, WeightAccessor::S8(&f)).unwrap();
        let words: &[i16] = bytemuck::cast_slice(packed.as_bytes());
        // pack 0, lane 0: (w[0][0], w[0][1]); lane 1: (w[1][0], w[1][1])
        assert_eq!(&words[0..4], &[1, 2, 11, 12]);
        // pack 1 starts one vector later: (w[0][2], 0)
        let v = plan.simd_lanes * 2;
        assert_eq!(&words[v..v + 4], &[3, 0, 13, 0]);
        // lanes past oc are zero
        assert!(words[4..v].iter().all(|&x| x == 0));
        // comp = -128 * sum(w)
        assert_eq!(packed.compensation()[0], -128 * (1 + 2 + 3));
        assert_eq!(packed.compensation()[1], -128 * (11 + 12 + 13));
        assert_eq!(packed.compensation()[2], 0);
    }

    #[test]
    fn quads8_packs_four_channels_per_lane() {
        let g = GemmDesc::new(4, 16, 8).types(DataType::U8, DataType::S8, DataType::S32).a_zero_point(5);
        let plan = plan_gemm(&g, &caps(IsaLevel::Avx512CoreVnni), &JitConfig::default()).unwrap();
        let f = |i: WeightIndex| (i.ic as i8) - (i.oc as i8);
        let packed = PackedWeights::pack(&plan, WeightAccessor::S8(&f)).unwrap();
        let b = packed.as_bytes();
        // lane 1 of pack 1: w[oc=1][ic=4..8]
        let off = plan.vector_bytes() + 4;
        assert_eq!(&b[off..off + 4], &[3u8, 4, 5, 6]);
        let sum: i32 = (0..8).map(|k| k - 2).sum();
        assert_eq!(packed.compensation()[2], -5 * sum);
    }

    /// Lane model of the blocked int8 kernels for one GEMM row: operand
    /// bytes are shifted by `src_shift`, the remainder pack is gathered with
    /// zero bytes, and each lane sums `u8 x s8` products over its pack
    /// (`vpdpbusd`) or over word pairs (`vpmaddwd`) on top of the
    /// compensation.
    fn simulate_row(plan: &ExecutionPlan, packed: &PackedWeights, a: &[i8]) -> Vec<i32> {
        let g = &plan.geometry;
        let b = packed.as_bytes();
        let lanes = plan.simd_lanes;
        let shift = plan.src_shift as u8;
        (0..g.oc)
            .map(|oc| {
                let (blk, l) = (oc / lanes, oc % lanes);
                let mut acc = packed.compensation().get(oc).copied().unwrap_or(0);
                for p in 0..plan.n_packs {
                    let lane = blk * plan.weights.block_stride + p * plan.weights.vector_bytes + l * 4;
                    for i in 0..plan.ic_pack {
                        let k = p * plan.ic_pack + i;
                        let byte = a.get(k).map_or(0, |&x| x as u8) ^ shift;
                        let w = match plan.dot {
                            DotProduct::Quads8 => i32::from(b[lane + i] as i8),
                            DotProduct::Pairs16 => i32::from(i16::from_le_bytes([b[lane + 2 * i], b[lane + 2 * i + 1]])),
                            dot => panic!("{dot:?} is not a blocked int8 product"),
                        };
                        acc += i32::from(byte) * w;
                    }
                }
                acc
            })
            .collect()
    }

    #[test]
    fn packed_int8_lanes_reproduce_the_zero_point_product() {
        let w = |i: WeightIndex| ((i.oc * 37 + i.ic * 11) % 256) as u8 as i8;
        for (a_type, zp) in [(DataType::S8, -7), (DataType::U8, 5), (DataType::U8, 0)] {
            let desc = GemmDesc::new(3, 20, 11).types(a_type, DataType::S8, DataType::S32).a_zero_point(zp);
            for level in [IsaLevel::Avx2, IsaLevel::Avx512Core, IsaLevel::Avx512CoreVnni] {
                let plan = plan_gemm(&desc, &caps(level), &JitConfig::default()).unwrap();
                let packed = PackedWeights::pack(&plan, WeightAccessor::S8(&w)).unwrap();
                for m in 0..3 {
                    let row: Vec<i8> = (0..11).map(|k| ((m * 53 + k * 29) % 256) as u8 as i8).collect();
                    let want: Vec<i32> = (0..20)
                        .map(|n| {
                            (0..11)
                                .map(|k| {
                                    let x = if a_type == DataType::S8 { i32::from(row[k]) } else { i32::from(row[k] as u8) };
                                    (x - zp) * i32::from(w(WeightIndex { g: 0, oc: n, ic: k, kh: 0, kw: 0 }))
                                })
                                .sum()
                        })
                        .collect();
                    assert_eq!(simulate_row(&plan, &packed, &row), want, "{a_type} zp={zp} {level:?} row {m}");
                }
            }
        }
    }

    #[test]
    fn depthwise_widens_to_i32() {
        let d = ConvDesc::new(1, 3, 3, (5, 5), (3, 3))
            .groups(3)
            .types(DataType::U8, DataType::S8, DataType::S32);
        let plan = plan_depthwise(&d, &caps(IsaLevel::Avx2), &JitConfig::default()).unwrap();
        let f = |i: WeightIndex| -((i.g * 9 + i.kh * 3 + i.kw) as i8);
        let packed = PackedWeights::pack(&plan, WeightAccessor::S8(&f)).unwrap();
        let words: &[i32] = bytemuck::cast_slice(packed.as_bytes());
        // (kh=1, kw=2) vector, channel 2
        let base = (plan.weights.row_stride + 2 * plan.vector_bytes()) / 4;
        assert_eq!(words[base + 2], -(18 + 3 + 2));
        assert_eq!(words[base + 3], 0);
        assert!(packed.compensation().is_empty());
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let desc = ConvDesc::new(1, 4, 4, (4, 4), (3, 3));
        let plan = plan_dense(&desc, &caps(IsaLevel::Avx2), &JitConfig::default()).unwrap();
        let f = |_: WeightIndex| 1i8;
        assert!(matches!(
            PackedWeights::pack(&plan, WeightAccessor::S8(&f)),
            Err(JitError::BufferMismatch(_))
        ));
    }
}
