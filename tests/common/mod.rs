//! Scalar reference implementations shared by the integration tests.
#![allow(dead_code)]

use convjit::{
    capabilities, CapabilitySet, ConvDesc, DataType, GemmDesc, IsaLevel, JitConfig, KernelCompiler, PostOp, Scales,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Levels the host can actually run, lowest first.
pub fn runnable_levels() -> Vec<IsaLevel> {
    [IsaLevel::Avx2, IsaLevel::Avx512Core, IsaLevel::Avx512CoreVnni]
        .into_iter()
        .filter(|&l| capabilities().supports(l))
        .collect()
}

/// Compiler restricted to `level` on this host.
pub fn compiler_at(level: IsaLevel) -> KernelCompiler {
    KernelCompiler::new(capabilities().capped(level), JitConfig::default())
}

pub fn compiler_with(config: JitConfig) -> KernelCompiler {
    KernelCompiler::new(*capabilities(), config)
}

/// Route `log` output through the test harness (`RUST_LOG=debug` to see
/// plan decisions).
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// True when the host can execute generated code; tests that run kernels
/// return early otherwise.
pub fn host_runs_kernels() -> bool {
    init_logging();
    let ok = cfg!(target_arch = "x86_64") && capabilities().supports(IsaLevel::Avx2);
    if !ok {
        eprintln!("skipping: host lacks AVX2");
    }
    ok
}

pub fn baseline() -> CapabilitySet {
    CapabilitySet::baseline()
}

pub fn random_f32(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

pub fn random_i8(rng: &mut StdRng, n: usize) -> Vec<i8> {
    (0..n).map(|_| rng.gen_range(-128i32..=127) as i8).collect()
}

pub fn random_u8(rng: &mut StdRng, n: usize) -> Vec<u8> {
    (0..n).map(|_| rng.gen_range(0u32..=255) as u8).collect()
}

/// Raw accumulators `sum (src - zp) * w` in NHWC output order. Taps that
/// land in padding contribute nothing.
pub fn conv_accumulate(d: &ConvDesc, src: &[f64], wei: &[f64]) -> Vec<f64> {
    let (oh, ow) = (d.out_h(), d.out_w());
    let (icg, ocg) = (d.ic_per_group(), d.oc_per_group());
    let zp = d.src_zero_point as f64;
    let mut out = vec![0.0; d.dst_elems()];
    for n in 0..d.batch {
        for y in 0..oh {
            for x in 0..ow {
                for g in 0..d.groups {
                    for oc in 0..ocg {
                        let mut acc = 0.0;
                        for kh in 0..d.kernel_h {
                            let ih = (y * d.stride_h + kh * d.dilation_h) as isize - d.pad_top as isize;
                            if ih < 0 || ih >= d.in_h as isize {
                                continue;
                            }
                            for kw in 0..d.kernel_w {
                                let iw = (x * d.stride_w + kw * d.dilation_w) as isize - d.pad_left as isize;
                                if iw < 0 || iw >= d.in_w as isize {
                                    continue;
                                }
                                for ic in 0..icg {
                                    let s = src[((n * d.in_h + ih as usize) * d.in_w + iw as usize) * d.in_channels
                                        + g * icg
                                        + ic];
                                    let w = wei[(((g * ocg + oc) * icg + ic) * d.kernel_h + kh) * d.kernel_w + kw];
                                    acc += (s - zp) * w;
                                }
                            }
                        }
                        out[((n * oh + y) * ow + x) * d.out_channels + g * ocg + oc] = acc;
                    }
                }
            }
        }
    }
    out
}

/// Raw accumulators of a GEMM, `C` laid out with `ldc`.
pub fn gemm_accumulate(g: &GemmDesc, a: &[f64], b: &[f64]) -> Vec<f64> {
    let zp = g.a_zero_point as f64;
    let mut c = vec![0.0; (g.m - 1) * g.ldc + g.n];
    for m in 0..g.m {
        for n in 0..g.n {
            let mut acc = 0.0;
            for k in 0..g.k {
                acc += (a[m * g.lda + k] - zp) * b[k * g.ldb + n];
            }
            c[m * g.ldc + n] = acc;
        }
    }
    c
}

/// Everything after accumulation: bias, post-ops in order, saturation.
pub struct Epilogue<'a> {
    pub channels: usize,
    pub bias: Option<&'a [f32]>,
    pub bias_scale: f32,
    pub post_ops: &'a [PostOp],
    pub dst_type: DataType,
}

impl Epilogue<'_> {
    /// Final value at flat index `i` (channel `i % channels`) given the
    /// accumulator and the destination value present before the call.
    pub fn apply(&self, i: usize, acc: f64, prev: f32) -> f32 {
        let c = i % self.channels;
        let mut v = acc as f32;
        if let Some(b) = self.bias {
            v += b[c] * self.bias_scale;
        }
        for op in self.post_ops {
            v = match op {
                PostOp::Eltwise(k) => k.eval(v),
                PostOp::Rescale(Scales::PerTensor(s)) => v * s,
                PostOp::Rescale(Scales::PerChannel(s)) => v * s[c],
                PostOp::Sum { scale } => prev.mul_add(*scale, v),
            };
        }
        match self.dst_type {
            DataType::F32 => v,
            t => {
                let (lo, hi) = t.saturation_bounds();
                v.clamp(lo, hi).round_ties_even()
            }
        }
    }
}

pub fn to_f64<T: Copy + Into<f64>>(v: &[T]) -> Vec<f64> {
    v.iter().map(|&x| x.into()).collect()
}

/// Largest absolute difference between two equally long sequences.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}
