//! Execution planner: turns a problem descriptor and a capability set into
//! a concrete, read-only [`ExecutionPlan`].
//!
//! Decisions, in priority order:
//! 1. vector width: the widest ISA the capability set (and `max_isa`) allows
//!    for the element types;
//! 2. output-channel blocking and spatial unroll, bounded by the vector
//!    register file with room for operand, zero-point and post-op registers;
//!    ties go to the larger spatial unroll;
//! 3. spatial variants for every distinct padding pattern along W, plus the
//!    output-channel tail and the input-channel remainder;
//! 4. compensation mode, weight layout and scratch-pad layout.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::cache_params::CacheSizes;
use crate::compiler::buffer_alloc::{ChannelVector, ScratchpadLayout};
use crate::compiler::codegen::post_ops::scratch_for;
use crate::compiler::hw_constraints::HwConstraintChecker;
use crate::compiler::ir::{hash_post_ops, ConvDesc, GemmDesc, PostOp, ProblemDescriptor, Scales};
use crate::compiler::regalloc::{RoleRequest, VectorRoles};
use crate::config::JitConfig;
use crate::dispatch::{CapabilitySet, IsaLevel};
use crate::types::{DataType, JitError, JitResult};

/// Primitive family a plan belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelFamily {
    DenseConv,
    DepthwiseConv,
    Gemm,
}

impl std::fmt::Display for KernelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            KernelFamily::DenseConv => "dense-conv",
            KernelFamily::DepthwiseConv => "depthwise-conv",
            KernelFamily::Gemm => "gemm",
        })
    }
}

/// How one reduction step combines source and weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DotProduct {
    /// f32 broadcast times weight vector, fused multiply-add (multiply then
    /// add on sse41).
    F32Fma,
    /// 8-bit operands widened to 16 bits, pairs of input channels per
    /// `vpmaddwd`. Exact: no intermediate saturation.
    Pairs16,
    /// Groups of four u8 x s8 products per `vpdpbusd`.
    Quads8,
    /// Depthwise: 8-bit source widened to 32 bits, `vpmulld`.
    Widen32,
}

impl DotProduct {
    /// Input channels consumed per step.
    pub const fn ic_pack(self) -> usize {
        match self {
            DotProduct::F32Fma | DotProduct::Widen32 => 1,
            DotProduct::Pairs16 => 2,
            DotProduct::Quads8 => 4,
        }
    }
}

/// Where the zero-point correction comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompensationMode {
    None,
    /// `-(shift + zero_point) * sum(w)` per output channel, computed while
    /// reordering weights and preloaded into the accumulators.
    Precomputed,
    /// Zero point subtracted from each widened source vector.
    Inline,
}

/// Reduction geometry shared by all families. GEMM maps rows of A onto the
/// W axis; depthwise maps channels onto groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConvGeometry {
    pub mb: usize,
    pub ngroups: usize,
    /// Input channels per group.
    pub ic: usize,
    /// Output channels per group.
    pub oc: usize,
    pub ih: usize,
    pub iw: usize,
    pub oh: usize,
    pub ow: usize,
    pub kh: usize,
    pub kw: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dil_h: usize,
    pub dil_w: usize,
    pub pad_t: usize,
    pub pad_l: usize,
    pub pad_b: usize,
    pub pad_r: usize,
    /// Elements between horizontally adjacent source pixels.
    pub src_pixel_stride: usize,
    /// Elements between horizontally adjacent destination pixels.
    pub dst_pixel_stride: usize,
}

/// Kernel rows of one output row, split by where they land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KhRange {
    pub top_overflow: usize,
    pub trip: usize,
    pub bottom_overflow: usize,
    /// Input row of the first overlapping kernel row (meaningless when
    /// `trip == 0`).
    pub ih_start: isize,
}

impl ConvGeometry {
    pub fn from_conv(d: &ConvDesc) -> Self {
        ConvGeometry {
            mb: d.batch,
            ngroups: d.groups,
            ic: d.ic_per_group(),
            oc: d.oc_per_group(),
            ih: d.in_h,
            iw: d.in_w,
            oh: d.out_h(),
            ow: d.out_w(),
            kh: d.kernel_h,
            kw: d.kernel_w,
            stride_h: d.stride_h,
            stride_w: d.stride_w,
            dil_h: d.dilation_h,
            dil_w: d.dilation_w,
            pad_t: d.pad_top,
            pad_l: d.pad_left,
            pad_b: d.pad_bottom,
            pad_r: d.pad_right,
            src_pixel_stride: d.in_channels,
            dst_pixel_stride: d.out_channels,
        }
    }

    pub fn from_gemm(g: &GemmDesc) -> Self {
        ConvGeometry {
            mb: 1,
            ngroups: 1,
            ic: g.k,
            oc: g.n,
            ih: 1,
            iw: g.m,
            oh: 1,
            ow: g.m,
            kh: 1,
            kw: 1,
            stride_h: 1,
            stride_w: 1,
            dil_h: 1,
            dil_w: 1,
            pad_t: 0,
            pad_l: 0,
            pad_b: 0,
            pad_r: 0,
            src_pixel_stride: g.lda,
            dst_pixel_stride: g.ldc,
        }
    }

    /// Input column read by output column `ow` at tap `k`.
    #[inline]
    pub fn input_col(&self, ow: usize, k: usize) -> isize {
        (ow * self.stride_w + k * self.dil_w) as isize - self.pad_l as isize
    }

    pub fn kh_range(&self, oh: usize) -> KhRange {
        let base = (oh * self.stride_h) as isize - self.pad_t as isize;
        let mut top = 0;
        let mut trip = 0;
        let mut bottom = 0;
        for k in 0..self.kh {
            let r = base + (k * self.dil_h) as isize;
            if r < 0 {
                top += 1;
            } else if r as usize >= self.ih {
                bottom += 1;
            } else {
                trip += 1;
            }
        }
        KhRange {
            top_overflow: top,
            trip,
            bottom_overflow: bottom,
            ih_start: base + (top * self.dil_h) as isize,
        }
    }
}

/// Padding pattern of one output-column block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Interior,
    LeftPadded,
    RightPadded,
    BothPadded,
}

/// One straight-line block shape along W: how many output columns it
/// covers and which (column, tap) pairs read real input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpatialVariant {
    pub ur_w: usize,
    /// `valid[jj * kw + k]`: column `jj` at tap `k` reads inside the row.
    pub valid: Vec<bool>,
    pub edge: EdgeKind,
}

impl SpatialVariant {
    #[inline]
    pub fn tap_valid(&self, jj: usize, k: usize, kw: usize) -> bool {
        self.valid[jj * kw + k]
    }
}

/// Start column of a block and the spatial variant serving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwBlock {
    pub ow_start: usize,
    pub spatial: usize,
}

/// One entry point of the generated routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelVariant {
    pub spatial: usize,
    /// Serves the last output-channel chunk, whose final block is partial.
    pub oc_tail: bool,
}

/// Input-channel split of float reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IcSplit {
    pub chunks: usize,
    /// Input channels reduced per call.
    pub chunk_channels: usize,
}

/// Byte geometry of the reordered weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeightLayout {
    /// One (tap, pack) step of one channel block; equals the vector width.
    pub vector_bytes: usize,
    pub row_stride: usize,
    pub block_stride: usize,
    pub group_stride: usize,
    pub total_bytes: usize,
    /// s32 compensation entries stored next to the weights.
    pub compensation_len: usize,
}

/// Register usage the plan commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterBudget {
    pub vreg_count: usize,
    pub accumulators: usize,
    pub reserved: usize,
}

impl RegisterBudget {
    pub fn peak(&self) -> usize {
        self.accumulators + self.reserved
    }
}

/// Read-only description of the code to generate and how to drive it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub family: KernelFamily,
    pub isa: IsaLevel,
    pub dot: DotProduct,
    pub src_type: DataType,
    pub wei_type: DataType,
    pub dst_type: DataType,
    pub bias_type: Option<DataType>,
    pub geometry: ConvGeometry,
    /// 32-bit lanes per vector register.
    pub simd_lanes: usize,
    pub vreg_count: usize,
    /// Channel blocks per group (output channels, or channels for depthwise).
    pub nb_oc_total: usize,
    pub nb_oc_blocking: usize,
    /// Valid lanes of the last channel block; 0 when it is full.
    pub oc_tail: usize,
    pub ur_w: usize,
    pub ic_pack: usize,
    /// Packs per kernel tap over all input channels of a group.
    pub n_packs: usize,
    /// Valid channels in the last pack; 0 when it is full.
    pub ic_remainder: usize,
    /// Packs per iteration of the run-time input-channel loop.
    pub ic_unroll: usize,
    pub ic_split: IcSplit,
    pub compensation: CompensationMode,
    /// Added to signed 8-bit sources to make them unsigned.
    pub src_shift: i32,
    pub src_zero_point: i32,
    pub bias_scale: f32,
    pub post_ops: Vec<PostOp>,
    pub spatial_variants: Vec<SpatialVariant>,
    pub ow_blocks: Vec<OwBlock>,
    pub variants: Vec<KernelVariant>,
    pub registers: RegisterBudget,
    pub scratchpad: ScratchpadLayout,
    pub weights: WeightLayout,
    pub code_capacity: usize,
    /// Cache sizes of the capability set the plan was made for.
    pub cache: CacheSizes,
}

impl ExecutionPlan {
    pub fn register_budget(&self) -> RegisterBudget {
        self.registers
    }

    pub fn scratchpad(&self) -> &ScratchpadLayout {
        &self.scratchpad
    }

    /// Vector width in bytes.
    pub fn vector_bytes(&self) -> usize {
        self.simd_lanes * 4
    }

    /// Output-channel chunks per group handled by separate calls.
    pub fn oc_chunks(&self) -> usize {
        self.nb_oc_total / self.nb_oc_blocking
    }

    pub fn chunk_has_tail(&self, chunk: usize) -> bool {
        self.oc_tail != 0 && chunk + 1 == self.oc_chunks()
    }

    /// Padded channels per group.
    pub fn padded_oc(&self) -> usize {
        self.nb_oc_total * self.simd_lanes
    }

    pub fn has_full_chunks(&self) -> bool {
        self.oc_tail == 0 || self.oc_chunks() > 1
    }

    /// Entry-point index for a spatial variant and chunk kind.
    pub fn variant_index(&self, spatial: usize, oc_tail: bool) -> usize {
        if oc_tail && self.has_full_chunks() {
            self.spatial_variants.len() + spatial
        } else {
            spatial
        }
    }

    /// Packs reduced by one call (one input-channel chunk).
    pub fn packs_per_call(&self) -> usize {
        if self.ic_split.chunks > 1 {
            self.ic_split.chunk_channels / self.ic_pack
        } else {
            self.n_packs
        }
    }

    /// True when the kernel converts accumulators to f32 before storing.
    pub fn float_epilogue(&self) -> bool {
        self.dot == DotProduct::F32Fma
            || self.bias_type.is_some()
            || !self.post_ops.is_empty()
            || self.dst_type != DataType::S32
    }

    pub fn role_request(&self) -> RoleRequest {
        role_request(
            self.dot,
            self.vreg_count,
            self.ur_w,
            self.nb_oc_blocking,
            self.src_shift != 0,
            self.compensation != CompensationMode::None,
            epilogue_scratch(&self.post_ops, self.dst_type, self.float_epilogue()),
        )
    }

    /// Register table the generator emits against.
    pub fn vector_roles(&self) -> JitResult<VectorRoles> {
        VectorRoles::resolve(&self.role_request())
    }

    /// Stable hash of everything that shapes the generated bytes.
    pub fn fingerprint(&self) -> u64 {
        let mut h = DefaultHasher::new();
        (self.family, self.isa, self.dot).hash(&mut h);
        (self.src_type, self.wei_type, self.dst_type, self.bias_type).hash(&mut h);
        self.geometry.hash(&mut h);
        (self.simd_lanes, self.nb_oc_total, self.nb_oc_blocking, self.oc_tail, self.ur_w).hash(&mut h);
        (self.ic_pack, self.n_packs, self.ic_remainder, self.ic_unroll, self.ic_split).hash(&mut h);
        (self.compensation, self.src_shift, self.src_zero_point).hash(&mut h);
        self.bias_scale.to_bits().hash(&mut h);
        hash_post_ops(&self.post_ops, &mut h);
        self.spatial_variants.hash(&mut h);
        self.ow_blocks.hash(&mut h);
        self.variants.hash(&mut h);
        self.scratchpad.hash(&mut h);
        self.weights.hash(&mut h);
        self.code_capacity.hash(&mut h);
        h.finish()
    }
}

/// Plan any descriptor through the generator that owns its family.
pub fn plan(desc: &ProblemDescriptor, caps: &CapabilitySet, cfg: &JitConfig) -> JitResult<ExecutionPlan> {
    let generator = crate::compiler::codegen::select_generator(desc);
    generator.validate(desc, caps, cfg)
}

// ── Shared decisions ────────────────────────────────────────────────────────

fn role_request(
    dot: DotProduct,
    vreg_count: usize,
    ur_w: usize,
    nb: usize,
    sign_shift: bool,
    zero_point: bool,
    scratch: usize,
) -> RoleRequest {
    RoleRequest {
        vreg_count,
        ur_w,
        nb_blocks: nb,
        dot_tmp: dot == DotProduct::Pairs16,
        sign_shift,
        zero_point,
        weight_regs: dot != DotProduct::Widen32,
        scratch,
    }
}

pub(crate) fn epilogue_scratch(post_ops: &[PostOp], dst: DataType, float_epilogue: bool) -> usize {
    let ops = post_ops.iter().map(scratch_for).max().unwrap_or(0);
    let store = if float_epilogue && dst != DataType::F32 { 2 } else { 0 };
    ops.max(store)
}

fn effective_caps(caps: &CapabilitySet, cfg: &JitConfig) -> CapabilitySet {
    match cfg.max_isa {
        Some(max) => caps.capped(max),
        None => *caps,
    }
}

fn choose_isa(family: KernelFamily, src: DataType, caps: &CapabilitySet) -> JitResult<(IsaLevel, DotProduct)> {
    let level = caps.isa_level();
    if level < IsaLevel::Avx2 {
        // 8-bit dot products need avx2; f32 falls back to 128-bit vectors
        if src == DataType::F32 && caps.sse41 {
            return Ok((IsaLevel::Baseline, DotProduct::F32Fma));
        }
        let need = if src == DataType::F32 { "sse41" } else { "avx2" };
        return Err(JitError::Unsupported(format!(
            "{family} with {src} source needs at least {need}, capability set offers {caps}"
        )));
    }
    let capped = level.min(IsaLevel::Avx512Core);
    Ok(match (family, src) {
        (_, DataType::F32) => (capped, DotProduct::F32Fma),
        (KernelFamily::DepthwiseConv, _) => (capped, DotProduct::Widen32),
        (_, _) if level == IsaLevel::Avx512CoreVnni => (level, DotProduct::Quads8),
        (_, _) => (level, DotProduct::Pairs16),
    })
}

fn check_types(
    family: KernelFamily,
    src: DataType,
    wei: DataType,
    dst: DataType,
    bias: Option<DataType>,
    zero_point: i32,
) -> JitResult<()> {
    let unsupported = |m: String| Err(JitError::Unsupported(m));
    match (src, wei) {
        (DataType::F32, DataType::F32) => {
            if dst != DataType::F32 {
                return unsupported(format!("f32 {family} cannot write {dst}"));
            }
            if zero_point != 0 {
                return unsupported("zero point on an f32 source".into());
            }
        }
        (DataType::U8 | DataType::S8, DataType::S8) => {}
        _ => return unsupported(format!("{family} {src} x {wei} is not a supported combination")),
    }
    if let Some(b) = bias {
        if !matches!(b, DataType::F32 | DataType::S32) {
            return unsupported(format!("bias type {b}"));
        }
    }
    let zp_ok = match src {
        DataType::U8 => (0..=255).contains(&zero_point),
        DataType::S8 => (-128..=127).contains(&zero_point),
        _ => true,
    };
    if !zp_ok {
        return unsupported(format!("zero point {zero_point} outside the {src} range"));
    }
    Ok(())
}

fn largest_divisor_at_most(n: usize, cap: usize) -> usize {
    (1..=cap.min(n).max(1)).rev().find(|d| n % d == 0).unwrap_or(1)
}

fn build_spatial_variants(geom: &ConvGeometry, ur_w: usize) -> (Vec<SpatialVariant>, Vec<OwBlock>) {
    let mut variants: Vec<SpatialVariant> = Vec::new();
    let mut blocks = Vec::new();
    let mut ow0 = 0;
    while ow0 < geom.ow {
        let ur = ur_w.min(geom.ow - ow0);
        let mut valid = Vec::with_capacity(ur * geom.kw);
        let (mut left, mut right) = (false, false);
        for jj in 0..ur {
            for k in 0..geom.kw {
                let c = geom.input_col(ow0 + jj, k);
                left |= c < 0;
                right |= c >= geom.iw as isize;
                valid.push(c >= 0 && (c as usize) < geom.iw);
            }
        }
        let edge = match (left, right) {
            (false, false) => EdgeKind::Interior,
            (true, false) => EdgeKind::LeftPadded,
            (false, true) => EdgeKind::RightPadded,
            (true, true) => EdgeKind::BothPadded,
        };
        let idx = match variants.iter().position(|v| v.ur_w == ur && v.valid == valid) {
            Some(i) => i,
            None => {
                variants.push(SpatialVariant { ur_w: ur, valid, edge });
                variants.len() - 1
            }
        };
        blocks.push(OwBlock { ow_start: ow0, spatial: idx });
        ow0 += ur;
    }
    (variants, blocks)
}

fn build_kernel_variants(n_spatial: usize, full: bool, tail: bool) -> Vec<KernelVariant> {
    let mut out = Vec::new();
    for (present, oc_tail) in [(full, false), (tail, true)] {
        if present {
            out.extend((0..n_spatial).map(|spatial| KernelVariant { spatial, oc_tail }));
        }
    }
    out
}

/// Bytes of one source load and one dot-product step.
fn step_bytes(isa: IsaLevel, dot: DotProduct) -> (usize, usize) {
    match dot {
        DotProduct::F32Fma if isa == IsaLevel::Baseline => (9, 12),
        DotProduct::F32Fma => (10, 6),
        DotProduct::Pairs16 => (22, 12),
        DotProduct::Quads8 => (14, 6),
        DotProduct::Widen32 => (10, 18),
    }
}

/// Rough upper bound on bytes emitted for one variant.
fn estimate_variant_bytes(
    (src_load, dot_bytes): (usize, usize),
    geom: &ConvGeometry,
    ur_w: usize,
    nb: usize,
    ic_unroll: usize,
    compensation: bool,
    post_ops: usize,
) -> usize {
    // loop body, leftover full packs and the remainder pack
    let steps = geom.kw * (ic_unroll * 2 + 1);
    let per_step = nb * 10 + ur_w * (src_load + nb * dot_bytes);
    let rows = if compensation { 3 } else { 1 };
    let reduction = rows * steps * per_step;
    let epilogue = ur_w * nb * (60 + post_ops * 48);
    256 + reduction + epilogue
}

// ── Dense convolution and GEMM ──────────────────────────────────────────────

struct ReductionProblem<'a> {
    family: KernelFamily,
    geom: ConvGeometry,
    src: DataType,
    wei: DataType,
    dst: DataType,
    bias: Option<DataType>,
    zero_point: i32,
    bias_scale: f32,
    post_ops: &'a [PostOp],
}

pub(crate) fn plan_dense(d: &ConvDesc, caps: &CapabilitySet, cfg: &JitConfig) -> JitResult<ExecutionPlan> {
    d.validate()?;
    plan_reduction(
        ReductionProblem {
            family: KernelFamily::DenseConv,
            geom: ConvGeometry::from_conv(d),
            src: d.src_type,
            wei: d.wei_type,
            dst: d.dst_type,
            bias: d.bias_type,
            zero_point: d.src_zero_point,
            bias_scale: d.bias_scale,
            post_ops: &d.post_ops,
        },
        caps,
        cfg,
    )
}

pub(crate) fn plan_gemm(g: &GemmDesc, caps: &CapabilitySet, cfg: &JitConfig) -> JitResult<ExecutionPlan> {
    g.validate()?;
    if !g.a_type.is_int8() || g.b_type != DataType::S8 {
        return Err(JitError::Unsupported(format!(
            "quantized gemm expects 8-bit A and s8 B, got {} x {}",
            g.a_type, g.b_type
        )));
    }
    plan_reduction(
        ReductionProblem {
            family: KernelFamily::Gemm,
            geom: ConvGeometry::from_gemm(g),
            src: g.a_type,
            wei: g.b_type,
            dst: g.c_type,
            bias: g.bias_type,
            zero_point: g.a_zero_point,
            bias_scale: 1.0,
            post_ops: &g.post_ops,
        },
        caps,
        cfg,
    )
}

fn plan_reduction(p: ReductionProblem<'_>, caps: &CapabilitySet, cfg: &JitConfig) -> JitResult<ExecutionPlan> {
    check_types(p.family, p.src, p.wei, p.dst, p.bias, p.zero_point)?;
    let caps = effective_caps(caps, cfg);
    let (isa, dot) = choose_isa(p.family, p.src, &caps).map_err(|e| {
        log::warn!("{e}");
        e
    })?;
    let geom = p.geom;
    let lanes = isa.vector_bytes() / 4;
    let vreg_count = isa.allocatable_registers();

    let nb_oc_total = geom.oc.div_ceil(lanes);
    let oc_tail = geom.oc % lanes;
    let ic_pack = dot.ic_pack();
    let n_packs = geom.ic.div_ceil(ic_pack);
    let ic_remainder = geom.ic % ic_pack;

    let src_shift = if p.src.is_signed_int8() { 128 } else { 0 };
    let compensation = if p.src.is_int8() && src_shift + p.zero_point != 0 {
        CompensationMode::Precomputed
    } else {
        CompensationMode::None
    };

    let float_epilogue = dot == DotProduct::F32Fma
        || p.bias.is_some()
        || !p.post_ops.is_empty()
        || p.dst != DataType::S32;
    let scratch = epilogue_scratch(p.post_ops, p.dst, float_epilogue);

    // f32 reductions may be split along input channels. The destination then
    // holds partial sums between calls, so a sum post-op forbids it.
    let sizes = caps.cache;
    let has_sum = p.post_ops.iter().any(|op| matches!(op, PostOp::Sum { .. }));
    let ic_split = if dot == DotProduct::F32Fma && !has_sum {
        let per_channel = lanes * 4 * geom.kh * geom.kw;
        let mut chunk = geom.ic;
        if let Some(max) = cfg.max_ic_chunk {
            chunk = largest_divisor_at_most(geom.ic, max);
        } else {
            while chunk > 1 && chunk * per_channel > sizes.l2 / 2 {
                let next = largest_divisor_at_most(geom.ic, chunk / 2);
                if next == chunk {
                    break;
                }
                chunk = next;
            }
        }
        IcSplit { chunks: geom.ic / chunk, chunk_channels: chunk }
    } else {
        IcSplit { chunks: 1, chunk_channels: geom.ic }
    };
    let call_ic = ic_split.chunk_channels;
    let full_packs = if ic_split.chunks > 1 { call_ic } else { geom.ic / ic_pack };
    let ic_unroll = full_packs.clamp(1, if geom.kw >= 3 { 4 } else { 8 });

    // Blocking: (nb, ur) with the largest ur, then the largest nb.
    let l1_budget = sizes.l1d * cfg.l1_budget_percent / 100;
    let src_sz = p.src.size();
    let mut best: Option<(usize, usize)> = None;
    for nb in [4usize, 3, 2, 1] {
        if nb > nb_oc_total || nb_oc_total % nb != 0 {
            continue;
        }
        let req = role_request(dot, vreg_count, 1, nb, src_shift != 0, compensation != CompensationMode::None, scratch);
        let mut ur = req.max_ur_w().min(geom.ow).min(cfg.max_ur_w);
        if ur == 0 {
            continue;
        }
        let weights_ws = nb * geom.kw * call_ic.div_ceil(ic_pack) * lanes * 4;
        let src_ws = |ur: usize| ((ur - 1) * geom.stride_w + (geom.kw - 1) * geom.dil_w + 1) * call_ic * src_sz;
        while ur > 1 && src_ws(ur) + weights_ws > l1_budget && src_ws(ur) > weights_ws {
            ur -= 1;
        }
        let better = match best {
            None => true,
            Some((bnb, bur)) => ur > bur || (ur == bur && nb > bnb),
        };
        if better {
            best = Some((nb, ur));
        }
    }
    let Some((nb, mut ur_w)) = best else {
        return Err(JitError::Unsupported(format!(
            "{family}: no output-channel blocking fits {vreg_count} vector registers",
            family = p.family
        )));
    };

    // Degrade the unroll while the variants would not fit the code budget.
    let comp = compensation != CompensationMode::None;
    let (mut spatial, mut ow_blocks) = build_spatial_variants(&geom, ur_w);
    let full = oc_tail == 0 || nb_oc_total / nb > 1;
    let tail = oc_tail != 0;
    let kinds = usize::from(full) + usize::from(tail);
    let budget = |ur: usize, n_spatial: usize| {
        kinds * n_spatial * estimate_variant_bytes(step_bytes(isa, dot), &geom, ur, nb, ic_unroll, comp, p.post_ops.len())
    };
    while ur_w > 1 && budget(ur_w, spatial.len()) > cfg.code_capacity {
        ur_w -= 1;
        (spatial, ow_blocks) = build_spatial_variants(&geom, ur_w);
    }
    let variants = build_kernel_variants(spatial.len(), full, tail);

    let req = role_request(dot, vreg_count, ur_w, nb, src_shift != 0, comp, scratch);
    let roles = VectorRoles::resolve(&req)?;

    let vector_bytes = lanes * 4;
    let row_stride = geom.kw * n_packs * vector_bytes;
    let block_stride = geom.kh * row_stride;
    let group_stride = nb_oc_total * block_stride;
    let weights = WeightLayout {
        vector_bytes,
        row_stride,
        block_stride,
        group_stride,
        total_bytes: geom.ngroups * group_stride,
        compensation_len: if comp { geom.ngroups * nb_oc_total * lanes } else { 0 },
    };

    let scratchpad = channel_scratchpad(geom.ngroups * nb_oc_total * lanes, p.bias.is_some(), p.post_ops);

    let plan = ExecutionPlan {
        family: p.family,
        isa,
        dot,
        src_type: p.src,
        wei_type: p.wei,
        dst_type: p.dst,
        bias_type: p.bias,
        geometry: geom,
        simd_lanes: lanes,
        vreg_count,
        nb_oc_total,
        nb_oc_blocking: nb,
        oc_tail,
        ur_w,
        ic_pack,
        n_packs,
        ic_remainder,
        ic_unroll,
        ic_split,
        compensation,
        src_shift,
        src_zero_point: p.zero_point,
        bias_scale: p.bias_scale,
        post_ops: p.post_ops.to_vec(),
        spatial_variants: spatial,
        ow_blocks,
        variants,
        registers: RegisterBudget {
            vreg_count,
            accumulators: roles.accumulator_count(),
            reserved: req.reserved(),
        },
        scratchpad,
        weights,
        code_capacity: cfg.code_capacity,
        cache: caps.cache,
    };
    finish(plan)
}

// ── Depthwise convolution ───────────────────────────────────────────────────

pub(crate) fn plan_depthwise(d: &ConvDesc, caps: &CapabilitySet, cfg: &JitConfig) -> JitResult<ExecutionPlan> {
    d.validate()?;
    if !d.is_depthwise() {
        return Err(JitError::Unsupported(format!(
            "depthwise generator needs groups == ic == oc, got g={} ic={} oc={}",
            d.groups, d.in_channels, d.out_channels
        )));
    }
    let family = KernelFamily::DepthwiseConv;
    check_types(family, d.src_type, d.wei_type, d.dst_type, d.bias_type, d.src_zero_point)?;
    let caps = effective_caps(caps, cfg);
    let (isa, dot) = choose_isa(family, d.src_type, &caps).map_err(|e| {
        log::warn!("{e}");
        e
    })?;
    let lanes = isa.vector_bytes() / 4;
    let vreg_count = isa.allocatable_registers();
    let channels = d.groups;
    let mut geom = ConvGeometry::from_conv(d);
    // Channels are vectorised: one "group" of `channels` lanes.
    geom.ic = 1;
    geom.oc = 1;

    let nb_total = channels.div_ceil(lanes);
    let ch_tail = channels % lanes;
    let compensation = if d.src_zero_point != 0 {
        CompensationMode::Inline
    } else {
        CompensationMode::None
    };
    let zp = compensation == CompensationMode::Inline;
    let float_epilogue = dot == DotProduct::F32Fma
        || d.bias_type.is_some()
        || !d.post_ops.is_empty()
        || d.dst_type != DataType::S32;
    let scratch = epilogue_scratch(&d.post_ops, d.dst_type, float_epilogue);

    let mut best: Option<(usize, usize)> = None;
    for nb in [4usize, 3, 2, 1] {
        if nb > nb_total || nb_total % nb != 0 {
            continue;
        }
        let req = role_request(dot, vreg_count, 1, nb, false, zp, scratch);
        let ur = req.max_ur_w().min(geom.ow).min(cfg.max_ur_w);
        if ur == 0 {
            continue;
        }
        let better = match best {
            None => true,
            Some((bnb, bur)) => ur > bur || (ur == bur && nb > bnb),
        };
        if better {
            best = Some((nb, ur));
        }
    }
    let Some((nb, mut ur_w)) = best else {
        return Err(JitError::Unsupported(format!(
            "{family}: no channel blocking fits {vreg_count} vector registers"
        )));
    };

    let (mut spatial, mut ow_blocks) = build_spatial_variants(&geom, ur_w);
    let full = ch_tail == 0 || nb_total / nb > 1;
    let tail = ch_tail != 0;
    let kinds = usize::from(full) + usize::from(tail);
    let budget = |ur: usize, n_spatial: usize| {
        kinds * n_spatial * estimate_variant_bytes(step_bytes(isa, dot), &geom, ur, nb, 1, false, d.post_ops.len()) * geom.kh
    };
    while ur_w > 1 && budget(ur_w, spatial.len()) > cfg.code_capacity {
        ur_w -= 1;
        (spatial, ow_blocks) = build_spatial_variants(&geom, ur_w);
    }
    let variants = build_kernel_variants(spatial.len(), full, tail);

    let req = role_request(dot, vreg_count, ur_w, nb, false, zp, scratch);
    let roles = VectorRoles::resolve(&req)?;

    let vector_bytes = lanes * 4;
    let row_stride = geom.kw * vector_bytes;
    let block_stride = geom.kh * row_stride;
    let weights = WeightLayout {
        vector_bytes,
        row_stride,
        block_stride,
        group_stride: nb_total * block_stride,
        total_bytes: nb_total * block_stride,
        compensation_len: 0,
    };
    let scratchpad = channel_scratchpad(nb_total * lanes, d.bias_type.is_some(), &d.post_ops);

    let plan = ExecutionPlan {
        family,
        isa,
        dot,
        src_type: d.src_type,
        wei_type: d.wei_type,
        dst_type: d.dst_type,
        bias_type: d.bias_type,
        geometry: geom,
        simd_lanes: lanes,
        vreg_count,
        nb_oc_total: nb_total,
        nb_oc_blocking: nb,
        oc_tail: ch_tail,
        ur_w,
        ic_pack: 1,
        n_packs: 1,
        ic_remainder: 0,
        ic_unroll: 1,
        ic_split: IcSplit { chunks: 1, chunk_channels: 1 },
        compensation,
        src_shift: 0,
        src_zero_point: d.src_zero_point,
        bias_scale: d.bias_scale,
        post_ops: d.post_ops.clone(),
        spatial_variants: spatial,
        ow_blocks,
        variants,
        registers: RegisterBudget {
            vreg_count,
            accumulators: roles.accumulator_count(),
            reserved: req.reserved(),
        },
        scratchpad,
        weights,
        code_capacity: cfg.code_capacity,
        cache: caps.cache,
    };
    finish(plan)
}

fn channel_scratchpad(padded_channels: usize, bias: bool, post_ops: &[PostOp]) -> ScratchpadLayout {
    let mut vectors = Vec::new();
    if bias {
        vectors.push(ChannelVector::Bias);
    }
    for (i, op) in post_ops.iter().enumerate() {
        if matches!(op, PostOp::Rescale(Scales::PerChannel(_))) {
            vectors.push(ChannelVector::Scales { post_op: i });
        }
    }
    ScratchpadLayout::new(padded_channels, vectors)
}

fn finish(plan: ExecutionPlan) -> JitResult<ExecutionPlan> {
    let checker = HwConstraintChecker::new(&plan);
    let report = checker.check();
    if let Some(v) = report.violations.first() {
        log::warn!("{} plan rejected: {v}", plan.family);
        return Err(JitError::Unsupported(v.to_string()));
    }
    log::debug!(
        "{} plan: isa={} dot={:?} lanes={} nb_oc={}/{} ur_w={} packs={}x{} (rem {}) split={:?} comp={:?} variants={} regs={}/{}",
        plan.family,
        plan.isa,
        plan.dot,
        plan.simd_lanes,
        plan.nb_oc_blocking,
        plan.nb_oc_total,
        plan.ur_w,
        plan.n_packs,
        plan.ic_pack,
        plan.ic_remainder,
        plan.ic_split,
        plan.compensation,
        plan.variants.len(),
        plan.registers.peak(),
        plan.registers.vreg_count,
    );
    Ok(plan)
}
