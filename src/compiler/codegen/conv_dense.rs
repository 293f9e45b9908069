//! Dense convolution kernel generator. GEMM reuses it through the 1x1
//! geometry in [`super::gemm`].
//!
//! One entry point per (spatial variant, output-channel chunk kind). Each
//! call computes `ur_w` output pixels by `nb_oc_blocking` channel vectors
//! for one output row:
//!
//! ```text
//! acc = bias | compensation | partial sums
//! [shift rows above the input]        compensation only
//! for kh in trip:                     rows overlapping the input
//!     for ic packs (unrolled):
//!         for kw: weights[ocb] <- w; for jj: src <- x; acc += src . w
//! [shift rows below the input]
//! epilogue(acc)
//! ```
//!
//! Padded taps along W are resolved at generation time from the variant's
//! validity mask. With precomputed compensation a padded tap still
//! multiplies the (shift + zero point) pattern so the preloaded correction
//! cancels exactly; kernel rows outside the input do the same through the
//! shift-row loops.

use crate::compiler::abi::{OFF_KH_BOTTOM, OFF_KH_TOP, OFF_KH_TRIP};
use crate::compiler::ir::ProblemDescriptor;
use crate::compiler::planner::{plan_dense, CompensationMode, DotProduct, ExecutionPlan, SpatialVariant};
use crate::compiler::regalloc::{Gpr, VectorRoles};
use crate::config::JitConfig;
use crate::dispatch::CapabilitySet;
use crate::types::{JitError, JitResult};

use super::accumulators::{broadcast_operands, emit_epilogue, init_accumulators, load_call_record, param};
use super::emitter::EmittedCode;
use super::simd_ops::{MemOperand, SimdOps, VReg};
use super::x86_64::X86Emitter;
use super::KernelGenerator;

/// Grouped and ungrouped dense convolutions.
pub struct DenseConvGenerator;

impl KernelGenerator for DenseConvGenerator {
    fn name(&self) -> &'static str {
        "dense-conv"
    }

    fn validate(&self, desc: &ProblemDescriptor, caps: &CapabilitySet, cfg: &JitConfig) -> JitResult<ExecutionPlan> {
        match desc {
            ProblemDescriptor::Conv(d) => plan_dense(d, caps, cfg),
            ProblemDescriptor::Gemm(_) => Err(JitError::InvalidDescriptor(
                "dense convolution generator given a gemm descriptor".into(),
            )),
        }
    }

    fn generate(&self, plan: &ExecutionPlan) -> JitResult<EmittedCode> {
        emit_reduction_kernel(plan)
    }
}

/// Emit every variant of a dense or GEMM plan into one routine.
pub(crate) fn emit_reduction_kernel(plan: &ExecutionPlan) -> JitResult<EmittedCode> {
    if matches!(plan.dot, DotProduct::Widen32) {
        return Err(JitError::Unsupported(format!(
            "{} plan carries a depthwise dot product",
            plan.family
        )));
    }
    let roles = plan.vector_roles()?;
    let mut e = X86Emitter::new(plan.isa, plan.code_capacity)?;
    for v in &plan.variants {
        let kernel = ReductionKernel {
            plan,
            roles: &roles,
            sv: &plan.spatial_variants[v.spatial],
            tail_chunk: v.oc_tail,
        };
        kernel.emit(&mut e)?;
    }
    let code = e.finish()?;
    log::debug!(
        "{}: {} entries, {} bytes",
        plan.family,
        code.entries.len(),
        code.code.len()
    );
    Ok(code)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RowMode {
    /// Row overlaps the input.
    Input,
    /// Row lies in vertical padding: only the shift pattern is reduced.
    Shifted,
}

struct ReductionKernel<'a> {
    plan: &'a ExecutionPlan,
    roles: &'a VectorRoles,
    sv: &'a SpatialVariant,
    tail_chunk: bool,
}

impl ReductionKernel<'_> {
    fn compensating(&self) -> bool {
        self.plan.compensation == CompensationMode::Precomputed
    }

    fn nb(&self) -> usize {
        self.plan.nb_oc_blocking
    }

    fn emit(&self, e: &mut X86Emitter) -> JitResult<()> {
        let ur = self.sv.ur_w;
        e.code().begin_function()?;
        load_call_record(e, self.plan)?;
        broadcast_operands(e, self.plan, self.roles)?;
        init_accumulators(e, self.plan, self.roles, ur, self.tail_chunk)?;
        self.kernel_rows(e)?;
        emit_epilogue(e, self.plan, self.roles, ur, self.tail_chunk)?;
        e.code().end_function()
    }

    fn kernel_rows(&self, e: &mut X86Emitter) -> JitResult<()> {
        let g = &self.plan.geometry;
        if g.kh == 1 && g.pad_t == 0 && g.pad_b == 0 {
            return self.row(e, RowMode::Input);
        }
        let row_stride = self.plan.weights.row_stride;
        let src_row = g.dil_h * g.iw * g.src_pixel_stride * self.plan.src_type.size();
        if self.compensating() {
            self.counted_rows(e, OFF_KH_TOP, RowMode::Shifted, 0)?;
        } else {
            e.load_gpr(Gpr::KhCounter, param(OFF_KH_TOP))?;
            e.add_scaled(Gpr::Weights, Gpr::KhCounter, row_stride)?;
        }
        self.counted_rows(e, OFF_KH_TRIP, RowMode::Input, src_row)?;
        if self.compensating() {
            self.counted_rows(e, OFF_KH_BOTTOM, RowMode::Shifted, 0)?;
        }
        Ok(())
    }

    /// Run `row` as many times as the call record says, advancing the
    /// weights by one kernel row and the source by `src_row` bytes.
    fn counted_rows(&self, e: &mut X86Emitter, count: i32, mode: RowMode, src_row: usize) -> JitResult<()> {
        let mut top = e.code().new_label();
        let mut done = e.code().new_label();
        let kh = Gpr::KhCounter.reg64();
        e.load_gpr(Gpr::KhCounter, param(count))?;
        e.asm().test(kh, kh)?;
        e.asm().jz(done)?;
        e.code().bind(&mut top)?;
        self.row(e, mode)?;
        e.add_imm(Gpr::Weights, self.plan.weights.row_stride)?;
        e.add_imm(Gpr::Src, src_row)?;
        e.asm().dec(kh)?;
        e.asm().jnz(top)?;
        e.code().bind(&mut done)
    }

    fn row(&self, e: &mut X86Emitter, mode: RowMode) -> JitResult<()> {
        let plan = self.plan;
        let roles = self.roles;
        e.mov_gpr(Gpr::AuxSrc, Gpr::Src)?;
        e.mov_gpr(Gpr::AuxWeights, Gpr::Weights)?;
        if mode == RowMode::Shifted {
            // weight registers double as per-block row sums
            for &w in &roles.weights {
                e.vzero(w)?;
            }
        }

        let packs = plan.packs_per_call();
        let full = packs - usize::from(plan.ic_remainder > 0);
        let unroll = plan.ic_unroll.max(1);
        let chunks = full / unroll;
        let leftover = full % unroll;
        if chunks > 0 {
            let looped = chunks > 1;
            let mut lp = None;
            if looped {
                let mut label = e.code().new_label();
                e.mov_imm(Gpr::IcCounter, chunks)?;
                e.code().bind(&mut label)?;
                lp = Some(label);
            }
            for p in 0..unroll {
                self.pack(e, mode, p, false)?;
            }
            e.add_imm(Gpr::AuxSrc, unroll * plan.ic_pack * plan.src_type.size())?;
            e.add_imm(Gpr::AuxWeights, unroll * plan.vector_bytes())?;
            if let Some(label) = lp {
                e.asm().dec(Gpr::IcCounter.reg64())?;
                e.asm().jnz(label)?;
            }
        }
        for p in 0..leftover {
            self.pack(e, mode, p, false)?;
        }
        if plan.ic_remainder > 0 {
            self.pack(e, mode, leftover, true)?;
        }

        if mode == RowMode::Shifted {
            for ocb in 0..self.nb() {
                let sum = roles.weights[ocb];
                for jj in 0..self.sv.ur_w {
                    let acc = roles.acc(jj, ocb);
                    e.vadd_i32(acc, acc, sum)?;
                }
            }
        }
        Ok(())
    }

    fn pack(&self, e: &mut X86Emitter, mode: RowMode, p: usize, remainder: bool) -> JitResult<()> {
        for k in 0..self.plan.geometry.kw {
            match mode {
                RowMode::Input => self.input_step(e, k, p, remainder)?,
                RowMode::Shifted => self.shifted_step(e, k, p)?,
            }
        }
        Ok(())
    }

    /// Weight vector of block `ocb`, tap `k`, pack `p` relative to the
    /// current input-channel position.
    fn weight_mem(&self, ocb: usize, k: usize, p: usize) -> MemOperand {
        let plan = self.plan;
        let disp = ocb * plan.weights.block_stride + (k * plan.n_packs + p) * plan.vector_bytes();
        MemOperand::new(Gpr::AuxWeights, disp as i32)
    }

    fn input_step(&self, e: &mut X86Emitter, k: usize, p: usize, remainder: bool) -> JitResult<()> {
        let kw = self.plan.geometry.kw;
        let comp = self.compensating();
        let active: Vec<usize> = (0..self.sv.ur_w)
            .filter(|&jj| comp || self.sv.tap_valid(jj, k, kw))
            .collect();
        if active.is_empty() {
            return Ok(());
        }
        for ocb in 0..self.nb() {
            e.vload(self.roles.weights[ocb], self.weight_mem(ocb, k, p))?;
        }
        for jj in active {
            let operand = if self.sv.tap_valid(jj, k, kw) {
                self.load_src(e, jj, k, p, remainder)?;
                self.roles.src
            } else {
                self.zero_point()?
            };
            for ocb in 0..self.nb() {
                self.dot(e, self.roles.acc(jj, ocb), operand, self.roles.weights[ocb])?;
            }
        }
        Ok(())
    }

    /// Reduce the shift pattern against one weight step into the row sums.
    fn shifted_step(&self, e: &mut X86Emitter, k: usize, p: usize) -> JitResult<()> {
        let zp = self.zero_point()?;
        let tmp = self.roles.src;
        for ocb in 0..self.nb() {
            e.vload(tmp, self.weight_mem(ocb, k, p))?;
            self.dot(e, self.roles.weights[ocb], zp, tmp)?;
        }
        Ok(())
    }

    fn zero_point(&self) -> JitResult<VReg> {
        self.roles
            .zero_point
            .ok_or_else(|| JitError::Assembler("compensating kernel without a zero-point register".into()))
    }

    fn load_src(&self, e: &mut X86Emitter, jj: usize, k: usize, p: usize, remainder: bool) -> JitResult<()> {
        let plan = self.plan;
        let g = &plan.geometry;
        let disp = ((jj * g.stride_w + k * g.dil_w) * g.src_pixel_stride + p * plan.ic_pack) * plan.src_type.size();
        let mem = MemOperand::new(Gpr::AuxSrc, disp as i32);
        let src = self.roles.src;
        match plan.dot {
            DotProduct::F32Fma => e.vbroadcast_f32(src, mem),
            DotProduct::Pairs16 => {
                if remainder {
                    e.gather_bytes(mem, plan.ic_remainder)?;
                    e.vbroadcast_word_eax(src)?;
                } else {
                    e.vbroadcast_word(src, mem)?;
                }
                if let Some(shift) = self.roles.sign_shift {
                    e.vxor(src, src, shift)?;
                }
                e.vwiden_bytes_to_words(src, src)
            }
            DotProduct::Quads8 => {
                if remainder {
                    e.gather_bytes(mem, plan.ic_remainder)?;
                    e.vbroadcast_dword_eax(src)?;
                } else {
                    e.vbroadcast_dword(src, mem)?;
                }
                if let Some(shift) = self.roles.sign_shift {
                    e.vxor(src, src, shift)?;
                }
                Ok(())
            }
            DotProduct::Widen32 => Err(JitError::Unsupported("widening dot product in a dense kernel".into())),
        }
    }

    /// `acc += a . w` for the plan's dot product.
    fn dot(&self, e: &mut X86Emitter, acc: VReg, a: VReg, w: VReg) -> JitResult<()> {
        match self.plan.dot {
            DotProduct::F32Fma => e.vfmadd231(acc, a, w),
            DotProduct::Pairs16 => {
                let tmp = self
                    .roles
                    .dot_tmp
                    .ok_or_else(|| JitError::Assembler("pairwise dot product without a temporary".into()))?;
                e.vpmaddwd(tmp, a, w)?;
                e.vadd_i32(acc, acc, tmp)
            }
            DotProduct::Quads8 => e.vpdpbusd(acc, a, w),
            DotProduct::Widen32 => Err(JitError::Unsupported("widening dot product in a dense kernel".into())),
        }
    }
}
