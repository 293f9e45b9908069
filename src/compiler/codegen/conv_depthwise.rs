//! Depthwise convolution kernel generator.
//!
//! Channels are the vector dimension: every lane is an independent
//! channel, so there is no reduction across lanes. 8-bit sources are
//! widened to 32 bits, the zero point is subtracted inline and the product
//! with the pre-widened weights is accumulated with `vpmulld`. Kernel rows
//! outside the input are skipped outright since padding contributes zero
//! once the zero point is subtracted.

use crate::compiler::abi::{OFF_KH_TOP, OFF_KH_TRIP};
use crate::compiler::ir::ProblemDescriptor;
use crate::compiler::planner::{plan_depthwise, DotProduct, ExecutionPlan, SpatialVariant};
use crate::compiler::regalloc::{Gpr, VectorRoles};
use crate::config::JitConfig;
use crate::dispatch::CapabilitySet;
use crate::types::{JitError, JitResult};

use super::accumulators::{broadcast_operands, emit_epilogue, init_accumulators, load_call_record, param};
use super::emitter::EmittedCode;
use super::simd_ops::{MemOperand, SimdOps};
use super::x86_64::{X86Emitter, SRC_STAGE};
use super::KernelGenerator;

/// Convolutions with `groups == ic == oc`.
pub struct DepthwiseConvGenerator;

impl KernelGenerator for DepthwiseConvGenerator {
    fn name(&self) -> &'static str {
        "depthwise-conv"
    }

    fn validate(&self, desc: &ProblemDescriptor, caps: &CapabilitySet, cfg: &JitConfig) -> JitResult<ExecutionPlan> {
        match desc {
            ProblemDescriptor::Conv(d) => plan_depthwise(d, caps, cfg),
            ProblemDescriptor::Gemm(_) => Err(JitError::InvalidDescriptor(
                "depthwise generator given a gemm descriptor".into(),
            )),
        }
    }

    fn generate(&self, plan: &ExecutionPlan) -> JitResult<EmittedCode> {
        emit_depthwise_kernel(plan)
    }
}

pub(crate) fn emit_depthwise_kernel(plan: &ExecutionPlan) -> JitResult<EmittedCode> {
    if !matches!(plan.dot, DotProduct::Widen32 | DotProduct::F32Fma) {
        return Err(JitError::Unsupported(format!(
            "depthwise kernel cannot use {:?}",
            plan.dot
        )));
    }
    let roles = plan.vector_roles()?;
    let mut e = X86Emitter::new(plan.isa, plan.code_capacity)?;
    for v in &plan.variants {
        DepthwiseKernel {
            plan,
            roles: &roles,
            sv: &plan.spatial_variants[v.spatial],
            tail_chunk: v.oc_tail,
        }
        .emit(&mut e)?;
    }
    e.finish()
}

struct DepthwiseKernel<'a> {
    plan: &'a ExecutionPlan,
    roles: &'a VectorRoles,
    sv: &'a SpatialVariant,
    tail_chunk: bool,
}

impl DepthwiseKernel<'_> {
    fn emit(&self, e: &mut X86Emitter) -> JitResult<()> {
        let ur = self.sv.ur_w;
        e.code().begin_function()?;
        load_call_record(e, self.plan)?;
        broadcast_operands(e, self.plan, self.roles)?;
        init_accumulators(e, self.plan, self.roles, ur, self.tail_chunk)?;

        let g = &self.plan.geometry;
        if g.kh == 1 && g.pad_t == 0 && g.pad_b == 0 {
            self.row(e)?;
        } else {
            let row_stride = self.plan.weights.row_stride;
            let src_row = g.dil_h * g.iw * g.src_pixel_stride * self.plan.src_type.size();
            let kh = Gpr::KhCounter.reg64();
            let mut top = e.code().new_label();
            let mut done = e.code().new_label();
            e.load_gpr(Gpr::KhCounter, param(OFF_KH_TOP))?;
            e.add_scaled(Gpr::Weights, Gpr::KhCounter, row_stride)?;
            e.load_gpr(Gpr::KhCounter, param(OFF_KH_TRIP))?;
            e.asm().test(kh, kh)?;
            e.asm().jz(done)?;
            e.code().bind(&mut top)?;
            self.row(e)?;
            e.add_imm(Gpr::Weights, row_stride)?;
            e.add_imm(Gpr::Src, src_row)?;
            e.asm().dec(kh)?;
            e.asm().jnz(top)?;
            e.code().bind(&mut done)?;
        }

        emit_epilogue(e, self.plan, self.roles, ur, self.tail_chunk)?;
        e.code().end_function()
    }

    fn row(&self, e: &mut X86Emitter) -> JitResult<()> {
        let plan = self.plan;
        let g = &plan.geometry;
        let nb = plan.nb_oc_blocking;
        let sz = plan.src_type.size();
        let src = self.roles.src;
        for k in 0..g.kw {
            for ocb in 0..nb {
                let tail = self.tail_chunk && ocb + 1 == nb;
                let wmem = MemOperand::new(
                    Gpr::Weights,
                    (ocb * plan.weights.block_stride + k * plan.vector_bytes()) as i32,
                );
                for jj in (0..self.sv.ur_w).filter(|&jj| self.sv.tap_valid(jj, k, g.kw)) {
                    let disp = ((jj * g.stride_w + k * g.dil_w) * g.src_pixel_stride + ocb * plan.simd_lanes) * sz;
                    let mut mem = MemOperand::new(Gpr::Src, disp as i32);
                    if tail {
                        // channels past the tail may lie beyond the buffer
                        e.copy_elems(SRC_STAGE, mem, plan.oc_tail, plan.src_type)?;
                        mem = SRC_STAGE;
                    }
                    let acc = self.roles.acc(jj, ocb);
                    match plan.dot {
                        DotProduct::Widen32 => {
                            e.vwiden_bytes_to_dwords(src, mem, plan.src_type.is_signed_int8())?;
                            if let Some(zp) = self.roles.zero_point {
                                e.vsub_i32(src, src, zp)?;
                            }
                            e.vpmulld_mem(src, src, wmem)?;
                            e.vadd_i32(acc, acc, src)?;
                        }
                        _ => {
                            e.vload(src, mem)?;
                            e.vfmadd231_mem(acc, src, wmem)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::ConvDesc;
    use crate::dispatch::IsaLevel;
    use crate::types::DataType;
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    fn mnemonics(code: &[u8]) -> Vec<Mnemonic> {
        let mut d = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
        let mut out = Vec::new();
        while d.can_decode() {
            out.push(d.decode().mnemonic());
        }
        out
    }

    fn depthwise(channels: usize) -> ConvDesc {
        ConvDesc::new(1, channels, channels, (7, 7), (3, 3)).groups(channels).pad(1)
    }

    #[test]
    fn int8_widens_and_multiplies() {
        let desc = depthwise(16)
            .types(DataType::U8, DataType::S8, DataType::S32)
            .src_zero_point(3);
        let plan = plan_depthwise(&desc, &CapabilitySet::for_level(IsaLevel::Avx2), &JitConfig::default()).unwrap();
        let code = emit_depthwise_kernel(&plan).unwrap();
        let m = mnemonics(&code.code);
        assert!(m.contains(&Mnemonic::Vpmovzxbd));
        assert!(m.contains(&Mnemonic::Vpmulld));
        assert!(m.contains(&Mnemonic::Vpsubd));
        assert_eq!(code.entries.len(), plan.variants.len());
    }

    #[test]
    fn channel_tail_stages_source() {
        let desc = depthwise(12);
        let plan = plan_depthwise(&desc, &CapabilitySet::for_level(IsaLevel::Avx2), &JitConfig::default()).unwrap();
        assert_eq!(plan.oc_tail, 4);
        let code = emit_depthwise_kernel(&plan).unwrap();
        let m = mnemonics(&code.code);
        assert!(m.contains(&Mnemonic::Vfmadd231ps));
        assert_eq!(m.iter().filter(|&&x| x == Mnemonic::Ret).count(), plan.variants.len());
    }
}
