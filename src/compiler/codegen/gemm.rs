//! Quantized GEMM generator.
//!
//! `C[M][N] = A[M][K] x B[K][N]` is the dense reduction kernel on a 1x1
//! geometry: rows of A are output "pixels" (`lda` apart), K is the input
//! channel dimension and N the output channels. B is packed like a 1x1
//! convolution weight, with the zero-point compensation of A folded in.

use crate::compiler::ir::ProblemDescriptor;
use crate::compiler::planner::{plan_gemm, ExecutionPlan};
use crate::config::JitConfig;
use crate::dispatch::CapabilitySet;
use crate::types::{JitError, JitResult};

use super::conv_dense::emit_reduction_kernel;
use super::emitter::EmittedCode;
use super::KernelGenerator;

pub struct GemmGenerator;

impl KernelGenerator for GemmGenerator {
    fn name(&self) -> &'static str {
        "gemm"
    }

    fn validate(&self, desc: &ProblemDescriptor, caps: &CapabilitySet, cfg: &JitConfig) -> JitResult<ExecutionPlan> {
        match desc {
            ProblemDescriptor::Gemm(g) => plan_gemm(g, caps, cfg),
            ProblemDescriptor::Conv(_) => Err(JitError::InvalidDescriptor(
                "gemm generator given a convolution descriptor".into(),
            )),
        }
    }

    fn generate(&self, plan: &ExecutionPlan) -> JitResult<EmittedCode> {
        emit_reduction_kernel(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::GemmDesc;
    use crate::compiler::planner::KernelFamily;
    use crate::dispatch::IsaLevel;
    use crate::types::DataType;
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    #[test]
    fn gemm_is_a_single_row_kernel() {
        let desc: ProblemDescriptor = GemmDesc::new(10, 24, 7)
            .types(DataType::S8, DataType::S8, DataType::S32)
            .into();
        let caps = CapabilitySet::for_level(IsaLevel::Avx2);
        let plan = GemmGenerator.validate(&desc, &caps, &JitConfig::default()).unwrap();
        assert_eq!(plan.family, KernelFamily::Gemm);
        let code = GemmGenerator.generate(&plan).unwrap();
        let mut d = Decoder::with_ip(64, &code.code, 0, DecoderOptions::NONE);
        let mut rets = 0;
        let mut loads_kh = false;
        while d.can_decode() {
            let ins = d.decode();
            rets += usize::from(ins.mnemonic() == Mnemonic::Ret);
            // no kernel-row loop: r13 is never loaded from the call record
            loads_kh |= ins.mnemonic() == Mnemonic::Mov && ins.op0_register() == iced_x86::Register::R13;
        }
        assert_eq!(rets, plan.variants.len());
        assert!(!loads_kh);
    }

    #[test]
    fn rejects_convolutions() {
        let desc: ProblemDescriptor = crate::compiler::ir::ConvDesc::new(1, 4, 4, (4, 4), (1, 1)).into();
        let caps = CapabilitySet::for_level(IsaLevel::Avx2);
        assert!(matches!(
            GemmGenerator.validate(&desc, &caps, &JitConfig::default()),
            Err(JitError::InvalidDescriptor(_))
        ));
    }
}
