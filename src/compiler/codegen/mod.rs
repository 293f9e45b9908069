//! Kernel generators and the machinery they share.
//!
//! A [`KernelGenerator`] owns one primitive family. `validate` is the
//! capability-aware planning step: it either returns a complete
//! [`ExecutionPlan`] or rejects the problem with
//! [`JitError::Unsupported`](crate::types::JitError::Unsupported) so the
//! caller can fall back. `generate` turns an accepted plan into assembled
//! bytes with one entry point per kernel variant.

pub mod accumulators;
pub mod conv_dense;
pub mod conv_depthwise;
pub mod emitter;
pub mod gemm;
pub mod math_approx;
pub mod post_ops;
pub mod simd_ops;
pub mod x86_64;

use crate::compiler::ir::ProblemDescriptor;
use crate::compiler::planner::ExecutionPlan;
use crate::config::JitConfig;
use crate::dispatch::CapabilitySet;
use crate::types::JitResult;

pub use conv_dense::DenseConvGenerator;
pub use conv_depthwise::DepthwiseConvGenerator;
pub use emitter::EmittedCode;
pub use gemm::GemmGenerator;

pub trait KernelGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, desc: &ProblemDescriptor, caps: &CapabilitySet, cfg: &JitConfig) -> JitResult<ExecutionPlan>;

    fn generate(&self, plan: &ExecutionPlan) -> JitResult<EmittedCode>;
}

/// Generator that owns the descriptor's family.
pub fn select_generator(desc: &ProblemDescriptor) -> &'static dyn KernelGenerator {
    match desc {
        ProblemDescriptor::Conv(c) if c.is_depthwise() => &DepthwiseConvGenerator,
        ProblemDescriptor::Conv(_) => &DenseConvGenerator,
        ProblemDescriptor::Gemm(_) => &GemmGenerator,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{ConvDesc, GemmDesc};

    #[test]
    fn families_route_to_their_generator() {
        let dense: ProblemDescriptor = ConvDesc::new(1, 4, 8, (5, 5), (3, 3)).into();
        let dw: ProblemDescriptor = ConvDesc::new(1, 8, 8, (5, 5), (3, 3)).groups(8).into();
        let grouped: ProblemDescriptor = ConvDesc::new(1, 8, 8, (5, 5), (3, 3)).groups(2).into();
        let gemm: ProblemDescriptor = GemmDesc::new(4, 4, 4).into();
        assert_eq!(select_generator(&dense).name(), "dense-conv");
        assert_eq!(select_generator(&dw).name(), "depthwise-conv");
        assert_eq!(select_generator(&grouped).name(), "dense-conv");
        assert_eq!(select_generator(&gemm).name(), "gemm");
    }
}
