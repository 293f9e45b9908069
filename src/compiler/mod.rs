//! Kernel compiler: planning, code generation and routine caching.
//!
//! # Pipeline
//!
//! ```text
//! ProblemDescriptor ─┐
//! CapabilitySet ─────┼─→ planner::plan → ExecutionPlan → KernelGenerator → GeneratedRoutine
//! JitConfig ─────────┘                      │                                   ↑
//!                                           └── fingerprint ──→ KernelCache ────┘
//! ```

pub mod abi;
pub mod buffer_alloc;
pub mod cache;
pub mod codegen;
pub mod executable;
pub mod hw_constraints;
pub mod ir;
pub mod planner;
pub mod regalloc;

use std::sync::{Arc, OnceLock};

pub use abi::CallRecord;
pub use cache::{CacheSource, CacheStats, KernelCache};
pub use executable::{GeneratedRoutine, KernelFn};
pub use planner::ExecutionPlan;

use crate::config::JitConfig;
use crate::dispatch::{capabilities, CapabilitySet};
use crate::types::JitResult;
use ir::ProblemDescriptor;

/// A plan and the routine generated from it.
#[derive(Debug, Clone)]
pub struct CompiledKernel {
    pub plan: Arc<ExecutionPlan>,
    pub routine: Arc<GeneratedRoutine>,
}

/// Plans problems against one capability set and caches the routines.
///
/// Typically created once per process (see [`KernelCompiler::global`]) and
/// shared; every method takes `&self`.
pub struct KernelCompiler {
    caps: CapabilitySet,
    config: JitConfig,
    cache: KernelCache,
}

impl KernelCompiler {
    pub fn new(caps: CapabilitySet, config: JitConfig) -> Self {
        KernelCompiler {
            caps,
            config,
            cache: KernelCache::new(),
        }
    }

    /// Compiler for the detected host with the environment configuration.
    pub fn host() -> Self {
        Self::new(*capabilities(), crate::config::global().clone())
    }

    /// Process-wide host compiler.
    pub fn global() -> &'static KernelCompiler {
        static GLOBAL: OnceLock<KernelCompiler> = OnceLock::new();
        GLOBAL.get_or_init(KernelCompiler::host)
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn cache(&self) -> &KernelCache {
        &self.cache
    }

    pub fn plan(&self, desc: &ProblemDescriptor) -> JitResult<ExecutionPlan> {
        planner::plan(desc, &self.caps, &self.config)
    }

    /// Plan `desc` and return its routine, generating it on first use.
    pub fn compile(&self, desc: &ProblemDescriptor) -> JitResult<CompiledKernel> {
        let plan = self.plan(desc)?;
        self.compile_plan(plan)
    }

    pub fn compile_plan(&self, plan: ExecutionPlan) -> JitResult<CompiledKernel> {
        let key = plan.fingerprint();
        let (routine, source) = self.cache.get_or_generate(key, || generate(&plan, key))?;
        if source == CacheSource::Cached {
            log::debug!("{} routine {key:016x} served from cache", plan.family);
        }
        Ok(CompiledKernel {
            plan: Arc::new(plan),
            routine,
        })
    }
}

/// Generate and map the routine for `plan`, bypassing any cache.
pub fn generate(plan: &ExecutionPlan, key: u64) -> JitResult<GeneratedRoutine> {
    let generator: &dyn codegen::KernelGenerator = match plan.family {
        planner::KernelFamily::DenseConv => &codegen::DenseConvGenerator,
        planner::KernelFamily::DepthwiseConv => &codegen::DepthwiseConvGenerator,
        planner::KernelFamily::Gemm => &codegen::GemmGenerator,
    };
    let code = generator.generate(plan)?;
    log::info!(
        "generated {} routine {key:016x}: isa={} {} bytes, {} entries",
        plan.family,
        plan.isa,
        code.code.len(),
        code.entries.len()
    );
    GeneratedRoutine::new(code, key)
}
