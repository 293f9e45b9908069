use crate::compiler::planner::ExecutionPlan;

/// Deepest post-op chain a kernel epilogue will carry.
pub const MAX_EPILOGUE_DEPTH: usize = 16;

/// Result of hardware constraint checking for one plan.
#[derive(Debug, Clone)]
pub struct HwConstraintResult {
    /// Whether all hard constraints are satisfied.
    pub valid: bool,
    /// Vector registers the kernel keeps live at its peak.
    pub register_pressure: usize,
    pub register_limit: usize,
    /// Estimated L1 working set of one reduction step, in bytes.
    pub l1_working_set_bytes: usize,
    /// L1 budget (85% of L1D by default) in bytes.
    pub l1_budget_bytes: usize,
    pub epilogue_depth: usize,
    /// Hard constraint violations (empty if valid).
    pub violations: Vec<ConstraintViolation>,
    /// Soft constraints: the plan still works, only slower.
    pub warnings: Vec<ConstraintViolation>,
}

/// A specific hardware constraint that was violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintViolation {
    /// Register pressure exceeds available SIMD registers.
    RegisterPressure { needed: usize, available: usize },
    /// L1 working set exceeds the L1 budget.
    L1Overflow { working_set: usize, l1_size: usize },
    /// Epilogue chain is too deep for register-resident execution.
    EpilogueTooDeep { depth: usize, max: usize },
    /// An address offset baked into an instruction does not fit in 32 bits.
    DisplacementOverflow { operand: &'static str, bytes: usize },
}

impl std::fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstraintViolation::RegisterPressure { needed, available } => {
                write!(f, "register pressure {needed} exceeds {available} vector registers")
            }
            ConstraintViolation::L1Overflow { working_set, l1_size } => {
                write!(f, "working set {working_set} B exceeds L1 budget of {l1_size} B")
            }
            ConstraintViolation::EpilogueTooDeep { depth, max } => {
                write!(f, "post-op chain of {depth} exceeds the maximum of {max}")
            }
            ConstraintViolation::DisplacementOverflow { operand, bytes } => {
                write!(f, "{operand} offset of {bytes} B does not fit a 32-bit displacement")
            }
        }
    }
}

/// Validates a plan against the register file, L1 capacity, epilogue depth
/// and addressing limits of the target.
pub struct HwConstraintChecker<'a> {
    pub plan: &'a ExecutionPlan,
}

impl<'a> HwConstraintChecker<'a> {
    pub fn new(plan: &'a ExecutionPlan) -> Self {
        HwConstraintChecker { plan }
    }

    pub fn validate_register_pressure(&self) -> Result<(), ConstraintViolation> {
        let needed = self.plan.registers.peak();
        let available = self.plan.vreg_count;
        if needed > available {
            return Err(ConstraintViolation::RegisterPressure { needed, available });
        }
        Ok(())
    }

    pub fn validate_epilogue_depth(&self) -> Result<(), ConstraintViolation> {
        let depth = self.plan.post_ops.len();
        if depth > MAX_EPILOGUE_DEPTH {
            return Err(ConstraintViolation::EpilogueTooDeep { depth, max: MAX_EPILOGUE_DEPTH });
        }
        Ok(())
    }

    /// Source window of one unrolled block plus the weights of one kernel
    /// row. A miss is a performance problem, never a correctness one.
    pub fn validate_l1_working_set(&self, budget_percent: usize) -> Result<(), ConstraintViolation> {
        let working_set = estimate_l1_working_set(self.plan);
        let l1 = self.plan.cache.l1d;
        if working_set > l1 * budget_percent / 100 {
            return Err(ConstraintViolation::L1Overflow { working_set, l1_size: l1 });
        }
        Ok(())
    }

    pub fn validate_displacements(&self) -> Result<(), ConstraintViolation> {
        for (operand, bytes) in max_displacements(self.plan) {
            if bytes > i32::MAX as usize {
                return Err(ConstraintViolation::DisplacementOverflow { operand, bytes });
            }
        }
        Ok(())
    }

    /// Run all checks, collecting every violation.
    pub fn check(&self) -> HwConstraintResult {
        self.check_with_budget(85)
    }

    pub fn check_with_budget(&self, budget_percent: usize) -> HwConstraintResult {
        let mut violations = Vec::new();
        let mut warnings = Vec::new();
        let hard = [
            self.validate_register_pressure(),
            self.validate_epilogue_depth(),
            self.validate_displacements(),
        ];
        violations.extend(hard.into_iter().filter_map(Result::err));
        if let Err(w) = self.validate_l1_working_set(budget_percent) {
            log::debug!("{} plan: {w}", self.plan.family);
            warnings.push(w);
        }
        HwConstraintResult {
            valid: violations.is_empty(),
            register_pressure: self.plan.registers.peak(),
            register_limit: self.plan.vreg_count,
            l1_working_set_bytes: estimate_l1_working_set(self.plan),
            l1_budget_bytes: self.plan.cache.l1d * budget_percent / 100,
            epilogue_depth: self.plan.post_ops.len(),
            violations,
            warnings,
        }
    }
}

fn estimate_l1_working_set(plan: &ExecutionPlan) -> usize {
    let g = &plan.geometry;
    let src_cols = (plan.ur_w - 1) * g.stride_w + (g.kw - 1) * g.dil_w + 1;
    let src = src_cols * plan.ic_split.chunk_channels.max(1) * plan.src_type.size();
    let weights = plan.nb_oc_blocking * g.kw * plan.packs_per_call() * plan.vector_bytes();
    src + weights
}

/// Largest offsets the generator encodes as immediates or displacements.
fn max_displacements(plan: &ExecutionPlan) -> [(&'static str, usize); 4] {
    let g = &plan.geometry;
    let src_sz = plan.src_type.size();
    let dst_sz = plan.dst_type.size();
    let src_cols = (plan.ur_w - 1) * g.stride_w + (g.kw - 1) * g.dil_w + 1;
    let src = src_cols * g.src_pixel_stride * src_sz + plan.packs_per_call() * plan.ic_pack * src_sz;
    let src_row = g.dil_h * g.iw * g.src_pixel_stride * src_sz;
    let weights = plan.nb_oc_blocking * plan.weights.block_stride;
    let dst = plan.ur_w * g.dst_pixel_stride * dst_sz + plan.nb_oc_blocking * plan.vector_bytes();
    [("source", src), ("source row", src_row), ("weight", weights), ("destination", dst)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{ConvDesc, PostOp};
    use crate::compiler::planner::plan_dense;
    use crate::config::JitConfig;
    use crate::dispatch::{CapabilitySet, IsaLevel};

    fn plan() -> ExecutionPlan {
        let d = ConvDesc::new(1, 16, 16, (8, 8), (3, 3));
        plan_dense(&d, &CapabilitySet::for_level(IsaLevel::Avx2), &JitConfig::default()).unwrap()
    }

    #[test]
    fn planned_kernels_pass() {
        let p = plan();
        let r = HwConstraintChecker::new(&p).check();
        assert!(r.valid, "{:?}", r.violations);
        assert!(r.register_pressure <= r.register_limit);
    }

    #[test]
    fn tampered_plans_are_caught() {
        let mut p = plan();
        p.registers.accumulators = 40;
        assert!(matches!(
            HwConstraintChecker::new(&p).validate_register_pressure(),
            Err(ConstraintViolation::RegisterPressure { available: 16, .. })
        ));
        let mut p = plan();
        p.post_ops = vec![PostOp::relu(); MAX_EPILOGUE_DEPTH + 1];
        assert!(HwConstraintChecker::new(&p).validate_epilogue_depth().is_err());
    }

    #[test]
    fn huge_rows_overflow_displacements() {
        let mut p = plan();
        p.geometry.src_pixel_stride = 1 << 30;
        let r = HwConstraintChecker::new(&p).check();
        assert!(!r.valid);
        assert!(r
            .violations
            .iter()
            .any(|v| matches!(v, ConstraintViolation::DisplacementOverflow { .. })));
    }

    #[test]
    fn l1_budget_follows_the_planned_machine() {
        use crate::cache_params::CacheSizes;
        let d = ConvDesc::new(1, 16, 16, (8, 8), (3, 3));
        let small = CacheSizes { l1d: 8 << 10, l2: 256 << 10 };
        let caps = CapabilitySet::for_level(IsaLevel::Avx2).with_cache(small);
        let p = plan_dense(&d, &caps, &JitConfig::default()).unwrap();
        let r = HwConstraintChecker::new(&p).check();
        assert_eq!(r.l1_budget_bytes, (8 << 10) * 85 / 100);
    }

    #[test]
    fn l1_pressure_is_only_a_warning() {
        let p = plan();
        let r = HwConstraintChecker::new(&p).check_with_budget(0);
        assert!(r.valid);
        assert_eq!(r.warnings.len(), 1);
    }
}
