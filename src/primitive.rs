//! Ready-to-run primitives: a compiled routine, its packed weights and a
//! dispatcher bundled behind a slice-based `execute`.
//!
//! Creating a primitive plans the problem, generates (or fetches from the
//! routine cache) the machine code and reorders the weights. `execute`
//! validates the caller's buffers, stages per-channel data into the
//! scratch pad and runs every work item.

use crate::compiler::buffer_alloc::{ChannelVector, Scratchpad, ScratchpadLayout};
use crate::compiler::ir::{ConvDesc, GemmDesc, PostOp, ProblemDescriptor, Scales};
use crate::compiler::planner::{ExecutionPlan, KernelFamily};
use crate::compiler::{CompiledKernel, KernelCompiler};
use crate::dispatcher::{Buffers, Dispatcher};
use crate::types::{DataType, JitError, JitResult};
use crate::weights::{PackedWeights, WeightAccessor, WeightIndex};

/// Rust element types that map onto a [`DataType`].
pub trait Element: bytemuck::Pod + Send + Sync {
    const DATA_TYPE: DataType;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

impl Element for i32 {
    const DATA_TYPE: DataType = DataType::S32;
}

impl Element for i8 {
    const DATA_TYPE: DataType = DataType::S8;
}

impl Element for u8 {
    const DATA_TYPE: DataType = DataType::U8;
}

/// Logical weights handed to a primitive constructor.
#[derive(Debug, Clone, Copy)]
pub enum WeightData<'a> {
    F32(&'a [f32]),
    S8(&'a [i8]),
}

impl WeightData<'_> {
    fn len(&self) -> usize {
        match self {
            WeightData::F32(w) => w.len(),
            WeightData::S8(w) => w.len(),
        }
    }
}

/// Per-output-channel bias.
#[derive(Debug, Clone, Copy)]
pub enum BiasData<'a> {
    F32(&'a [f32]),
    S32(&'a [i32]),
}

impl BiasData<'_> {
    fn data_type(&self) -> DataType {
        match self {
            BiasData::F32(_) => DataType::F32,
            BiasData::S32(_) => DataType::S32,
        }
    }

    fn len(&self) -> usize {
        match self {
            BiasData::F32(b) => b.len(),
            BiasData::S32(b) => b.len(),
        }
    }

    fn get(&self, i: usize) -> f32 {
        match self {
            BiasData::F32(b) => b[i],
            BiasData::S32(b) => b[i] as f32,
        }
    }
}

/// State shared by every primitive kind.
struct Prepared {
    kernel: CompiledKernel,
    weights: PackedWeights,
    dispatcher: Dispatcher,
}

impl Prepared {
    fn new(
        compiler: &KernelCompiler,
        desc: ProblemDescriptor,
        weights: WeightData<'_>,
        index: &dyn Fn(WeightIndex) -> usize,
    ) -> JitResult<Self> {
        let kernel = compiler.compile(&desc)?;
        let weights = match weights {
            WeightData::F32(w) => PackedWeights::pack(&kernel.plan, WeightAccessor::F32(&|i: WeightIndex| w[index(i)]))?,
            WeightData::S8(w) => PackedWeights::pack(&kernel.plan, WeightAccessor::S8(&|i: WeightIndex| w[index(i)]))?,
        };
        let dispatcher = Dispatcher::new(compiler.config().num_threads)?;
        Ok(Prepared { kernel, weights, dispatcher })
    }

    fn plan(&self) -> &ExecutionPlan {
        &self.kernel.plan
    }

    fn run<S: Element, D: Element>(
        &self,
        src: &[S],
        bias: Option<BiasData<'_>>,
        dst: &mut [D],
        scratchpad: &mut Scratchpad,
    ) -> JitResult<()> {
        let plan = self.plan();
        check_type("source", plan.src_type, S::DATA_TYPE)?;
        check_type("destination", plan.dst_type, D::DATA_TYPE)?;
        stage_channel_params(plan, bias, scratchpad)?;
        let bufs = Buffers {
            src: src.as_ptr().cast(),
            weights: self.weights.as_ptr(),
            dst: dst.as_mut_ptr().cast(),
            channel_params: scratchpad.as_ptr(),
            compensation: self.weights.compensation_ptr(),
        };
        // SAFETY: buffer lengths and element types were checked against the
        // plan by the caller and above; `dst` is borrowed mutably for the
        // whole dispatch.
        unsafe { self.dispatcher.run(&self.kernel.routine, plan, &bufs) }
    }
}

fn check_type(what: &str, expected: DataType, got: DataType) -> JitResult<()> {
    if expected != got {
        return Err(JitError::BufferMismatch(format!("{what} is {got}, primitive expects {expected}")));
    }
    Ok(())
}

fn check_len(what: &str, len: usize, needed: usize) -> JitResult<()> {
    if len < needed {
        return Err(JitError::BufferMismatch(format!("{what} has {len} elements, needs {needed}")));
    }
    Ok(())
}

/// Channel groups as the scratch pad sees them: depthwise channels form
/// one vectorised group.
fn channel_groups(plan: &ExecutionPlan) -> (usize, usize) {
    let g = &plan.geometry;
    match plan.family {
        KernelFamily::DepthwiseConv => (1, g.ngroups),
        _ => (g.ngroups, g.oc),
    }
}

/// Fill the scratch pad vectors `plan` reads: the scaled f32 bias and any
/// per-channel rescale factors, each laid out by padded channel index.
fn stage_channel_params(plan: &ExecutionPlan, bias: Option<BiasData<'_>>, pad: &mut Scratchpad) -> JitResult<()> {
    let layout = &plan.scratchpad;
    pad.check(layout)?;
    let (groups, per_group) = channel_groups(plan);
    let padded = plan.padded_oc();
    let total = groups * per_group;

    match (plan.bias_type, bias) {
        (None, None) => {}
        (Some(expected), Some(b)) => {
            check_type("bias", expected, b.data_type())?;
            check_len("bias", b.len(), total)?;
            if let Some(v) = pad.vector_mut(layout, ChannelVector::Bias) {
                for grp in 0..groups {
                    for c in 0..per_group {
                        v[grp * padded + c] = b.get(grp * per_group + c) * plan.bias_scale;
                    }
                }
            }
        }
        (Some(_), None) => return Err(JitError::BufferMismatch("primitive was created with a bias".into())),
        (None, Some(_)) => return Err(JitError::BufferMismatch("primitive was created without a bias".into())),
    }

    for (i, op) in plan.post_ops.iter().enumerate() {
        let PostOp::Rescale(Scales::PerChannel(scales)) = op else {
            continue;
        };
        if let Some(v) = pad.vector_mut(layout, ChannelVector::Scales { post_op: i }) {
            for grp in 0..groups {
                for c in 0..per_group {
                    v[grp * padded + c] = scales[grp * per_group + c];
                }
            }
        }
    }
    Ok(())
}

/// Convolution (dense, grouped or depthwise) on NHWC activations.
pub struct Convolution {
    desc: ConvDesc,
    prepared: Prepared,
}

impl Convolution {
    /// Create with the process-wide host compiler.
    pub fn new(desc: ConvDesc, weights: WeightData<'_>) -> JitResult<Self> {
        Self::with_compiler(KernelCompiler::global(), desc, weights)
    }

    /// `weights` are in logical `[G][OC/G][IC/G][KH][KW]` order.
    pub fn with_compiler(compiler: &KernelCompiler, desc: ConvDesc, weights: WeightData<'_>) -> JitResult<Self> {
        desc.validate()?;
        check_len("weights", weights.len(), desc.weight_elems())?;
        let (ocg, icg, kh, kw) = (desc.oc_per_group(), desc.ic_per_group(), desc.kernel_h, desc.kernel_w);
        let index = move |i: WeightIndex| (((i.g * ocg + i.oc) * icg + i.ic) * kh + i.kh) * kw + i.kw;
        let prepared = Prepared::new(compiler, desc.clone().into(), weights, &index)?;
        Ok(Convolution { desc, prepared })
    }

    pub fn desc(&self) -> &ConvDesc {
        &self.desc
    }

    pub fn plan(&self) -> &ExecutionPlan {
        self.prepared.plan()
    }

    pub fn kernel(&self) -> &CompiledKernel {
        &self.prepared.kernel
    }

    pub fn weights(&self) -> &PackedWeights {
        &self.prepared.weights
    }

    pub fn scratchpad_layout(&self) -> &ScratchpadLayout {
        self.plan().scratchpad()
    }

    pub fn new_scratchpad(&self) -> JitResult<Scratchpad> {
        Scratchpad::new(self.scratchpad_layout())
    }

    /// Run the convolution. `src` is `N x IH x IW x IC`, `dst` is
    /// `N x OH x OW x OC`; with a sum post-op `dst` is also read.
    pub fn execute<S: Element, D: Element>(
        &self,
        src: &[S],
        bias: Option<BiasData<'_>>,
        dst: &mut [D],
        scratchpad: &mut Scratchpad,
    ) -> JitResult<()> {
        check_len("source", src.len(), self.desc.src_elems())?;
        check_len("destination", dst.len(), self.desc.dst_elems())?;
        self.prepared.run(src, bias, dst, scratchpad)
    }
}

impl std::fmt::Debug for Convolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Convolution")
            .field("desc", &self.desc)
            .field("routine", &self.prepared.kernel.routine)
            .finish()
    }
}

/// Quantized GEMM, `C = (A - zp) * B (+ bias)` plus post-ops.
pub struct Gemm {
    desc: GemmDesc,
    prepared: Prepared,
}

impl Gemm {
    pub fn new(desc: GemmDesc, b: &[i8]) -> JitResult<Self> {
        Self::with_compiler(KernelCompiler::global(), desc, b)
    }

    /// `b` is row-major `K x N` with leading dimension `ldb`.
    pub fn with_compiler(compiler: &KernelCompiler, desc: GemmDesc, b: &[i8]) -> JitResult<Self> {
        desc.validate()?;
        check_len("B", b.len(), (desc.k - 1) * desc.ldb + desc.n)?;
        let ldb = desc.ldb;
        let index = move |i: WeightIndex| i.ic * ldb + i.oc;
        let prepared = Prepared::new(compiler, desc.clone().into(), WeightData::S8(b), &index)?;
        Ok(Gemm { desc, prepared })
    }

    pub fn desc(&self) -> &GemmDesc {
        &self.desc
    }

    pub fn plan(&self) -> &ExecutionPlan {
        self.prepared.plan()
    }

    pub fn kernel(&self) -> &CompiledKernel {
        &self.prepared.kernel
    }

    pub fn scratchpad_layout(&self) -> &ScratchpadLayout {
        self.plan().scratchpad()
    }

    pub fn new_scratchpad(&self) -> JitResult<Scratchpad> {
        Scratchpad::new(self.scratchpad_layout())
    }

    pub fn execute<S: Element, D: Element>(
        &self,
        a: &[S],
        bias: Option<BiasData<'_>>,
        c: &mut [D],
        scratchpad: &mut Scratchpad,
    ) -> JitResult<()> {
        let d = &self.desc;
        check_len("A", a.len(), (d.m - 1) * d.lda + d.k)?;
        check_len("C", c.len(), (d.m - 1) * d.ldc + d.n)?;
        self.prepared.run(a, bias, c, scratchpad)
    }
}

impl std::fmt::Debug for Gemm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gemm")
            .field("desc", &self.desc)
            .field("routine", &self.prepared.kernel.routine)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::dispatch::{CapabilitySet, IsaLevel};

    fn compiler() -> KernelCompiler {
        KernelCompiler::new(CapabilitySet::for_level(IsaLevel::Avx2), JitConfig::default())
    }

    #[test]
    fn short_weights_are_rejected() {
        let desc = ConvDesc::new(1, 4, 4, (5, 5), (3, 3));
        let w = vec![0.0f32; 4 * 4 * 9 - 1];
        assert!(matches!(
            Convolution::with_compiler(&compiler(), desc, WeightData::F32(&w)),
            Err(JitError::BufferMismatch(_))
        ));
    }

    #[test]
    fn bias_is_staged_scaled_and_padded() {
        let desc = ConvDesc::new(1, 2, 10, (3, 3), (1, 1))
            .groups(2)
            .types(DataType::U8, DataType::S8, DataType::F32)
            .bias(DataType::S32)
            .bias_scale(0.5);
        let w = vec![1i8; desc.weight_elems()];
        let conv = Convolution::with_compiler(&compiler(), desc, WeightData::S8(&w)).unwrap();
        let plan = conv.plan();
        let mut pad = conv.new_scratchpad().unwrap();
        let bias: Vec<i32> = (0..10).collect();
        stage_channel_params(plan, Some(BiasData::S32(&bias)), &mut pad).unwrap();
        let layout = conv.scratchpad_layout().clone();
        let v = pad.vector_mut(&layout, ChannelVector::Bias).unwrap();
        let padded = plan.padded_oc();
        // group 1 channel 0 is bias[5]
        assert_eq!(v[padded], 2.5);
        assert_eq!(v[4], 2.0);
        assert_eq!(v[5], 0.0);
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        let desc = GemmDesc::new(4, 8, 8);
        let b = vec![0i8; 64];
        let gemm = Gemm::with_compiler(&compiler(), desc, &b).unwrap();
        let mut pad = gemm.new_scratchpad().unwrap();
        let a = vec![0u8; 32];
        let mut c_short = vec![0i32; 31];
        assert!(gemm.execute(&a, None, &mut c_short, &mut pad).is_err());
        let mut c_f32 = vec![0f32; 32];
        assert!(gemm.execute(&a, None, &mut c_f32, &mut pad).is_err());
        let mut c = vec![0i32; 32];
        assert!(matches!(
            gemm.execute(&a, Some(BiasData::S32(&[0; 8])), &mut c, &mut pad),
            Err(JitError::BufferMismatch(_))
        ));
    }
}
