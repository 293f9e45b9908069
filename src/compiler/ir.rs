//! Problem descriptors: the immutable input to planning.
//!
//! A descriptor captures everything that changes the generated code: shapes,
//! strides, padding, grouping, element types and the fused post-op chain.
//! Buffers are supplied later, at execution time.

use std::hash::{Hash, Hasher};

use crate::types::{DataType, JitError, JitResult};

/// Elementwise activation applied in f32.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EltwiseKind {
    /// `x > 0 ? x : alpha * x`. `alpha = 0` is the plain rectifier.
    Relu { alpha: f32 },
    /// `min(max(x, 0), alpha)`.
    BoundedRelu { alpha: f32 },
    /// `min(max(x, lo), hi)`.
    Clip { lo: f32, hi: f32 },
    /// `alpha * x + beta`.
    Linear { alpha: f32, beta: f32 },
    Abs,
    Square,
    Sqrt,
    Exp,
    /// `1 / (1 + exp(-x))`.
    Logistic,
    Tanh,
}

impl EltwiseKind {
    /// Scalar definition of the activation. Generated code approximates the
    /// transcendental kinds; everything else matches bit for bit.
    pub fn eval(&self, x: f32) -> f32 {
        match *self {
            EltwiseKind::Relu { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            EltwiseKind::BoundedRelu { alpha } => x.max(0.0).min(alpha),
            EltwiseKind::Clip { lo, hi } => x.max(lo).min(hi),
            EltwiseKind::Linear { alpha, beta } => alpha * x + beta,
            EltwiseKind::Abs => x.abs(),
            EltwiseKind::Square => x * x,
            EltwiseKind::Sqrt => x.sqrt(),
            EltwiseKind::Exp => x.exp(),
            EltwiseKind::Logistic => 1.0 / (1.0 + (-x).exp()),
            EltwiseKind::Tanh => x.tanh(),
        }
    }

    fn hash_into<H: Hasher>(&self, h: &mut H) {
        let (tag, a, b): (u8, f32, f32) = match *self {
            EltwiseKind::Relu { alpha } => (0, alpha, 0.0),
            EltwiseKind::BoundedRelu { alpha } => (1, alpha, 0.0),
            EltwiseKind::Clip { lo, hi } => (2, lo, hi),
            EltwiseKind::Linear { alpha, beta } => (3, alpha, beta),
            EltwiseKind::Abs => (4, 0.0, 0.0),
            EltwiseKind::Square => (5, 0.0, 0.0),
            EltwiseKind::Sqrt => (6, 0.0, 0.0),
            EltwiseKind::Exp => (7, 0.0, 0.0),
            EltwiseKind::Logistic => (8, 0.0, 0.0),
            EltwiseKind::Tanh => (9, 0.0, 0.0),
        };
        tag.hash(h);
        a.to_bits().hash(h);
        b.to_bits().hash(h);
    }
}

/// Output scale factors.
#[derive(Debug, Clone, PartialEq)]
pub enum Scales {
    PerTensor(f32),
    /// One factor per output channel (all groups, in channel order).
    PerChannel(Vec<f32>),
}

/// One fused operation applied between accumulation and store.
#[derive(Debug, Clone, PartialEq)]
pub enum PostOp {
    Eltwise(EltwiseKind),
    Rescale(Scales),
    /// Add `scale * dst`, where `dst` is the destination value present
    /// before the call.
    Sum { scale: f32 },
}

impl PostOp {
    pub fn relu() -> Self {
        PostOp::Eltwise(EltwiseKind::Relu { alpha: 0.0 })
    }

    pub fn eltwise(kind: EltwiseKind) -> Self {
        PostOp::Eltwise(kind)
    }

    pub fn scale(s: f32) -> Self {
        PostOp::Rescale(Scales::PerTensor(s))
    }

    pub fn per_channel_scales(s: Vec<f32>) -> Self {
        PostOp::Rescale(Scales::PerChannel(s))
    }

    pub fn sum(scale: f32) -> Self {
        PostOp::Sum { scale }
    }

    fn hash_into<H: Hasher>(&self, h: &mut H) {
        match self {
            PostOp::Eltwise(k) => {
                0u8.hash(h);
                k.hash_into(h);
            }
            PostOp::Rescale(Scales::PerTensor(s)) => {
                1u8.hash(h);
                s.to_bits().hash(h);
            }
            PostOp::Rescale(Scales::PerChannel(v)) => {
                2u8.hash(h);
                v.len().hash(h);
                for s in v {
                    s.to_bits().hash(h);
                }
            }
            PostOp::Sum { scale } => {
                3u8.hash(h);
                scale.to_bits().hash(h);
            }
        }
    }
}

pub(crate) fn hash_post_ops<H: Hasher>(ops: &[PostOp], h: &mut H) {
    ops.len().hash(h);
    for op in ops {
        op.hash_into(h);
    }
}

/// Convolution problem in NHWC activations.
///
/// Channel counts are totals across all groups. Weights are described in
/// logical `[G][OC/G][IC/G][KH][KW]` order.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvDesc {
    pub batch: usize,
    pub groups: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    /// Spacing between kernel taps; 1 means dense.
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub pad_top: usize,
    pub pad_left: usize,
    pub pad_bottom: usize,
    pub pad_right: usize,
    pub src_type: DataType,
    pub wei_type: DataType,
    pub dst_type: DataType,
    pub bias_type: Option<DataType>,
    /// Zero point of an asymmetric 8-bit source.
    pub src_zero_point: i32,
    /// Factor applied to the bias when it is staged for the kernel.
    pub bias_scale: f32,
    pub post_ops: Vec<PostOp>,
}

impl ConvDesc {
    /// Single-group, stride-1, unpadded f32 convolution.
    pub fn new(
        batch: usize,
        in_channels: usize,
        out_channels: usize,
        input: (usize, usize),
        kernel: (usize, usize),
    ) -> Self {
        ConvDesc {
            batch,
            groups: 1,
            in_channels,
            out_channels,
            in_h: input.0,
            in_w: input.1,
            kernel_h: kernel.0,
            kernel_w: kernel.1,
            stride_h: 1,
            stride_w: 1,
            dilation_h: 1,
            dilation_w: 1,
            pad_top: 0,
            pad_left: 0,
            pad_bottom: 0,
            pad_right: 0,
            src_type: DataType::F32,
            wei_type: DataType::F32,
            dst_type: DataType::F32,
            bias_type: None,
            src_zero_point: 0,
            bias_scale: 1.0,
            post_ops: Vec::new(),
        }
    }

    pub fn stride(mut self, h: usize, w: usize) -> Self {
        self.stride_h = h;
        self.stride_w = w;
        self
    }

    pub fn dilation(mut self, h: usize, w: usize) -> Self {
        self.dilation_h = h;
        self.dilation_w = w;
        self
    }

    /// Same padding on every side.
    pub fn pad(self, p: usize) -> Self {
        self.padding(p, p, p, p)
    }

    pub fn padding(mut self, top: usize, left: usize, bottom: usize, right: usize) -> Self {
        self.pad_top = top;
        self.pad_left = left;
        self.pad_bottom = bottom;
        self.pad_right = right;
        self
    }

    pub fn groups(mut self, g: usize) -> Self {
        self.groups = g;
        self
    }

    pub fn types(mut self, src: DataType, wei: DataType, dst: DataType) -> Self {
        self.src_type = src;
        self.wei_type = wei;
        self.dst_type = dst;
        self
    }

    pub fn bias(mut self, dt: DataType) -> Self {
        self.bias_type = Some(dt);
        self
    }

    pub fn src_zero_point(mut self, zp: i32) -> Self {
        self.src_zero_point = zp;
        self
    }

    pub fn bias_scale(mut self, s: f32) -> Self {
        self.bias_scale = s;
        self
    }

    pub fn post_op(mut self, op: PostOp) -> Self {
        self.post_ops.push(op);
        self
    }

    #[inline]
    fn extent(k: usize, d: usize) -> usize {
        (k - 1) * d + 1
    }

    /// Output height; 0 when the padded input is smaller than the kernel.
    pub fn out_h(&self) -> usize {
        let span = self.in_h + self.pad_top + self.pad_bottom;
        let ext = Self::extent(self.kernel_h.max(1), self.dilation_h.max(1));
        if span < ext || self.stride_h == 0 {
            return 0;
        }
        (span - ext) / self.stride_h + 1
    }

    pub fn out_w(&self) -> usize {
        let span = self.in_w + self.pad_left + self.pad_right;
        let ext = Self::extent(self.kernel_w.max(1), self.dilation_w.max(1));
        if span < ext || self.stride_w == 0 {
            return 0;
        }
        (span - ext) / self.stride_w + 1
    }

    pub fn ic_per_group(&self) -> usize {
        self.in_channels / self.groups.max(1)
    }

    pub fn oc_per_group(&self) -> usize {
        self.out_channels / self.groups.max(1)
    }

    /// One input and one output channel per group, vectorised over groups.
    pub fn is_depthwise(&self) -> bool {
        self.groups > 1 && self.groups == self.in_channels && self.groups == self.out_channels
    }

    pub fn src_elems(&self) -> usize {
        self.batch * self.in_h * self.in_w * self.in_channels
    }

    pub fn dst_elems(&self) -> usize {
        self.batch * self.out_h() * self.out_w() * self.out_channels
    }

    pub fn weight_elems(&self) -> usize {
        self.out_channels * self.ic_per_group() * self.kernel_h * self.kernel_w
    }

    /// Structural checks independent of the target ISA.
    pub fn validate(&self) -> JitResult<()> {
        let bad = |m: String| Err(JitError::InvalidDescriptor(m));
        if self.batch == 0 || self.in_channels == 0 || self.out_channels == 0 {
            return bad(format!(
                "batch/channels must be non-zero (mb={}, ic={}, oc={})",
                self.batch, self.in_channels, self.out_channels
            ));
        }
        if self.in_h == 0 || self.in_w == 0 || self.kernel_h == 0 || self.kernel_w == 0 {
            return bad("spatial and kernel extents must be non-zero".into());
        }
        if self.stride_h == 0 || self.stride_w == 0 || self.dilation_h == 0 || self.dilation_w == 0 {
            return bad("stride and dilation must be at least 1".into());
        }
        if self.groups == 0
            || self.in_channels % self.groups != 0
            || self.out_channels % self.groups != 0
        {
            return bad(format!(
                "groups={} must divide ic={} and oc={}",
                self.groups, self.in_channels, self.out_channels
            ));
        }
        if self.out_h() == 0 || self.out_w() == 0 {
            return bad("padded input is smaller than the dilated kernel".into());
        }
        validate_post_ops(&self.post_ops, self.out_channels)?;
        if !self.bias_scale.is_finite() {
            return bad("bias_scale must be finite".into());
        }
        Ok(())
    }
}

/// Quantized matrix multiplication
/// `C[m, n] = sum_k (A[m, k] - a_zero_point) * B[k, n] (+ bias[n])`,
/// followed by the post-op chain.
///
/// A and C are row-major with leading dimensions `lda` / `ldc`; B is
/// row-major `K x N` with leading dimension `ldb` and is reordered once.
#[derive(Debug, Clone, PartialEq)]
pub struct GemmDesc {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
    pub a_type: DataType,
    pub b_type: DataType,
    pub c_type: DataType,
    pub bias_type: Option<DataType>,
    pub a_zero_point: i32,
    pub post_ops: Vec<PostOp>,
}

impl GemmDesc {
    /// Dense `u8 x s8 -> s32` GEMM with tight leading dimensions.
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        GemmDesc {
            m,
            n,
            k,
            lda: k,
            ldb: n,
            ldc: n,
            a_type: DataType::U8,
            b_type: DataType::S8,
            c_type: DataType::S32,
            bias_type: None,
            a_zero_point: 0,
            post_ops: Vec::new(),
        }
    }

    pub fn types(mut self, a: DataType, b: DataType, c: DataType) -> Self {
        self.a_type = a;
        self.b_type = b;
        self.c_type = c;
        self
    }

    pub fn leading_dims(mut self, lda: usize, ldb: usize, ldc: usize) -> Self {
        self.lda = lda;
        self.ldb = ldb;
        self.ldc = ldc;
        self
    }

    pub fn bias(mut self, dt: DataType) -> Self {
        self.bias_type = Some(dt);
        self
    }

    pub fn a_zero_point(mut self, zp: i32) -> Self {
        self.a_zero_point = zp;
        self
    }

    pub fn post_op(mut self, op: PostOp) -> Self {
        self.post_ops.push(op);
        self
    }

    pub fn validate(&self) -> JitResult<()> {
        let bad = |m: String| Err(JitError::InvalidDescriptor(m));
        if self.m == 0 || self.n == 0 || self.k == 0 {
            return bad(format!("empty GEMM {}x{}x{}", self.m, self.n, self.k));
        }
        if self.lda < self.k || self.ldb < self.n || self.ldc < self.n {
            return bad(format!(
                "leading dimensions too small: lda={} (k={}), ldb={} / ldc={} (n={})",
                self.lda, self.k, self.ldb, self.ldc, self.n
            ));
        }
        validate_post_ops(&self.post_ops, self.n)
    }
}

fn validate_post_ops(ops: &[PostOp], channels: usize) -> JitResult<()> {
    for op in ops {
        match op {
            PostOp::Rescale(Scales::PerChannel(v)) if v.len() != channels => {
                return Err(JitError::InvalidDescriptor(format!(
                    "per-channel scales have {} entries for {} channels",
                    v.len(),
                    channels
                )));
            }
            PostOp::Eltwise(EltwiseKind::Clip { lo, hi }) if lo > hi => {
                return Err(JitError::InvalidDescriptor(format!(
                    "clip bounds inverted: [{lo}, {hi}]"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Any problem a kernel generator can be asked to handle.
#[derive(Debug, Clone, PartialEq)]
pub enum ProblemDescriptor {
    Conv(ConvDesc),
    Gemm(GemmDesc),
}

impl ProblemDescriptor {
    pub fn validate(&self) -> JitResult<()> {
        match self {
            ProblemDescriptor::Conv(c) => c.validate(),
            ProblemDescriptor::Gemm(g) => g.validate(),
        }
    }

    pub fn post_ops(&self) -> &[PostOp] {
        match self {
            ProblemDescriptor::Conv(c) => &c.post_ops,
            ProblemDescriptor::Gemm(g) => &g.post_ops,
        }
    }
}

impl From<ConvDesc> for ProblemDescriptor {
    fn from(d: ConvDesc) -> Self {
        ProblemDescriptor::Conv(d)
    }
}

impl From<GemmDesc> for ProblemDescriptor {
    fn from(d: GemmDesc) -> Self {
        ProblemDescriptor::Gemm(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_extents() {
        let d = ConvDesc::new(1, 1, 1, (5, 5), (3, 3)).pad(1);
        assert_eq!((d.out_h(), d.out_w()), (5, 5));
        let d = ConvDesc::new(1, 3, 4, (8, 8), (3, 3));
        assert_eq!((d.out_h(), d.out_w()), (6, 6));
        let d = ConvDesc::new(1, 3, 4, (9, 9), (3, 3)).stride(2, 2).dilation(2, 2);
        // dilated extent 5 -> (9 - 5) / 2 + 1
        assert_eq!((d.out_h(), d.out_w()), (3, 3));
    }

    #[test]
    fn depthwise_detection() {
        let d = ConvDesc::new(1, 32, 32, (7, 7), (3, 3)).groups(32);
        assert!(d.is_depthwise());
        let d = ConvDesc::new(1, 32, 64, (7, 7), (3, 3)).groups(32);
        assert!(!d.is_depthwise());
        assert!(!ConvDesc::new(1, 1, 1, (4, 4), (1, 1)).is_depthwise());
    }

    #[test]
    fn validation_rejects_malformed() {
        assert!(ConvDesc::new(1, 3, 4, (2, 2), (3, 3)).validate().is_err());
        assert!(ConvDesc::new(1, 3, 4, (8, 8), (3, 3)).groups(2).validate().is_err());
        assert!(ConvDesc::new(1, 3, 4, (8, 8), (3, 3)).stride(0, 1).validate().is_err());
        let d = ConvDesc::new(1, 3, 4, (8, 8), (3, 3))
            .post_op(PostOp::per_channel_scales(vec![1.0; 3]));
        assert!(d.validate().is_err());
        assert!(GemmDesc::new(4, 4, 4).leading_dims(3, 4, 4).validate().is_err());
        assert!(GemmDesc::new(4, 4, 4).validate().is_ok());
    }

    #[test]
    fn eltwise_scalar_semantics() {
        assert_eq!(EltwiseKind::Relu { alpha: 0.1 }.eval(-2.0), -0.2);
        assert_eq!(EltwiseKind::BoundedRelu { alpha: 6.0 }.eval(9.0), 6.0);
        assert_eq!(EltwiseKind::Linear { alpha: 2.0, beta: 1.0 }.eval(3.0), 7.0);
        assert!((EltwiseKind::Logistic.eval(0.0) - 0.5).abs() < 1e-7);
    }
}
