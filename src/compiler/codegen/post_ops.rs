//! Post-op injector.
//!
//! Applies the fused chain to accumulators that already hold f32 values
//! (bias included), in declaration order, before conversion and store. Each
//! operation is emitted for every accumulator before the next operation
//! starts, so constants are broadcast once per operation where the scratch
//! budget allows.
//!
//! Scratch registers come from below the accumulator file; the planner
//! reserves `max(scratch_for(op))` of them.

use crate::compiler::buffer_alloc::{ChannelVector, ScratchpadLayout};
use crate::compiler::ir::{EltwiseKind, PostOp, Scales};
use crate::compiler::regalloc::Gpr;
use crate::types::{DataType, JitError, JitResult};

use super::math_approx::{emit_exp, emit_logistic, emit_tanh};
use super::simd_ops::{MemOperand, SimdOps, VReg};
use super::x86_64::{X86Emitter, DST_STAGE};

/// Moves a partial destination vector somewhere a full-width load is safe.
pub trait TailStaging {
    /// Stage `n` elements of `dt` from `src`; returns where they now live.
    fn stage_tail(&mut self, src: MemOperand, n: usize, dt: DataType) -> JitResult<MemOperand>;
}

impl TailStaging for X86Emitter {
    fn stage_tail(&mut self, src: MemOperand, n: usize, dt: DataType) -> JitResult<MemOperand> {
        self.copy_elems(DST_STAGE, src, n, dt)?;
        Ok(DST_STAGE)
    }
}

/// One accumulator vector and where its results go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulatorSlot {
    pub reg: VReg,
    /// Channel block within the call's chunk.
    pub ocb: usize,
    /// Destination address of this vector.
    pub dst: MemOperand,
    /// Valid lanes when the block is partial.
    pub tail: Option<usize>,
}

/// Scratch registers one post-op needs.
pub fn scratch_for(op: &PostOp) -> usize {
    match op {
        PostOp::Eltwise(kind) => match kind {
            EltwiseKind::Relu { alpha } if *alpha == 0.0 => 1,
            EltwiseKind::Relu { .. } => 2,
            EltwiseKind::BoundedRelu { .. }
            | EltwiseKind::Clip { .. }
            | EltwiseKind::Linear { .. }
            | EltwiseKind::Abs => 1,
            EltwiseKind::Square | EltwiseKind::Sqrt => 0,
            EltwiseKind::Exp | EltwiseKind::Logistic | EltwiseKind::Tanh => 3,
        },
        PostOp::Rescale(Scales::PerTensor(_)) => 1,
        PostOp::Rescale(Scales::PerChannel(_)) => 0,
        PostOp::Sum { .. } => 2,
    }
}

pub struct PostOpInjector<'a> {
    post_ops: &'a [PostOp],
    scratchpad: &'a ScratchpadLayout,
    scratch: &'a [VReg],
    dst_type: DataType,
    vector_bytes: usize,
}

impl<'a> PostOpInjector<'a> {
    pub fn new(
        post_ops: &'a [PostOp],
        scratchpad: &'a ScratchpadLayout,
        scratch: &'a [VReg],
        dst_type: DataType,
        vector_bytes: usize,
    ) -> JitResult<Self> {
        let needed = post_ops.iter().map(scratch_for).max().unwrap_or(0);
        if scratch.len() < needed {
            return Err(JitError::Unsupported(format!(
                "post-op chain needs {needed} scratch registers, {} available",
                scratch.len()
            )));
        }
        Ok(PostOpInjector {
            post_ops,
            scratchpad,
            scratch,
            dst_type,
            vector_bytes,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.post_ops.is_empty()
    }

    pub fn inject<E: SimdOps + TailStaging>(&self, e: &mut E, accs: &[AccumulatorSlot]) -> JitResult<()> {
        for (idx, op) in self.post_ops.iter().enumerate() {
            match op {
                PostOp::Eltwise(kind) => self.eltwise(e, *kind, accs)?,
                PostOp::Rescale(Scales::PerTensor(s)) => {
                    let k = self.scratch[0];
                    e.vbroadcast_const(k, *s)?;
                    for a in accs {
                        e.vmul(a.reg, a.reg, k)?;
                    }
                }
                PostOp::Rescale(Scales::PerChannel(_)) => {
                    let base = self
                        .scratchpad
                        .offset_of(ChannelVector::Scales { post_op: idx })
                        .ok_or_else(|| JitError::Assembler(format!("post-op {idx} scales are not staged")))?;
                    for a in accs {
                        let disp = base + a.ocb * self.vector_bytes;
                        e.vmul_mem(a.reg, a.reg, MemOperand::new(Gpr::ChannelParams, disp as i32))?;
                    }
                }
                PostOp::Sum { scale } => {
                    let (prev, k) = (self.scratch[0], self.scratch[1]);
                    for a in accs {
                        let src = match a.tail {
                            Some(n) => e.stage_tail(a.dst, n, self.dst_type)?,
                            None => a.dst,
                        };
                        e.vload_as_f32(prev, src, self.dst_type)?;
                        e.vbroadcast_const(k, *scale)?;
                        e.vfmadd231(a.reg, prev, k)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn eltwise<E: SimdOps>(&self, e: &mut E, kind: EltwiseKind, accs: &[AccumulatorSlot]) -> JitResult<()> {
        let s = self.scratch;
        match kind {
            EltwiseKind::Relu { alpha } if alpha == 0.0 => {
                e.vzero(s[0])?;
                for a in accs {
                    e.vmax(a.reg, a.reg, s[0])?;
                }
            }
            EltwiseKind::Relu { alpha } => {
                for a in accs {
                    e.vzero(s[0])?;
                    e.vmin(s[1], a.reg, s[0])?;
                    e.vmax(a.reg, a.reg, s[0])?;
                    e.vbroadcast_const(s[0], alpha)?;
                    e.vfmadd231(a.reg, s[0], s[1])?;
                }
            }
            EltwiseKind::BoundedRelu { alpha } => {
                for a in accs {
                    e.vzero(s[0])?;
                    e.vmax(a.reg, a.reg, s[0])?;
                    e.vbroadcast_const(s[0], alpha)?;
                    e.vmin(a.reg, a.reg, s[0])?;
                }
            }
            EltwiseKind::Clip { lo, hi } => {
                for a in accs {
                    e.vbroadcast_const(s[0], lo)?;
                    e.vmax(a.reg, a.reg, s[0])?;
                    e.vbroadcast_const(s[0], hi)?;
                    e.vmin(a.reg, a.reg, s[0])?;
                }
            }
            EltwiseKind::Linear { alpha, beta } => {
                for a in accs {
                    e.vbroadcast_const(s[0], alpha)?;
                    e.vmul(a.reg, a.reg, s[0])?;
                    e.vbroadcast_const(s[0], beta)?;
                    e.vadd(a.reg, a.reg, s[0])?;
                }
            }
            EltwiseKind::Abs => {
                e.vbroadcast_bits(s[0], 0x7fff_ffff)?;
                for a in accs {
                    e.vand(a.reg, a.reg, s[0])?;
                }
            }
            EltwiseKind::Square => {
                for a in accs {
                    e.vmul(a.reg, a.reg, a.reg)?;
                }
            }
            EltwiseKind::Sqrt => {
                for a in accs {
                    e.vsqrt(a.reg, a.reg)?;
                }
            }
            EltwiseKind::Exp | EltwiseKind::Logistic | EltwiseKind::Tanh => {
                let s3 = [s[0], s[1], s[2]];
                for a in accs {
                    match kind {
                        EltwiseKind::Exp => emit_exp(e, a.reg, a.reg, s3)?,
                        EltwiseKind::Logistic => emit_logistic(e, a.reg, a.reg, s3)?,
                        _ => emit_tanh(e, a.reg, a.reg, s3)?,
                    }
                }
            }
        }
        Ok(())
    }
}
