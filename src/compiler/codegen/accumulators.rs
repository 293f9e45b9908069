//! Accumulator lifecycle shared by every kernel family: call-record
//! unpacking, operand broadcasts, initialisation, and the epilogue
//! (conversion, bias, post-ops, saturation, store).

use iced_x86::code_asm::qword_ptr;

use crate::compiler::abi::{
    FLAG_IC_FIRST, FLAG_IC_LAST, OFF_CHANNEL_PARAMS, OFF_COMPENSATION, OFF_DST, OFF_FLAGS, OFF_SRC,
    OFF_WEIGHTS,
};
use crate::compiler::buffer_alloc::ChannelVector;
use crate::compiler::planner::{CompensationMode, DotProduct, ExecutionPlan};
use crate::compiler::regalloc::{Gpr, VectorRoles};
use crate::types::{DataType, JitResult};

use super::post_ops::{AccumulatorSlot, PostOpInjector, TailStaging};
use super::simd_ops::{MemOperand, SimdOps};
use super::x86_64::{addr, X86Emitter};

#[inline]
pub(crate) fn param(off: i32) -> MemOperand {
    MemOperand::new(Gpr::Param, off)
}

/// Channel-parameter operand for block `ocb` of `which`.
fn channel_vector(plan: &ExecutionPlan, which: ChannelVector, ocb: usize) -> Option<MemOperand> {
    let base = plan.scratchpad.offset_of(which)?;
    Some(MemOperand::new(
        Gpr::ChannelParams,
        (base + ocb * plan.vector_bytes()) as i32,
    ))
}

/// Dword broadcast into the zero-point register.
pub(crate) fn zero_point_pattern(plan: &ExecutionPlan) -> u32 {
    let zp_op = (plan.src_shift + plan.src_zero_point) as u32 & 0xff;
    match plan.dot {
        DotProduct::Pairs16 => zp_op | (zp_op << 16),
        DotProduct::Quads8 => zp_op * 0x0101_0101,
        DotProduct::Widen32 | DotProduct::F32Fma => plan.src_zero_point as u32,
    }
}

pub(crate) fn load_call_record(e: &mut X86Emitter, plan: &ExecutionPlan) -> JitResult<()> {
    e.load_gpr(Gpr::Src, param(OFF_SRC))?;
    e.load_gpr(Gpr::Weights, param(OFF_WEIGHTS))?;
    e.load_gpr(Gpr::Dst, param(OFF_DST))?;
    if !plan.scratchpad.is_empty() {
        e.load_gpr(Gpr::ChannelParams, param(OFF_CHANNEL_PARAMS))?;
    }
    if plan.compensation == CompensationMode::Precomputed {
        e.load_gpr(Gpr::Compensation, param(OFF_COMPENSATION))?;
    }
    Ok(())
}

pub(crate) fn broadcast_operands(e: &mut X86Emitter, plan: &ExecutionPlan, roles: &VectorRoles) -> JitResult<()> {
    if let Some(s) = roles.sign_shift {
        e.vbroadcast_bits(s, 0x8080_8080)?;
    }
    if let Some(z) = roles.zero_point {
        e.vbroadcast_bits(z, zero_point_pattern(plan))?;
    }
    Ok(())
}

/// Accumulator slots of one variant, block-major.
pub(crate) fn slots(plan: &ExecutionPlan, roles: &VectorRoles, ur_w: usize, tail_chunk: bool) -> Vec<AccumulatorSlot> {
    let g = &plan.geometry;
    let dsz = plan.dst_type.size();
    let nb = plan.nb_oc_blocking;
    let mut out = Vec::with_capacity(nb * ur_w);
    for ocb in 0..nb {
        let tail = (tail_chunk && ocb + 1 == nb).then_some(plan.oc_tail);
        for jj in 0..ur_w {
            let disp = jj * g.dst_pixel_stride * dsz + ocb * plan.simd_lanes * dsz;
            out.push(AccumulatorSlot {
                reg: roles.acc(jj, ocb),
                ocb,
                dst: MemOperand::new(Gpr::Dst, disp as i32),
                tail,
            });
        }
    }
    out
}

pub(crate) fn init_accumulators(
    e: &mut X86Emitter,
    plan: &ExecutionPlan,
    roles: &VectorRoles,
    ur_w: usize,
    tail_chunk: bool,
) -> JitResult<()> {
    let nb = plan.nb_oc_blocking;
    if plan.dot != DotProduct::F32Fma {
        for ocb in 0..nb {
            for jj in 0..ur_w {
                let acc = roles.acc(jj, ocb);
                if plan.compensation == CompensationMode::Precomputed {
                    let mem = MemOperand::new(Gpr::Compensation, (ocb * plan.vector_bytes()) as i32);
                    e.vload(acc, mem)?;
                } else {
                    e.vzero(acc)?;
                }
            }
        }
        return Ok(());
    }

    // Later input-channel chunks resume from the partial sums in dst.
    let resume = if plan.ic_split.chunks > 1 {
        let from_dst = e.code().new_label();
        let done = e.code().new_label();
        e.asm().test(qword_ptr(addr(param(OFF_FLAGS))), FLAG_IC_FIRST as i32)?;
        e.asm().jz(from_dst)?;
        Some((from_dst, done))
    } else {
        None
    };
    for ocb in 0..nb {
        let bias = channel_vector(plan, ChannelVector::Bias, ocb);
        for jj in 0..ur_w {
            let acc = roles.acc(jj, ocb);
            match bias {
                Some(mem) => e.vload(acc, mem)?,
                None => e.vzero(acc)?,
            }
        }
    }
    if let Some((mut from_dst, mut done)) = resume {
        e.asm().jmp(done)?;
        e.code().bind(&mut from_dst)?;
        for slot in slots(plan, roles, ur_w, tail_chunk) {
            let src = match slot.tail {
                Some(n) => e.stage_tail(slot.dst, n, DataType::F32)?,
                None => slot.dst,
            };
            e.vload(slot.reg, src)?;
        }
        e.code().bind(&mut done)?;
    }
    Ok(())
}

pub(crate) fn emit_epilogue(
    e: &mut X86Emitter,
    plan: &ExecutionPlan,
    roles: &VectorRoles,
    ur_w: usize,
    tail_chunk: bool,
) -> JitResult<()> {
    let slots = slots(plan, roles, ur_w, tail_chunk);
    if !plan.float_epilogue() {
        for s in &slots {
            e.store_as(s.dst, s.reg, DataType::S32, roles.src, s.tail)?;
        }
        return Ok(());
    }

    let scratch = roles.scratch();
    if plan.dot != DotProduct::F32Fma {
        for s in &slots {
            e.vcvt_i32_f32(s.reg, s.reg)?;
        }
        if plan.bias_type.is_some() {
            for s in &slots {
                if let Some(mem) = channel_vector(plan, ChannelVector::Bias, s.ocb) {
                    e.vadd_mem(s.reg, s.reg, mem)?;
                }
            }
        }
    }

    let injector = PostOpInjector::new(
        &plan.post_ops,
        &plan.scratchpad,
        &scratch,
        plan.dst_type,
        plan.vector_bytes(),
    )?;
    if !injector.is_empty() {
        if plan.ic_split.chunks > 1 {
            let mut skip = e.code().new_label();
            e.asm().test(qword_ptr(addr(param(OFF_FLAGS))), FLAG_IC_LAST as i32)?;
            e.asm().jz(skip)?;
            injector.inject(e, &slots)?;
            e.code().bind(&mut skip)?;
        } else {
            injector.inject(e, &slots)?;
        }
    }

    if plan.dst_type != DataType::F32 {
        let (lo, hi) = plan.dst_type.saturation_bounds();
        e.vbroadcast_const(scratch[0], lo)?;
        e.vbroadcast_const(scratch[1], hi)?;
        for s in &slots {
            e.saturate_to_i32(s.reg, scratch[0], scratch[1])?;
        }
    }
    for s in &slots {
        e.store_as(s.dst, s.reg, plan.dst_type, scratch.first().copied().unwrap_or(roles.src), s.tail)?;
    }
    Ok(())
}
