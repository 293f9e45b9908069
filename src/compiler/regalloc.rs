//! Register-role tables.
//!
//! Generators never name physical registers directly. General-purpose
//! registers are addressed through [`Gpr`] roles; vector registers through a
//! [`VectorRoles`] table resolved once per plan. The table is the single
//! place where the "vector registers are a budget" rule is enforced.

use iced_x86::code_asm::{
    eax, ecx, edx, r10, r11, r12, r13, r14, r15, r8, r9, rax, rcx, rdi, rdx, rsi, rsp,
    AsmRegister32, AsmRegister64,
};

use super::codegen::simd_ops::VReg;
use crate::types::{JitError, JitResult};

/// Logical general-purpose register roles shared by every generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gpr {
    /// Pointer to the CallRecord (first integer argument).
    Param,
    Src,
    Weights,
    Dst,
    /// Cursor into the current source row.
    AuxSrc,
    /// Cursor into the current weight row.
    AuxWeights,
    KhCounter,
    IcCounter,
    ChannelParams,
    Compensation,
    Stack,
    Tmp,
    Tmp2,
    Tmp3,
}

impl Gpr {
    pub fn reg64(self) -> AsmRegister64 {
        match self {
            Gpr::Param => rdi,
            Gpr::Src => r8,
            Gpr::Weights => r9,
            Gpr::Dst => r10,
            Gpr::AuxSrc => r11,
            Gpr::AuxWeights => r12,
            Gpr::KhCounter => r13,
            Gpr::IcCounter => r14,
            Gpr::ChannelParams => rsi,
            Gpr::Compensation => r15,
            Gpr::Stack => rsp,
            Gpr::Tmp => rax,
            Gpr::Tmp2 => rcx,
            Gpr::Tmp3 => rdx,
        }
    }

    /// 32-bit view; only the temporaries are ever used at this width.
    pub fn reg32(self) -> JitResult<AsmRegister32> {
        match self {
            Gpr::Tmp => Ok(eax),
            Gpr::Tmp2 => Ok(ecx),
            Gpr::Tmp3 => Ok(edx),
            other => Err(JitError::Assembler(format!("{other:?} has no 32-bit role"))),
        }
    }
}

/// What a kernel needs from the vector register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleRequest {
    pub vreg_count: usize,
    pub ur_w: usize,
    /// Output-channel (or channel) blocks held in registers at once.
    pub nb_blocks: usize,
    /// Product register for two-step dot products.
    pub dot_tmp: bool,
    /// 0x80 byte mask moving signed sources into the unsigned domain.
    pub sign_shift: bool,
    /// Operand fed for padded taps (or subtracted, for depthwise).
    pub zero_point: bool,
    /// One register per block for the current weight vector.
    pub weight_regs: bool,
    /// Scratch registers required by post-ops and the store conversion.
    pub scratch: usize,
}

impl RoleRequest {
    fn reduction_fixed(&self) -> usize {
        1 + usize::from(self.dot_tmp)
            + usize::from(self.sign_shift)
            + usize::from(self.zero_point)
            + if self.weight_regs { self.nb_blocks } else { 0 }
    }

    /// Registers below the accumulator file.
    pub fn reserved(&self) -> usize {
        self.reduction_fixed().max(self.scratch)
    }

    pub fn accumulators(&self) -> usize {
        self.ur_w * self.nb_blocks
    }

    /// Largest unroll that still fits for this request's other roles.
    pub fn max_ur_w(&self) -> usize {
        if self.nb_blocks == 0 {
            return 0;
        }
        self.vreg_count.saturating_sub(self.reserved()) / self.nb_blocks
    }
}

/// Resolved vector register assignment.
///
/// Operand roles occupy the low indices; accumulators follow, laid out as
/// `acc_base + ocb * ur_w + jj`. Once the reduction has finished every
/// register below `acc_base` becomes scratch for post-ops and stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorRoles {
    pub src: VReg,
    pub dot_tmp: Option<VReg>,
    pub sign_shift: Option<VReg>,
    pub zero_point: Option<VReg>,
    pub weights: Vec<VReg>,
    acc_base: u8,
    ur_w: usize,
    nb_blocks: usize,
    vreg_count: usize,
}

impl VectorRoles {
    pub fn resolve(req: &RoleRequest) -> JitResult<Self> {
        let peak = req.reserved() + req.accumulators();
        if req.ur_w == 0 || req.nb_blocks == 0 || peak > req.vreg_count {
            return Err(JitError::Unsupported(format!(
                "register budget exceeded: {} accumulators + {} reserved > {} vector registers",
                req.accumulators(),
                req.reserved(),
                req.vreg_count
            )));
        }
        let mut next = 0u8;
        let mut take = || {
            let r = VReg(next);
            next += 1;
            r
        };
        let src = take();
        let dot_tmp = req.dot_tmp.then(&mut take);
        let sign_shift = req.sign_shift.then(&mut take);
        let zero_point = req.zero_point.then(&mut take);
        let weights = if req.weight_regs {
            (0..req.nb_blocks).map(|_| take()).collect()
        } else {
            Vec::new()
        };
        Ok(VectorRoles {
            src,
            dot_tmp,
            sign_shift,
            zero_point,
            weights,
            acc_base: req.reserved() as u8,
            ur_w: req.ur_w,
            nb_blocks: req.nb_blocks,
            vreg_count: req.vreg_count,
        })
    }

    #[inline]
    pub fn acc(&self, jj: usize, ocb: usize) -> VReg {
        debug_assert!(jj < self.ur_w && ocb < self.nb_blocks);
        VReg(self.acc_base + (ocb * self.ur_w + jj) as u8)
    }

    /// Registers free once accumulation is complete.
    pub fn scratch(&self) -> Vec<VReg> {
        (0..self.acc_base).map(VReg).collect()
    }

    pub fn accumulator_count(&self) -> usize {
        self.ur_w * self.nb_blocks
    }

    /// Highest register index in use, plus one.
    pub fn peak(&self) -> usize {
        self.acc_base as usize + self.accumulator_count()
    }

    pub fn vreg_count(&self) -> usize {
        self.vreg_count
    }
}
