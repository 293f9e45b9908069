//! SimdOps trait: the vector instruction surface post-ops are written in.
//!
//! The post-op injector and the transcendental approximations generate code
//! by calling methods on `SimdOps`; `X86Emitter` maps them onto xmm, ymm or zmm
//! encodings. Keeping that layer generic lets the math be checked against a
//! lane interpreter without executing generated code.
//!
//! - `VReg(u8)` is a logical vector register index resolved by the backend.
//! - Floating-point methods operate on packed f32 lanes.
//! - Integer methods operate on packed 32-bit lanes.

use crate::compiler::regalloc::Gpr;
use crate::types::{DataType, JitResult};

/// Logical vector register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VReg(pub u8);

/// `[base + disp]` memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Gpr,
    pub disp: i32,
}

impl MemOperand {
    #[inline]
    pub const fn new(base: Gpr, disp: i32) -> Self {
        MemOperand { base, disp }
    }

    #[inline]
    pub const fn offset(self, by: i32) -> Self {
        MemOperand { base: self.base, disp: self.disp + by }
    }
}

pub trait SimdOps {
    fn vadd(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()>;
    fn vsub(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()>;
    fn vmul(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()>;
    fn vdiv(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()>;
    fn vmax(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()>;
    fn vmin(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()>;
    fn vsqrt(&mut self, dst: VReg, a: VReg) -> JitResult<()>;
    /// Bitwise and.
    fn vand(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()>;

    /// dst = a * dst + b
    fn vfmadd213(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()>;
    /// dst = a * b + dst
    fn vfmadd231(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()>;

    /// Round to nearest integral value (ties to even).
    fn vround(&mut self, dst: VReg, a: VReg) -> JitResult<()>;
    /// f32 -> i32, rounding to nearest even.
    fn vcvt_f32_i32(&mut self, dst: VReg, a: VReg) -> JitResult<()>;
    /// i32 -> f32.
    fn vcvt_i32_f32(&mut self, dst: VReg, a: VReg) -> JitResult<()>;
    fn vadd_i32(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()>;
    fn vshl_i32(&mut self, dst: VReg, a: VReg, imm: u8) -> JitResult<()>;

    /// Fill every lane with the bit pattern `bits`.
    fn vbroadcast_bits(&mut self, dst: VReg, bits: u32) -> JitResult<()>;
    fn vbroadcast_const(&mut self, dst: VReg, val: f32) -> JitResult<()> {
        self.vbroadcast_bits(dst, val.to_bits())
    }
    fn vzero(&mut self, dst: VReg) -> JitResult<()>;
    fn vmov(&mut self, dst: VReg, src: VReg) -> JitResult<()>;

    /// dst = a + [mem] (full f32 vector).
    fn vadd_mem(&mut self, dst: VReg, a: VReg, mem: MemOperand) -> JitResult<()>;
    /// dst = a * [mem] (full f32 vector).
    fn vmul_mem(&mut self, dst: VReg, a: VReg, mem: MemOperand) -> JitResult<()>;
    /// Load one vector of `dt` elements from memory and widen to f32.
    fn vload_as_f32(&mut self, dst: VReg, mem: MemOperand, dt: DataType) -> JitResult<()>;
}
