//! Shared math approximations: ISA-independent transcendental functions.
//!
//! Generic code-generation functions for exp, logistic and tanh. The post-op
//! injector calls them; they emit SIMD instructions via the `SimdOps` trait,
//! so the same sequence serves ymm and zmm kernels.
//!
//! exp is within 2 ULP of the libm result over the clamped domain. logistic
//! and tanh inherit that plus one division.

use super::simd_ops::{SimdOps, VReg};
use crate::types::JitResult;

// ── Exp coefficients (Cephes degree-5 polynomial) ───────────────────────────

/// Input clamp range for exp. Both ends keep `2^round(x * log2(e))` a
/// normal float, so the exponent construction never wraps.
pub const EXP_CLAMP_LO: f32 = -87.3;
pub const EXP_CLAMP_HI: f32 = 88.3;
/// log2(e) for range reduction.
pub const EXP_LOG2E: f32 = std::f32::consts::LOG2_E;
/// Cody-Waite constants for range reduction.
pub const EXP_C1: f32 = -0.693359375;
pub const EXP_C2: f32 = 2.12194440e-4;
/// Horner polynomial coefficients (degree 5).
pub const EXP_P0: f32 = 1.9875691500e-4;
pub const EXP_P1: f32 = 1.3981999507e-3;
pub const EXP_P2: f32 = 8.3334519073e-3;
pub const EXP_P3: f32 = 4.1665795894e-2;
pub const EXP_P4: f32 = 1.6666665459e-1;
pub const EXP_P5: f32 = 5.0000001201e-1;
/// IEEE-754 single-precision exponent bias.
pub const EXP_BIAS: u32 = 127;

// ── Generic emit functions ──────────────────────────────────────────────────

/// Emit exp(x) approximation using Cephes degree-5 polynomial.
///
/// Algorithm:
/// 1. Clamp input to [-87.3, 88.3]
/// 2. Compute k = round(x * log2(e))
/// 3. Cody-Waite range reduction: r = x - k * ln(2)
/// 4. Horner polynomial: p = p0 + r*(p1 + r*(p2 + r*(p3 + r*(p4 + r*p5))))
/// 5. Reconstruct: exp(x) = p * 2^k
///
/// Uses `dst` for output, `src` for input, `s[0..3]` as scratch. `dst` may
/// equal `src`.
pub fn emit_exp<E: SimdOps>(e: &mut E, dst: VReg, src: VReg, s: [VReg; 3]) -> JitResult<()> {
    // Clamp input
    e.vbroadcast_const(s[1], EXP_CLAMP_LO)?;
    e.vmax(s[0], src, s[1])?;
    e.vbroadcast_const(s[1], EXP_CLAMP_HI)?;
    e.vmin(s[0], s[0], s[1])?;

    // k = round(x * log2(e))
    e.vbroadcast_const(s[1], EXP_LOG2E)?;
    e.vmul(s[1], s[0], s[1])?;
    e.vround(s[2], s[1])?;

    // s[0] = x - k*ln2, split in two steps
    e.vbroadcast_const(s[1], EXP_C1)?;
    e.vfmadd231(s[0], s[2], s[1])?;
    e.vbroadcast_const(s[1], EXP_C2)?;
    e.vfmadd231(s[0], s[2], s[1])?;

    // Horner polynomial evaluation
    e.vbroadcast_const(dst, EXP_P0)?;
    for c in [EXP_P1, EXP_P2, EXP_P3, EXP_P4, EXP_P5] {
        e.vbroadcast_const(s[1], c)?;
        e.vfmadd213(dst, s[0], s[1])?;
    }
    e.vmul(dst, dst, s[0])?;
    e.vmul(dst, dst, s[0])?;
    e.vadd(dst, dst, s[0])?;
    e.vbroadcast_const(s[1], 1.0)?;
    e.vadd(dst, dst, s[1])?;

    // 2^k: integer k plus the bias, moved into the exponent field
    e.vcvt_f32_i32(s[1], s[2])?;
    e.vbroadcast_bits(s[2], EXP_BIAS)?;
    e.vadd_i32(s[1], s[1], s[2])?;
    e.vshl_i32(s[1], s[1], 23)?;

    e.vmul(dst, dst, s[1])?;
    Ok(())
}

/// Emit `1 / (1 + exp(-x))`.
pub fn emit_logistic<E: SimdOps>(e: &mut E, dst: VReg, src: VReg, s: [VReg; 3]) -> JitResult<()> {
    e.vbroadcast_const(s[0], -1.0)?;
    e.vmul(dst, src, s[0])?;
    emit_exp(e, dst, dst, s)?;
    e.vbroadcast_const(s[0], 1.0)?;
    e.vadd(dst, dst, s[0])?;
    e.vdiv(dst, s[0], dst)?;
    Ok(())
}

/// Emit tanh(x) as `1 - 2 / (exp(2x) + 1)`.
///
/// Saturates to +-1 at both ends because exp is clamped.
pub fn emit_tanh<E: SimdOps>(e: &mut E, dst: VReg, src: VReg, s: [VReg; 3]) -> JitResult<()> {
    e.vadd(dst, src, src)?;
    emit_exp(e, dst, dst, s)?;
    e.vbroadcast_const(s[0], 1.0)?;
    e.vadd(dst, dst, s[0])?;
    e.vbroadcast_const(s[1], 2.0)?;
    e.vdiv(dst, s[1], dst)?;
    e.vsub(dst, s[0], dst)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod lanes {
    //! Scalar lane interpreter for `SimdOps`, used to check generated math
    //! without executing machine code.

    use super::*;
    use crate::compiler::codegen::simd_ops::MemOperand;
    use crate::types::{DataType, JitError};

    pub const LANES: usize = 8;

    pub struct LaneSim {
        pub regs: Vec<[u32; LANES]>,
    }

    impl LaneSim {
        pub fn new(nregs: usize) -> Self {
            LaneSim { regs: vec![[0; LANES]; nregs] }
        }

        pub fn set_f32(&mut self, r: VReg, v: [f32; LANES]) {
            self.regs[r.0 as usize] = v.map(f32::to_bits);
        }

        pub fn get_f32(&self, r: VReg) -> [f32; LANES] {
            self.regs[r.0 as usize].map(f32::from_bits)
        }

        fn f2(&mut self, d: VReg, a: VReg, b: VReg, f: impl Fn(f32, f32) -> f32) {
            let (a, b) = (self.get_f32(a), self.get_f32(b));
            let mut out = [0f32; LANES];
            for i in 0..LANES {
                out[i] = f(a[i], b[i]);
            }
            self.set_f32(d, out);
        }

        fn i2(&mut self, d: VReg, a: VReg, b: VReg, f: impl Fn(u32, u32) -> u32) {
            let (a, b) = (self.regs[a.0 as usize], self.regs[b.0 as usize]);
            let mut out = [0u32; LANES];
            for i in 0..LANES {
                out[i] = f(a[i], b[i]);
            }
            self.regs[d.0 as usize] = out;
        }
    }

    impl SimdOps for LaneSim {
        fn vadd(&mut self, d: VReg, a: VReg, b: VReg) -> JitResult<()> {
            self.f2(d, a, b, |x, y| x + y);
            Ok(())
        }
        fn vsub(&mut self, d: VReg, a: VReg, b: VReg) -> JitResult<()> {
            self.f2(d, a, b, |x, y| x - y);
            Ok(())
        }
        fn vmul(&mut self, d: VReg, a: VReg, b: VReg) -> JitResult<()> {
            self.f2(d, a, b, |x, y| x * y);
            Ok(())
        }
        fn vdiv(&mut self, d: VReg, a: VReg, b: VReg) -> JitResult<()> {
            self.f2(d, a, b, |x, y| x / y);
            Ok(())
        }
        // maxps/minps return the second operand when either is NaN
        fn vmax(&mut self, d: VReg, a: VReg, b: VReg) -> JitResult<()> {
            self.f2(d, a, b, |x, y| if x > y { x } else { y });
            Ok(())
        }
        fn vmin(&mut self, d: VReg, a: VReg, b: VReg) -> JitResult<()> {
            self.f2(d, a, b, |x, y| if x < y { x } else { y });
            Ok(())
        }
        fn vsqrt(&mut self, d: VReg, a: VReg) -> JitResult<()> {
            self.f2(d, a, a, |x, _| x.sqrt());
            Ok(())
        }
        fn vand(&mut self, d: VReg, a: VReg, b: VReg) -> JitResult<()> {
            self.i2(d, a, b, |x, y| x & y);
            Ok(())
        }
        fn vfmadd213(&mut self, d: VReg, a: VReg, b: VReg) -> JitResult<()> {
            let (x, y, z) = (self.get_f32(a), self.get_f32(d), self.get_f32(b));
            let mut out = [0f32; LANES];
            for i in 0..LANES {
                out[i] = x[i].mul_add(y[i], z[i]);
            }
            self.set_f32(d, out);
            Ok(())
        }
        fn vfmadd231(&mut self, d: VReg, a: VReg, b: VReg) -> JitResult<()> {
            let (x, y, z) = (self.get_f32(a), self.get_f32(b), self.get_f32(d));
            let mut out = [0f32; LANES];
            for i in 0..LANES {
                out[i] = x[i].mul_add(y[i], z[i]);
            }
            self.set_f32(d, out);
            Ok(())
        }
        fn vround(&mut self, d: VReg, a: VReg) -> JitResult<()> {
            self.f2(d, a, a, |x, _| x.round_ties_even());
            Ok(())
        }
        fn vcvt_f32_i32(&mut self, d: VReg, a: VReg) -> JitResult<()> {
            let a = self.get_f32(a);
            self.regs[d.0 as usize] = a.map(|x| x.round_ties_even() as i32 as u32);
            Ok(())
        }
        fn vcvt_i32_f32(&mut self, d: VReg, a: VReg) -> JitResult<()> {
            let a = self.regs[a.0 as usize];
            self.set_f32(d, a.map(|x| x as i32 as f32));
            Ok(())
        }
        fn vadd_i32(&mut self, d: VReg, a: VReg, b: VReg) -> JitResult<()> {
            self.i2(d, a, b, u32::wrapping_add);
            Ok(())
        }
        fn vshl_i32(&mut self, d: VReg, a: VReg, imm: u8) -> JitResult<()> {
            self.i2(d, a, a, |x, _| x << imm);
            Ok(())
        }
        fn vbroadcast_bits(&mut self, d: VReg, bits: u32) -> JitResult<()> {
            self.regs[d.0 as usize] = [bits; LANES];
            Ok(())
        }
        fn vzero(&mut self, d: VReg) -> JitResult<()> {
            self.regs[d.0 as usize] = [0; LANES];
            Ok(())
        }
        fn vmov(&mut self, d: VReg, s: VReg) -> JitResult<()> {
            self.regs[d.0 as usize] = self.regs[s.0 as usize];
            Ok(())
        }
        fn vadd_mem(&mut self, _: VReg, _: VReg, _: MemOperand) -> JitResult<()> {
            Err(JitError::Assembler("lane interpreter has no memory".into()))
        }
        fn vmul_mem(&mut self, _: VReg, _: VReg, _: MemOperand) -> JitResult<()> {
            Err(JitError::Assembler("lane interpreter has no memory".into()))
        }
        fn vload_as_f32(&mut self, _: VReg, _: MemOperand, _: DataType) -> JitResult<()> {
            Err(JitError::Assembler("lane interpreter has no memory".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::lanes::{LaneSim, LANES};
    use super::*;

    const X: VReg = VReg(0);
    const S: [VReg; 3] = [VReg(1), VReg(2), VReg(3)];

    fn run(f: fn(&mut LaneSim, VReg, VReg, [VReg; 3]) -> JitResult<()>, input: [f32; LANES]) -> [f32; LANES] {
        let mut sim = LaneSim::new(4);
        sim.set_f32(X, input);
        f(&mut sim, X, X, S).unwrap();
        sim.get_f32(X)
    }

    fn assert_close(got: f32, want: f32, rel: f32, abs: f32) {
        let err = (got - want).abs();
        assert!(err <= abs + rel * want.abs(), "got {got}, want {want}");
    }

    #[test]
    fn exp_matches_libm() {
        for chunk in [
            [-80.0, -20.0, -1.5, -0.3, 0.0, 0.7, 10.0, 80.0],
            [-87.0, -5.5, -1e-3, 1e-3, 2.0, 33.3, 60.0, 88.0],
        ] {
            let got = run(emit_exp, chunk);
            for (g, x) in got.iter().zip(chunk) {
                assert_close(*g, x.exp(), 5e-7, 0.0);
            }
        }
    }

    #[test]
    fn exp_clamps_instead_of_overflowing() {
        let got = run(emit_exp, [200.0, 89.0, -200.0, -100.0, f32::MAX, -f32::MAX, 88.3, -87.3]);
        for g in got {
            assert!(g.is_finite() && g >= 0.0, "{g}");
        }
        assert!(got[0] > 1e38);
        assert!(got[2] < 1e-37);
    }

    #[test]
    fn logistic_and_tanh() {
        let xs = [-30.0, -4.0, -1.0, -0.25, 0.0, 0.5, 3.0, 40.0];
        let lg = run(emit_logistic, xs);
        let th = run(emit_tanh, xs);
        for i in 0..LANES {
            assert_close(lg[i], 1.0 / (1.0 + (-xs[i]).exp()), 2e-6, 2e-7);
            assert_close(th[i], xs[i].tanh(), 2e-6, 5e-7);
        }
    }
}
