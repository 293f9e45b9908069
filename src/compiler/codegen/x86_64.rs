//! x86_64 JIT code generation via iced-x86 CodeAssembler.
//!
//! `X86Emitter` binds logical [`VReg`]s to xmm (SSE4.1), ymm (AVX2) or zmm
//! (AVX-512) registers. AVX-512 code uses EVEX-only forms throughout
//! (`vpxord`, `vpandd`, `vrndscaleps`, GPR broadcasts) so registers 16..31
//! stay usable. Narrow views (xmm/ymm of a wider register) are only taken of
//! operand roles, which always sit in the low half of the file.
//!
//! SSE code uses legacy encodings only. Three-operand operations are lowered
//! onto the destructive two-operand forms through [`SSE_TEMP`], which the
//! planner never allocates, and FMA becomes `mulps` + `addps`.
//!
//! Constant broadcasts go through `eax` ([`Gpr::Tmp`]); callers must not
//! keep a value there across vector-constant emission.

use iced_x86::code_asm::*;
use iced_x86::IcedError;

use super::emitter::{CodeEmitter, EmittedCode};
use super::simd_ops::{MemOperand, SimdOps, VReg};
use crate::compiler::regalloc::Gpr;
use crate::dispatch::IsaLevel;
use crate::types::{DataType, JitError, JitResult};

const XMM: [AsmRegisterXmm; 32] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13, xmm14,
    xmm15, xmm16, xmm17, xmm18, xmm19, xmm20, xmm21, xmm22, xmm23, xmm24, xmm25, xmm26, xmm27,
    xmm28, xmm29, xmm30, xmm31,
];
const YMM: [AsmRegisterYmm; 32] = [
    ymm0, ymm1, ymm2, ymm3, ymm4, ymm5, ymm6, ymm7, ymm8, ymm9, ymm10, ymm11, ymm12, ymm13, ymm14,
    ymm15, ymm16, ymm17, ymm18, ymm19, ymm20, ymm21, ymm22, ymm23, ymm24, ymm25, ymm26, ymm27,
    ymm28, ymm29, ymm30, ymm31,
];
const ZMM: [AsmRegisterZmm; 32] = [
    zmm0, zmm1, zmm2, zmm3, zmm4, zmm5, zmm6, zmm7, zmm8, zmm9, zmm10, zmm11, zmm12, zmm13, zmm14,
    zmm15, zmm16, zmm17, zmm18, zmm19, zmm20, zmm21, zmm22, zmm23, zmm24, zmm25, zmm26, zmm27,
    zmm28, zmm29, zmm30, zmm31,
];

fn out_of_range(kind: &str, r: VReg) -> JitError {
    JitError::Assembler(format!("{kind} index {} out of range", r.0))
}

pub fn xmm(r: VReg) -> JitResult<AsmRegisterXmm> {
    XMM.get(r.0 as usize).copied().ok_or_else(|| out_of_range("xmm", r))
}

pub fn ymm(r: VReg) -> JitResult<AsmRegisterYmm> {
    YMM.get(r.0 as usize).copied().ok_or_else(|| out_of_range("ymm", r))
}

pub fn zmm(r: VReg) -> JitResult<AsmRegisterZmm> {
    ZMM.get(r.0 as usize).copied().ok_or_else(|| out_of_range("zmm", r))
}

#[inline]
pub fn addr(m: MemOperand) -> AsmMemoryOperand {
    m.base.reg64() + m.disp
}

/// Stack slot used to stage partial destination vectors.
pub const DST_STAGE: MemOperand = MemOperand::new(Gpr::Stack, 0);
/// Stack slot used to stage partial source vectors.
pub const SRC_STAGE: MemOperand = MemOperand::new(Gpr::Stack, 64);

/// xmm register reserved by the SSE lowering. Sits just past the
/// allocatable file of [`IsaLevel::Baseline`].
pub const SSE_TEMP: VReg = VReg(IsaLevel::Baseline.allocatable_registers() as u8);

/// Destructive `dst op= src` SSE instruction.
type SseOp = fn(&mut CodeAssembler, AsmRegisterXmm, AsmRegisterXmm) -> Result<(), IcedError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    Xmm,
    Ymm,
    Zmm,
}

macro_rules! vop3 {
    ($self:ident, $vop:ident, $sop:ident, $d:expr, $a:expr, $b:expr) => {{
        match $self.width {
            Width::Zmm => {
                $self.code.asm().$vop(zmm($d)?, zmm($a)?, zmm($b)?)?;
                Ok(())
            }
            Width::Ymm => {
                $self.code.asm().$vop(ymm($d)?, ymm($a)?, ymm($b)?)?;
                Ok(())
            }
            Width::Xmm => $self.sse_binary(
                $d,
                $a,
                $b,
                |asm: &mut CodeAssembler, d: AsmRegisterXmm, s: AsmRegisterXmm| asm.$sop(d, s),
            ),
        }
    }};
}

macro_rules! vop2 {
    ($self:ident, $vop:ident, $sop:ident, $d:expr, $a:expr) => {{
        match $self.width {
            Width::Zmm => $self.code.asm().$vop(zmm($d)?, zmm($a)?)?,
            Width::Ymm => $self.code.asm().$vop(ymm($d)?, ymm($a)?)?,
            Width::Xmm => $self.code.asm().$sop(xmm($d)?, xmm($a)?)?,
        }
        Ok(())
    }};
}

macro_rules! vop3m {
    ($self:ident, $vop:ident, $sop:ident, $d:expr, $a:expr, $m:expr) => {{
        match $self.width {
            Width::Zmm => {
                $self.code.asm().$vop(zmm($d)?, zmm($a)?, zmmword_ptr(addr($m)))?;
                Ok(())
            }
            Width::Ymm => {
                $self.code.asm().$vop(ymm($d)?, ymm($a)?, ymmword_ptr(addr($m)))?;
                Ok(())
            }
            Width::Xmm => {
                $self.code.asm().movups(xmm(SSE_TEMP)?, xmmword_ptr(addr($m)))?;
                $self.sse_binary(
                    $d,
                    $a,
                    SSE_TEMP,
                    |asm: &mut CodeAssembler, d: AsmRegisterXmm, s: AsmRegisterXmm| asm.$sop(d, s),
                )
            }
        }
    }};
}

pub struct X86Emitter {
    code: CodeEmitter,
    isa: IsaLevel,
    width: Width,
}

impl X86Emitter {
    pub fn new(isa: IsaLevel, capacity: usize) -> JitResult<Self> {
        let (width, code) = match isa {
            IsaLevel::Baseline => (Width::Xmm, CodeEmitter::new(capacity)?.legacy_sse()),
            IsaLevel::Avx2 => (Width::Ymm, CodeEmitter::new(capacity)?),
            IsaLevel::Avx512Core | IsaLevel::Avx512CoreVnni => (Width::Zmm, CodeEmitter::new(capacity)?),
        };
        Ok(X86Emitter { code, isa, width })
    }

    pub fn isa(&self) -> IsaLevel {
        self.isa
    }

    /// 32-bit lanes per vector.
    pub fn lanes(&self) -> usize {
        match self.width {
            Width::Xmm => 4,
            Width::Ymm => 8,
            Width::Zmm => 16,
        }
    }

    pub fn vector_bytes(&self) -> usize {
        self.lanes() * 4
    }

    #[inline]
    pub fn code(&mut self) -> &mut CodeEmitter {
        &mut self.code
    }

    #[inline]
    pub fn asm(&mut self) -> &mut CodeAssembler {
        self.code.asm()
    }

    pub fn finish(self) -> JitResult<EmittedCode> {
        self.code.finish()
    }

    /// `dst = a op b` on the destructive SSE form. `b` is copied to
    /// [`SSE_TEMP`] first when it aliases `dst`.
    fn sse_binary(&mut self, dst: VReg, a: VReg, b: VReg, op: SseOp) -> JitResult<()> {
        let (d, ra, rb) = (xmm(dst)?, xmm(a)?, xmm(b)?);
        let t = xmm(SSE_TEMP)?;
        let asm = self.code.asm();
        if dst == a {
            op(asm, d, rb)?;
        } else if dst == b {
            asm.movaps(t, rb)?;
            asm.movaps(d, ra)?;
            op(asm, d, t)?;
        } else {
            asm.movaps(d, ra)?;
            op(asm, d, rb)?;
        }
        Ok(())
    }

    // ── General-purpose registers ───────────────────────────────────────────

    pub fn load_gpr(&mut self, dst: Gpr, mem: MemOperand) -> JitResult<()> {
        self.asm().mov(dst.reg64(), qword_ptr(addr(mem)))?;
        Ok(())
    }

    pub fn mov_gpr(&mut self, dst: Gpr, src: Gpr) -> JitResult<()> {
        self.asm().mov(dst.reg64(), src.reg64())?;
        Ok(())
    }

    pub fn add_imm(&mut self, dst: Gpr, imm: usize) -> JitResult<()> {
        if imm == 0 {
            return Ok(());
        }
        let imm = i32::try_from(imm)
            .map_err(|_| JitError::Assembler(format!("immediate {imm} does not fit 32 bits")))?;
        self.asm().add(dst.reg64(), imm)?;
        Ok(())
    }

    pub fn mov_imm(&mut self, dst: Gpr, imm: usize) -> JitResult<()> {
        let imm = i32::try_from(imm)
            .map_err(|_| JitError::Assembler(format!("immediate {imm} does not fit 32 bits")))?;
        self.asm().mov(dst.reg64(), imm as i64)?;
        Ok(())
    }

    /// `dst += src * scale`, clobbering [`Gpr::Tmp`].
    pub fn add_scaled(&mut self, dst: Gpr, src: Gpr, scale: usize) -> JitResult<()> {
        let scale = i32::try_from(scale)
            .map_err(|_| JitError::Assembler(format!("scale {scale} does not fit 32 bits")))?;
        self.asm().imul_3(rax, src.reg64(), scale)?;
        self.asm().add(dst.reg64(), rax)?;
        Ok(())
    }

    /// Copy `n` dwords through `eax`.
    pub fn copy_dwords(&mut self, dst: MemOperand, src: MemOperand, n: usize) -> JitResult<()> {
        for i in 0..n as i32 {
            self.asm().mov(eax, dword_ptr(addr(src.offset(4 * i))))?;
            self.asm().mov(dword_ptr(addr(dst.offset(4 * i))), eax)?;
        }
        Ok(())
    }

    /// Copy `n` bytes through `al`.
    pub fn copy_bytes(&mut self, dst: MemOperand, src: MemOperand, n: usize) -> JitResult<()> {
        for i in 0..n as i32 {
            self.asm().movzx(eax, byte_ptr(addr(src.offset(i))))?;
            self.asm().mov(byte_ptr(addr(dst.offset(i))), al)?;
        }
        Ok(())
    }

    /// Copy `n` elements of `dt`.
    pub fn copy_elems(&mut self, dst: MemOperand, src: MemOperand, n: usize, dt: DataType) -> JitResult<()> {
        match dt.size() {
            1 => self.copy_bytes(dst, src, n),
            _ => self.copy_dwords(dst, src, n),
        }
    }

    /// Gather up to four bytes into `eax`, lowest address in the low byte.
    pub fn gather_bytes(&mut self, src: MemOperand, n: usize) -> JitResult<()> {
        self.asm().movzx(eax, byte_ptr(addr(src)))?;
        for i in 1..n.min(4) as i32 {
            self.asm().movzx(ecx, byte_ptr(addr(src.offset(i))))?;
            self.asm().shl(ecx, 8 * i as u32)?;
            self.asm().or(eax, ecx)?;
        }
        Ok(())
    }

    // ── Vector loads and stores ─────────────────────────────────────────────

    pub fn vload(&mut self, dst: VReg, mem: MemOperand) -> JitResult<()> {
        match self.width {
            Width::Zmm => self.asm().vmovups(zmm(dst)?, zmmword_ptr(addr(mem)))?,
            Width::Ymm => self.asm().vmovups(ymm(dst)?, ymmword_ptr(addr(mem)))?,
            Width::Xmm => self.asm().movups(xmm(dst)?, xmmword_ptr(addr(mem)))?,
        }
        Ok(())
    }

    pub fn vstore(&mut self, mem: MemOperand, src: VReg) -> JitResult<()> {
        match self.width {
            Width::Zmm => self.asm().vmovups(zmmword_ptr(addr(mem)), zmm(src)?)?,
            Width::Ymm => self.asm().vmovups(ymmword_ptr(addr(mem)), ymm(src)?)?,
            Width::Xmm => self.asm().movups(xmmword_ptr(addr(mem)), xmm(src)?)?,
        }
        Ok(())
    }

    pub fn vbroadcast_f32(&mut self, dst: VReg, mem: MemOperand) -> JitResult<()> {
        match self.width {
            Width::Zmm => self.asm().vbroadcastss(zmm(dst)?, dword_ptr(addr(mem)))?,
            Width::Ymm => self.asm().vbroadcastss(ymm(dst)?, dword_ptr(addr(mem)))?,
            Width::Xmm => {
                let x = xmm(dst)?;
                self.asm().movss(x, dword_ptr(addr(mem)))?;
                self.asm().shufps(x, x, 0i32)?;
            }
        }
        Ok(())
    }

    /// Broadcast the 16-bit word at `mem` to every word lane.
    pub fn vbroadcast_word(&mut self, dst: VReg, mem: MemOperand) -> JitResult<()> {
        match self.width {
            Width::Zmm => self.asm().vpbroadcastw(zmm(dst)?, word_ptr(addr(mem)))?,
            Width::Ymm => self.asm().vpbroadcastw(ymm(dst)?, word_ptr(addr(mem)))?,
            Width::Xmm => {
                self.asm().movzx(eax, word_ptr(addr(mem)))?;
                return self.vbroadcast_word_eax(dst);
            }
        }
        Ok(())
    }

    /// Broadcast the dword at `mem` to every dword lane.
    pub fn vbroadcast_dword(&mut self, dst: VReg, mem: MemOperand) -> JitResult<()> {
        match self.width {
            Width::Zmm => self.asm().vpbroadcastd(zmm(dst)?, dword_ptr(addr(mem)))?,
            Width::Ymm => self.asm().vpbroadcastd(ymm(dst)?, dword_ptr(addr(mem)))?,
            Width::Xmm => {
                let x = xmm(dst)?;
                self.asm().movd(x, dword_ptr(addr(mem)))?;
                self.asm().pshufd(x, x, 0i32)?;
            }
        }
        Ok(())
    }

    /// Broadcast the low word of `eax`.
    pub fn vbroadcast_word_eax(&mut self, dst: VReg) -> JitResult<()> {
        match self.width {
            Width::Zmm => self.asm().vpbroadcastw(zmm(dst)?, eax)?,
            Width::Ymm => {
                self.asm().vmovd(xmm(dst)?, eax)?;
                self.asm().vpbroadcastw(ymm(dst)?, xmm(dst)?)?;
            }
            Width::Xmm => {
                let x = xmm(dst)?;
                self.asm().movd(x, eax)?;
                self.asm().pshuflw(x, x, 0i32)?;
                self.asm().pshufd(x, x, 0i32)?;
            }
        }
        Ok(())
    }

    /// Broadcast `eax`.
    pub fn vbroadcast_dword_eax(&mut self, dst: VReg) -> JitResult<()> {
        match self.width {
            Width::Zmm => self.asm().vpbroadcastd(zmm(dst)?, eax)?,
            Width::Ymm => {
                self.asm().vmovd(xmm(dst)?, eax)?;
                self.asm().vpbroadcastd(ymm(dst)?, xmm(dst)?)?;
            }
            Width::Xmm => {
                let x = xmm(dst)?;
                self.asm().movd(x, eax)?;
                self.asm().pshufd(x, x, 0i32)?;
            }
        }
        Ok(())
    }

    /// Load one vector of 8-bit values and widen them to 32-bit lanes.
    pub fn vwiden_bytes_to_dwords(&mut self, dst: VReg, mem: MemOperand, signed: bool) -> JitResult<()> {
        match (self.width, signed) {
            (Width::Zmm, true) => self.asm().vpmovsxbd(zmm(dst)?, xmmword_ptr(addr(mem)))?,
            (Width::Zmm, false) => self.asm().vpmovzxbd(zmm(dst)?, xmmword_ptr(addr(mem)))?,
            (Width::Ymm, true) => self.asm().vpmovsxbd(ymm(dst)?, qword_ptr(addr(mem)))?,
            (Width::Ymm, false) => self.asm().vpmovzxbd(ymm(dst)?, qword_ptr(addr(mem)))?,
            (Width::Xmm, true) => self.asm().pmovsxbd(xmm(dst)?, dword_ptr(addr(mem)))?,
            (Width::Xmm, false) => self.asm().pmovzxbd(xmm(dst)?, dword_ptr(addr(mem)))?,
        }
        Ok(())
    }

    /// Zero-extend the low half of `src` from bytes to words.
    pub fn vwiden_bytes_to_words(&mut self, dst: VReg, src: VReg) -> JitResult<()> {
        match self.width {
            Width::Zmm => self.asm().vpmovzxbw(zmm(dst)?, ymm(src)?)?,
            Width::Ymm => self.asm().vpmovzxbw(ymm(dst)?, xmm(src)?)?,
            Width::Xmm => self.asm().pmovzxbw(xmm(dst)?, xmm(src)?)?,
        }
        Ok(())
    }

    // ── Integer arithmetic ──────────────────────────────────────────────────

    pub fn vxor(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()> {
        match self.width {
            Width::Zmm => {
                self.asm().vpxord(zmm(dst)?, zmm(a)?, zmm(b)?)?;
                Ok(())
            }
            Width::Ymm => {
                self.asm().vpxor(ymm(dst)?, ymm(a)?, ymm(b)?)?;
                Ok(())
            }
            Width::Xmm => self.sse_binary(dst, a, b, |asm: &mut CodeAssembler, d: AsmRegisterXmm, s: AsmRegisterXmm| {
                asm.pxor(d, s)
            }),
        }
    }

    pub fn vsub_i32(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()> {
        vop3!(self, vpsubd, psubd, dst, a, b)
    }

    /// Pairwise 16-bit multiply, adjacent products summed into dwords.
    pub fn vpmaddwd(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()> {
        vop3!(self, vpmaddwd, pmaddwd, dst, a, b)
    }

    /// `acc += sum of four u8 x s8 products` per dword lane.
    pub fn vpdpbusd(&mut self, acc: VReg, src: VReg, wei: VReg) -> JitResult<()> {
        if self.width != Width::Zmm {
            return Err(JitError::Unsupported("vpdpbusd needs avx512_core_vnni".into()));
        }
        self.asm().vpdpbusd(zmm(acc)?, zmm(src)?, zmm(wei)?)?;
        Ok(())
    }

    pub fn vpmulld_mem(&mut self, dst: VReg, a: VReg, mem: MemOperand) -> JitResult<()> {
        vop3m!(self, vpmulld, pmulld, dst, a, mem)
    }

    /// `dst += a * [mem]`.
    pub fn vfmadd231_mem(&mut self, dst: VReg, a: VReg, mem: MemOperand) -> JitResult<()> {
        match self.width {
            Width::Zmm => self.asm().vfmadd231ps(zmm(dst)?, zmm(a)?, zmmword_ptr(addr(mem)))?,
            Width::Ymm => self.asm().vfmadd231ps(ymm(dst)?, ymm(a)?, ymmword_ptr(addr(mem)))?,
            Width::Xmm => {
                let t = xmm(SSE_TEMP)?;
                self.asm().movups(t, xmmword_ptr(addr(mem)))?;
                self.asm().mulps(t, xmm(a)?)?;
                self.asm().addps(xmm(dst)?, t)?;
            }
        }
        Ok(())
    }

    // ── Store conversion ────────────────────────────────────────────────────

    /// Store `v` (f32 lanes for an f32 destination, i32 lanes otherwise) as
    /// `dt`. A tail writes only the first `n` elements, staging through the
    /// stack. `scratch` may be clobbered; `v` is clobbered for 8-bit types.
    pub fn store_as(
        &mut self,
        mem: MemOperand,
        v: VReg,
        dt: DataType,
        scratch: VReg,
        tail: Option<usize>,
    ) -> JitResult<()> {
        let target = if tail.is_some() { DST_STAGE } else { mem };
        match (dt, self.width) {
            (DataType::F32 | DataType::S32, _) => self.vstore(target, v)?,
            (DataType::S8 | DataType::U8, Width::Zmm) => {
                // values are already in range, truncation is exact
                self.asm().vpmovdb(xmmword_ptr(addr(target)), zmm(v)?)?;
            }
            (DataType::S8 | DataType::U8, Width::Ymm) => {
                self.asm().vextracti128(xmm(scratch)?, ymm(v)?, 1i32)?;
                self.asm().vpackssdw(xmm(v)?, xmm(v)?, xmm(scratch)?)?;
                if dt == DataType::S8 {
                    self.asm().vpacksswb(xmm(v)?, xmm(v)?, xmm(v)?)?;
                } else {
                    self.asm().vpackuswb(xmm(v)?, xmm(v)?, xmm(v)?)?;
                }
                self.asm().vmovq(qword_ptr(addr(target)), xmm(v)?)?;
            }
            (DataType::S8 | DataType::U8, Width::Xmm) => {
                let x = xmm(v)?;
                self.asm().packssdw(x, x)?;
                if dt == DataType::S8 {
                    self.asm().packsswb(x, x)?;
                } else {
                    self.asm().packuswb(x, x)?;
                }
                self.asm().movd(dword_ptr(addr(target)), x)?;
            }
        }
        if let Some(n) = tail {
            self.copy_elems(mem, DST_STAGE, n, dt)?;
        }
        Ok(())
    }

    /// Clamp f32 lanes to the range of `dt` and convert to i32. `lo` and
    /// `hi` must already hold the broadcast bounds.
    pub fn saturate_to_i32(&mut self, v: VReg, lo: VReg, hi: VReg) -> JitResult<()> {
        self.vmin(v, v, hi)?;
        self.vmax(v, v, lo)?;
        self.vcvt_f32_i32(v, v)
    }
}

impl SimdOps for X86Emitter {
    fn vadd(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()> {
        vop3!(self, vaddps, addps, dst, a, b)
    }

    fn vsub(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()> {
        vop3!(self, vsubps, subps, dst, a, b)
    }

    fn vmul(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()> {
        vop3!(self, vmulps, mulps, dst, a, b)
    }

    fn vdiv(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()> {
        vop3!(self, vdivps, divps, dst, a, b)
    }

    fn vmax(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()> {
        vop3!(self, vmaxps, maxps, dst, a, b)
    }

    fn vmin(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()> {
        vop3!(self, vminps, minps, dst, a, b)
    }

    fn vsqrt(&mut self, dst: VReg, a: VReg) -> JitResult<()> {
        vop2!(self, vsqrtps, sqrtps, dst, a)
    }

    fn vand(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()> {
        match self.width {
            Width::Zmm => {
                self.asm().vpandd(zmm(dst)?, zmm(a)?, zmm(b)?)?;
                Ok(())
            }
            Width::Ymm => {
                self.asm().vpand(ymm(dst)?, ymm(a)?, ymm(b)?)?;
                Ok(())
            }
            Width::Xmm => self.sse_binary(dst, a, b, |asm: &mut CodeAssembler, d: AsmRegisterXmm, s: AsmRegisterXmm| {
                asm.pand(d, s)
            }),
        }
    }

    fn vfmadd213(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()> {
        match self.width {
            Width::Zmm => self.asm().vfmadd213ps(zmm(dst)?, zmm(a)?, zmm(b)?)?,
            Width::Ymm => self.asm().vfmadd213ps(ymm(dst)?, ymm(a)?, ymm(b)?)?,
            Width::Xmm => {
                let t = xmm(SSE_TEMP)?;
                self.asm().movaps(t, xmm(dst)?)?;
                self.asm().mulps(t, xmm(a)?)?;
                self.asm().addps(t, xmm(b)?)?;
                self.asm().movaps(xmm(dst)?, t)?;
            }
        }
        Ok(())
    }

    fn vfmadd231(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()> {
        match self.width {
            Width::Zmm => self.asm().vfmadd231ps(zmm(dst)?, zmm(a)?, zmm(b)?)?,
            Width::Ymm => self.asm().vfmadd231ps(ymm(dst)?, ymm(a)?, ymm(b)?)?,
            Width::Xmm => {
                let t = xmm(SSE_TEMP)?;
                self.asm().movaps(t, xmm(a)?)?;
                self.asm().mulps(t, xmm(b)?)?;
                self.asm().addps(xmm(dst)?, t)?;
            }
        }
        Ok(())
    }

    fn vround(&mut self, dst: VReg, a: VReg) -> JitResult<()> {
        match self.width {
            Width::Zmm => self.asm().vrndscaleps(zmm(dst)?, zmm(a)?, 0i32)?,
            Width::Ymm => self.asm().vroundps(ymm(dst)?, ymm(a)?, 0i32)?,
            Width::Xmm => self.asm().roundps(xmm(dst)?, xmm(a)?, 0i32)?,
        }
        Ok(())
    }

    fn vcvt_f32_i32(&mut self, dst: VReg, a: VReg) -> JitResult<()> {
        vop2!(self, vcvtps2dq, cvtps2dq, dst, a)
    }

    fn vcvt_i32_f32(&mut self, dst: VReg, a: VReg) -> JitResult<()> {
        vop2!(self, vcvtdq2ps, cvtdq2ps, dst, a)
    }

    fn vadd_i32(&mut self, dst: VReg, a: VReg, b: VReg) -> JitResult<()> {
        vop3!(self, vpaddd, paddd, dst, a, b)
    }

    fn vshl_i32(&mut self, dst: VReg, a: VReg, imm: u8) -> JitResult<()> {
        match self.width {
            Width::Zmm => self.asm().vpslld(zmm(dst)?, zmm(a)?, imm as i32)?,
            Width::Ymm => self.asm().vpslld(ymm(dst)?, ymm(a)?, imm as i32)?,
            Width::Xmm => {
                if dst != a {
                    self.asm().movaps(xmm(dst)?, xmm(a)?)?;
                }
                self.asm().pslld(xmm(dst)?, imm as i32)?;
            }
        }
        Ok(())
    }

    fn vbroadcast_bits(&mut self, dst: VReg, bits: u32) -> JitResult<()> {
        self.asm().mov(eax, bits)?;
        self.vbroadcast_dword_eax(dst)
    }

    fn vzero(&mut self, dst: VReg) -> JitResult<()> {
        self.vxor(dst, dst, dst)
    }

    fn vmov(&mut self, dst: VReg, src: VReg) -> JitResult<()> {
        vop2!(self, vmovaps, movaps, dst, src)
    }

    fn vadd_mem(&mut self, dst: VReg, a: VReg, mem: MemOperand) -> JitResult<()> {
        vop3m!(self, vaddps, addps, dst, a, mem)
    }

    fn vmul_mem(&mut self, dst: VReg, a: VReg, mem: MemOperand) -> JitResult<()> {
        vop3m!(self, vmulps, mulps, dst, a, mem)
    }

    fn vload_as_f32(&mut self, dst: VReg, mem: MemOperand, dt: DataType) -> JitResult<()> {
        match dt {
            DataType::F32 => self.vload(dst, mem),
            DataType::S32 => {
                self.vload(dst, mem)?;
                self.vcvt_i32_f32(dst, dst)
            }
            DataType::S8 | DataType::U8 => {
                self.vwiden_bytes_to_dwords(dst, mem, dt == DataType::S8)?;
                self.vcvt_i32_f32(dst, dst)
            }
        }
    }
}
