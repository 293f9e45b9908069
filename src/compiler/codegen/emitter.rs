//! Code buffer and function framing.
//!
//! One [`CodeEmitter`] accumulates every entry point of a routine. Each
//! entry is a complete function with its own prologue, a single exit label
//! and a single `ret`; generators jump to the exit label instead of
//! returning early. The buffer has a hard capacity: exceeding it is a
//! [`JitError::GenerationOverflow`], never a truncated routine.

use iced_x86::code_asm::*;
use iced_x86::BlockEncoderOptions;

use crate::types::{JitError, JitResult};

/// Bytes of stack every generated function reserves for staging partial
/// vectors (`[rsp]` for destination tails, `[rsp + 64]` for source tails).
pub const STACK_BYTES: i32 = 128;

/// Callee-saved registers pushed by the prologue, in push order.
const SAVED: [AsmRegister64; 6] = [rbx, rbp, r12, r13, r14, r15];

/// Assembled bytes and the offset of every entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedCode {
    pub code: Vec<u8>,
    pub entries: Vec<usize>,
}

pub struct CodeEmitter {
    asm: CodeAssembler,
    capacity: usize,
    entries: Vec<CodeLabel>,
    exit: Option<CodeLabel>,
    vzeroupper: bool,
}

impl CodeEmitter {
    pub fn new(capacity: usize) -> JitResult<Self> {
        Ok(CodeEmitter {
            asm: CodeAssembler::new(64)?,
            capacity,
            entries: Vec::new(),
            exit: None,
            vzeroupper: true,
        })
    }

    /// Emit no VEX instructions in the framing, for code that must run
    /// on SSE-only hosts.
    pub fn legacy_sse(mut self) -> Self {
        self.vzeroupper = false;
        self
    }

    #[inline]
    pub fn asm(&mut self) -> &mut CodeAssembler {
        &mut self.asm
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn new_label(&mut self) -> CodeLabel {
        self.asm.create_label()
    }

    /// Place `label` at the current position. Each label gets its own
    /// zero-length anchor so consecutive labels never collide.
    pub fn bind(&mut self, label: &mut CodeLabel) -> JitResult<()> {
        self.asm.set_label(label)?;
        self.asm.zero_bytes()?;
        Ok(())
    }

    /// Open a new entry point and emit its prologue. Returns the entry index.
    pub fn begin_function(&mut self) -> JitResult<usize> {
        if self.exit.is_some() {
            return Err(JitError::Assembler("previous function was not closed".into()));
        }
        let mut entry = self.asm.create_label();
        self.bind(&mut entry)?;
        for r in SAVED {
            self.asm.push(r)?;
        }
        self.asm.sub(rsp, STACK_BYTES)?;
        self.entries.push(entry);
        self.exit = Some(self.asm.create_label());
        Ok(self.entries.len() - 1)
    }

    /// Label of the open function's epilogue.
    pub fn exit_label(&self) -> JitResult<CodeLabel> {
        self.exit
            .ok_or_else(|| JitError::Assembler("no open function".into()))
    }

    /// Bind the exit label and emit the epilogue with the function's only `ret`.
    pub fn end_function(&mut self) -> JitResult<()> {
        let mut exit = self
            .exit
            .take()
            .ok_or_else(|| JitError::Assembler("end_function without begin_function".into()))?;
        self.bind(&mut exit)?;
        self.asm.add(rsp, STACK_BYTES)?;
        for r in SAVED.iter().rev() {
            self.asm.pop(*r)?;
        }
        if self.vzeroupper {
            self.asm.vzeroupper()?;
        }
        self.asm.ret()?;
        Ok(())
    }

    /// Assemble at offset 0 and resolve entry offsets.
    pub fn finish(mut self) -> JitResult<EmittedCode> {
        if self.exit.is_some() {
            return Err(JitError::Assembler("function left open".into()));
        }
        let result = self
            .asm
            .assemble_options(0, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)?;
        let entries = self
            .entries
            .iter()
            .map(|l| result.label_ip(l).map(|ip| ip as usize))
            .collect::<Result<Vec<_>, _>>()?;
        let code = result.inner.code_buffer;
        if code.len() > self.capacity {
            return Err(JitError::GenerationOverflow {
                needed: code.len(),
                capacity: self.capacity,
            });
        }
        log::trace!("assembled {} bytes, {} entries", code.len(), entries.len());
        Ok(EmittedCode { code, entries })
    }
}
