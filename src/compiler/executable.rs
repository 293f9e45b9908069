//! GeneratedRoutine: mmap'd executable code plus its entry table.
//!
//! The emitted bytes are copied into an anonymous read-write mapping which
//! is then flipped to read-execute. A routine is immutable from then on and
//! may be called concurrently from any number of threads.

use crate::compiler::abi::CallRecord;
use crate::compiler::codegen::EmittedCode;
use crate::types::{JitError, JitResult};

/// Signature of every generated entry point.
pub type KernelFn = unsafe extern "C" fn(*const CallRecord);

pub struct GeneratedRoutine {
    code: ExecutableBuffer,
    entries: Vec<usize>,
    /// Plan fingerprint the code was generated from.
    pub fingerprint: u64,
}

impl GeneratedRoutine {
    pub fn new(emitted: EmittedCode, fingerprint: u64) -> JitResult<Self> {
        if emitted.code.is_empty() || emitted.entries.is_empty() {
            return Err(JitError::ExecutableMemory("routine has no code".into()));
        }
        if let Some(&bad) = emitted.entries.iter().find(|&&e| e >= emitted.code.len()) {
            return Err(JitError::ExecutableMemory(format!(
                "entry offset {bad} outside {} code bytes",
                emitted.code.len()
            )));
        }
        let code = ExecutableBuffer::new(&emitted.code)?;
        log::trace!(
            "mapped routine {fingerprint:016x}: {} bytes, {} entries",
            emitted.code.len(),
            emitted.entries.len()
        );
        Ok(GeneratedRoutine {
            code,
            entries: emitted.entries,
            fingerprint,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[usize] {
        &self.entries
    }

    /// Bytes of machine code (not the page-rounded mapping).
    pub fn code_size(&self) -> usize {
        self.code.code_len
    }

    /// The executable bytes, for disassembly and inspection.
    pub fn code_bytes(&self) -> &[u8] {
        // SAFETY: the mapping is readable and lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.code.ptr, self.code.code_len) }
    }

    /// Function pointer of entry `index`.
    ///
    /// # Safety
    /// The caller must only invoke it with a record matching the plan the
    /// routine was generated from.
    pub unsafe fn entry(&self, index: usize) -> JitResult<KernelFn> {
        let off = *self.entries.get(index).ok_or_else(|| {
            JitError::ExecutableMemory(format!("entry {index} of {}", self.entries.len()))
        })?;
        Ok(std::mem::transmute::<*mut u8, KernelFn>(self.code.ptr.add(off)))
    }

    /// Run entry `index` on one work item.
    ///
    /// # Safety
    /// Every pointer in `args` must be valid for the reads and writes the
    /// plan implies, and no other call may write the same destination bytes
    /// concurrently.
    #[inline]
    pub unsafe fn call(&self, index: usize, args: &CallRecord) -> JitResult<()> {
        let f = self.entry(index)?;
        f(args as *const CallRecord);
        Ok(())
    }
}

impl std::fmt::Debug for GeneratedRoutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedRoutine")
            .field("fingerprint", &format_args!("{:016x}", self.fingerprint))
            .field("code_size", &self.code.code_len)
            .field("entries", &self.entries)
            .finish()
    }
}

/// An executable memory buffer backed by mmap.
struct ExecutableBuffer {
    ptr: *mut u8,
    len: usize,
    code_len: usize,
}

// SAFETY: ExecutableBuffer owns its mapping exclusively and the pages are
// immutable (PROT_READ|PROT_EXEC) after construction.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    fn new(code: &[u8]) -> JitResult<Self> {
        let page = page_size();
        let len = (code.len() + page - 1) & !(page - 1);

        // SAFETY: anonymous private mapping, no file descriptor; the result
        // is checked against MAP_FAILED.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(JitError::ExecutableMemory(format!(
                "mmap of {len} bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let ptr = ptr as *mut u8;

        // SAFETY: the mapping is at least code.len() bytes and writable.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }

        // SAFETY: ptr/len describe the mapping created above.
        let ret = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::munmap(ptr as *mut _, len);
            }
            return Err(JitError::ExecutableMemory(format!("mprotect failed: {err}")));
        }

        Ok(ExecutableBuffer { ptr, len, code_len: code.len() })
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut _, self.len);
        }
    }
}

fn page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 {
        n as usize
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_code_is_rejected() {
        let emitted = EmittedCode { code: Vec::new(), entries: Vec::new() };
        assert!(matches!(
            GeneratedRoutine::new(emitted, 0),
            Err(JitError::ExecutableMemory(_))
        ));
    }

    #[test]
    fn entry_outside_code_is_rejected() {
        let emitted = EmittedCode { code: vec![0xC3], entries: vec![1] };
        assert!(GeneratedRoutine::new(emitted, 0).is_err());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn calls_each_entry() {
        // two bare `ret` entry points
        let emitted = EmittedCode { code: vec![0xC3, 0xC3], entries: vec![0, 1] };
        let routine = GeneratedRoutine::new(emitted, 0xabcd).unwrap();
        assert_eq!(routine.entry_count(), 2);
        assert_eq!(routine.code_bytes(), &[0xC3, 0xC3]);
        let rec = CallRecord::empty();
        unsafe {
            routine.call(0, &rec).unwrap();
            routine.call(1, &rec).unwrap();
            assert!(routine.call(2, &rec).is_err());
        }
    }
}
