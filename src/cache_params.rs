//! Data-cache sizes and cache-line aligned storage.
//!
//! The planner sizes reduction working sets against L1D and decides the
//! float input-channel split against L2. Both are read once, from CPUID
//! leaf 4 when available and from sysfs otherwise.

use std::alloc::Layout;
use std::sync::OnceLock;

use crate::types::{JitError, JitResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheSizes {
    pub l1d: usize,
    pub l2: usize,
}

impl CacheSizes {
    /// Used when neither source answers.
    pub const FALLBACK: CacheSizes = CacheSizes { l1d: 32 << 10, l2: 512 << 10 };
}

impl Default for CacheSizes {
    fn default() -> Self {
        CacheSizes::FALLBACK
    }
}

/// One data or unified cache reported by the platform.
#[derive(Debug, Clone, Copy)]
struct CacheLevel {
    level: u32,
    /// Instruction-only caches are filtered out by the readers.
    data: bool,
    bytes: usize,
}

fn summarise(levels: &[CacheLevel]) -> Option<CacheSizes> {
    let find = |lvl| levels.iter().find(|c| c.level == lvl && c.data).map(|c| c.bytes);
    Some(CacheSizes { l1d: find(1)?, l2: find(2)? })
}

#[cfg(target_arch = "x86_64")]
fn cpuid_levels() -> Vec<CacheLevel> {
    use std::arch::x86_64::{__cpuid, __cpuid_count};
    // SAFETY: cpuid exists on every x86-64 processor.
    if unsafe { __cpuid(0) }.eax < 4 {
        return Vec::new();
    }
    let mut out = Vec::new();
    for sub in 0..16 {
        // SAFETY: leaf 4 is supported (checked above).
        let r = unsafe { __cpuid_count(4, sub) };
        let kind = r.eax & 0x1f;
        if kind == 0 {
            break;
        }
        let field = |v: u32, shift: u32, bits: u32| ((v >> shift) & ((1 << bits) - 1)) as usize + 1;
        let bytes = field(r.ebx, 22, 10) * field(r.ebx, 12, 10) * field(r.ebx, 0, 12) * (r.ecx as usize + 1);
        out.push(CacheLevel {
            level: (r.eax >> 5) & 0x7,
            data: kind != 2,
            bytes,
        });
    }
    out
}

#[cfg(target_os = "linux")]
fn sysfs_levels() -> Vec<CacheLevel> {
    let read = |dir: &str, name: &str| std::fs::read_to_string(format!("{dir}/{name}")).ok();
    let parse_size = |s: &str| -> Option<usize> {
        let s = s.trim();
        match s.as_bytes().last()? {
            b'K' => s[..s.len() - 1].parse::<usize>().ok().map(|v| v << 10),
            b'M' => s[..s.len() - 1].parse::<usize>().ok().map(|v| v << 20),
            _ => s.parse().ok(),
        }
    };
    (0..8)
        .filter_map(|i| {
            let dir = format!("/sys/devices/system/cpu/cpu0/cache/index{i}");
            let level = read(&dir, "level")?.trim().parse().ok()?;
            let kind = read(&dir, "type")?;
            let bytes = parse_size(&read(&dir, "size")?)?;
            Some(CacheLevel { level, data: kind.trim() != "Instruction", bytes })
        })
        .collect()
}

fn detect_cache_sizes() -> CacheSizes {
    #[cfg(target_arch = "x86_64")]
    {
        if let Some(s) = summarise(&cpuid_levels()) {
            return s;
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Some(s) = summarise(&sysfs_levels()) {
            return s;
        }
    }
    log::debug!("cache sizes unavailable, assuming {:?}", CacheSizes::FALLBACK);
    CacheSizes::FALLBACK
}

static CACHE_SIZES: OnceLock<CacheSizes> = OnceLock::new();

/// Data-cache sizes of the host, detected on first use.
pub fn cache_sizes() -> CacheSizes {
    *CACHE_SIZES.get_or_init(detect_cache_sizes)
}

// ── Cache-line aligned buffer ─────────────────────────────────────────

/// Zero-initialised byte buffer aligned to 64 bytes.
///
/// Holds packed weights and scratch pads so vector loads never straddle a
/// cache line unnecessarily.
pub struct AlignedBytes {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: AlignedBytes owns its allocation exclusively; shared access only
// hands out `&[u8]`.
unsafe impl Send for AlignedBytes {}
unsafe impl Sync for AlignedBytes {}

impl AlignedBytes {
    pub const ALIGN: usize = 64;

    pub fn zeroed(len: usize) -> JitResult<Self> {
        if len == 0 {
            return Ok(AlignedBytes { ptr: std::ptr::null_mut(), len: 0 });
        }
        let layout = Layout::from_size_align(len, Self::ALIGN)
            .map_err(|e| JitError::BufferMismatch(format!("bad layout for {len} bytes: {e}")))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        Ok(AlignedBytes { ptr, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: ptr is valid for len initialised bytes.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: ptr is valid for len initialised bytes and uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for AlignedBytes {
    fn drop(&mut self) {
        if !self.ptr.is_null() && self.len > 0 {
            if let Ok(layout) = Layout::from_size_align(self.len, Self::ALIGN) {
                // SAFETY: allocated in `zeroed` with this exact layout.
                unsafe { std::alloc::dealloc(self.ptr, layout) };
            }
        }
    }
}

impl std::fmt::Debug for AlignedBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBytes").field("len", &self.len).finish()
    }
}
