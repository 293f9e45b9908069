//! Call record passed to every generated entry point.
//!
//! Entry points have the signature `extern "C" fn(*const CallRecord)`; the
//! record pointer arrives in `rdi`. Every field is eight bytes and the
//! offsets below are baked into generated code.

use std::ptr;

pub const OFF_SRC: i32 = 0;
pub const OFF_WEIGHTS: i32 = 8;
pub const OFF_DST: i32 = 16;
pub const OFF_CHANNEL_PARAMS: i32 = 24;
pub const OFF_COMPENSATION: i32 = 32;
pub const OFF_KH_TRIP: i32 = 40;
pub const OFF_KH_TOP: i32 = 48;
pub const OFF_KH_BOTTOM: i32 = 56;
pub const OFF_FLAGS: i32 = 64;

/// First input-channel chunk: initialise accumulators from the bias.
pub const FLAG_IC_FIRST: u64 = 1;
/// Last input-channel chunk: run post-ops.
pub const FLAG_IC_LAST: u64 = 2;

/// Per-invocation arguments of one work item.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CallRecord {
    /// First source pixel of the block on the first overlapping input row.
    /// May point before the row when the block starts in left padding.
    pub src: *const u8,
    /// Kernel row 0 of the first channel block of the chunk.
    pub weights: *const u8,
    pub dst: *mut u8,
    /// Staged per-channel vectors, offset to the chunk's first channel.
    pub channel_params: *const u8,
    pub compensation: *const i32,
    /// Kernel rows overlapping the input.
    pub kh_trip: u64,
    /// Kernel rows above the input.
    pub kh_overflow_top: u64,
    /// Kernel rows below the input.
    pub kh_overflow_bottom: u64,
    pub flags: u64,
}

// SAFETY: the record only carries addresses; the dispatcher guarantees the
// buffers behind them outlive every call and that writes are disjoint.
unsafe impl Send for CallRecord {}
unsafe impl Sync for CallRecord {}

impl CallRecord {
    pub const fn empty() -> Self {
        CallRecord {
            src: ptr::null(),
            weights: ptr::null(),
            dst: ptr::null_mut(),
            channel_params: ptr::null(),
            compensation: ptr::null(),
            kh_trip: 0,
            kh_overflow_top: 0,
            kh_overflow_bottom: 0,
            flags: FLAG_IC_FIRST | FLAG_IC_LAST,
        }
    }
}

impl Default for CallRecord {
    fn default() -> Self {
        CallRecord::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn offsets_match_generated_code() {
        assert_eq!(offset_of!(CallRecord, src) as i32, OFF_SRC);
        assert_eq!(offset_of!(CallRecord, weights) as i32, OFF_WEIGHTS);
        assert_eq!(offset_of!(CallRecord, dst) as i32, OFF_DST);
        assert_eq!(offset_of!(CallRecord, channel_params) as i32, OFF_CHANNEL_PARAMS);
        assert_eq!(offset_of!(CallRecord, compensation) as i32, OFF_COMPENSATION);
        assert_eq!(offset_of!(CallRecord, kh_trip) as i32, OFF_KH_TRIP);
        assert_eq!(offset_of!(CallRecord, kh_overflow_top) as i32, OFF_KH_TOP);
        assert_eq!(offset_of!(CallRecord, kh_overflow_bottom) as i32, OFF_KH_BOTTOM);
        assert_eq!(offset_of!(CallRecord, flags) as i32, OFF_FLAGS);
        assert_eq!(size_of::<CallRecord>(), 72);
    }
}
