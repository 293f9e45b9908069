//! Scratch-pad layout and the caller-owned scratch buffer.
//!
//! The planner decides which per-channel f32 vectors a kernel reads (staged
//! bias, per-channel output scales). Each vector covers every padded output
//! channel so the last, partial channel block can still be read at full
//! vector width. Vectors start on 64-byte boundaries.

use crate::cache_params::AlignedBytes;
use crate::types::{JitError, JitResult};

/// Alignment of every scratch-pad vector and of the pad itself.
pub const SCRATCHPAD_ALIGN: usize = 64;

#[inline]
pub(crate) fn align_up(n: usize, a: usize) -> usize {
    (n + a - 1) / a * a
}

/// Contents of one staged per-channel vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelVector {
    /// Bias converted to f32 and multiplied by the bias scale.
    Bias,
    /// Scales of the per-channel rescale at this post-op position.
    Scales { post_op: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScratchpadLayout {
    /// Channels per vector, rounded up to whole vector blocks.
    pub padded_channels: usize,
    /// Distance in bytes between consecutive vectors.
    pub vector_stride: usize,
    pub vectors: Vec<ChannelVector>,
    pub size: usize,
    pub align: usize,
}

impl ScratchpadLayout {
    pub fn new(padded_channels: usize, vectors: Vec<ChannelVector>) -> Self {
        let vector_stride = align_up(padded_channels * 4, SCRATCHPAD_ALIGN);
        let size = vector_stride * vectors.len();
        ScratchpadLayout {
            padded_channels,
            vector_stride,
            vectors,
            size,
            align: SCRATCHPAD_ALIGN,
        }
    }

    /// Byte offset of `which`, if the kernel reads it.
    pub fn offset_of(&self, which: ChannelVector) -> Option<usize> {
        self.vectors
            .iter()
            .position(|v| *v == which)
            .map(|i| i * self.vector_stride)
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Caller-owned scratch memory sized from a [`ScratchpadLayout`].
///
/// Generated routines only read it; the dispatcher stages its contents once
/// per execution before any work item runs, so one pad can be shared by all
/// workers of that execution.
#[derive(Debug)]
pub struct Scratchpad {
    buf: AlignedBytes,
}

impl Scratchpad {
    pub fn new(layout: &ScratchpadLayout) -> JitResult<Self> {
        Ok(Scratchpad { buf: AlignedBytes::zeroed(layout.size)? })
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn check(&self, layout: &ScratchpadLayout) -> JitResult<()> {
        if self.buf.len() < layout.size {
            return Err(JitError::BufferMismatch(format!(
                "scratch pad holds {} bytes, plan needs {}",
                self.buf.len(),
                layout.size
            )));
        }
        Ok(())
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }

    /// Mutable view of one staged vector.
    pub(crate) fn vector_mut(&mut self, layout: &ScratchpadLayout, which: ChannelVector) -> Option<&mut [f32]> {
        let off = layout.offset_of(which)?;
        let bytes = &mut self.buf.as_mut_slice()[off..off + layout.padded_channels * 4];
        Some(bytemuck::cast_slice_mut(bytes))
    }
}
