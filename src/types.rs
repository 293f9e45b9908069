//! Element types shared by descriptors, planners and generated code, plus
//! the crate-wide error type.

use std::fmt;

use thiserror::Error;

/// Element type of a tensor operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    S32,
    S8,
    U8,
}

impl DataType {
    /// Size of one element in bytes.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 | DataType::S32 => 4,
            DataType::S8 | DataType::U8 => 1,
        }
    }

    #[inline]
    pub const fn is_int8(self) -> bool {
        matches!(self, DataType::S8 | DataType::U8)
    }

    #[inline]
    pub const fn is_signed_int8(self) -> bool {
        matches!(self, DataType::S8)
    }

    /// Saturation interval applied (in f32) before converting to this type.
    ///
    /// The s32 upper bound is the largest f32 below 2^31, which keeps
    /// `vcvtps2dq` out of its "integer indefinite" result.
    pub const fn saturation_bounds(self) -> (f32, f32) {
        match self {
            DataType::F32 => (f32::MIN, f32::MAX),
            DataType::S32 => (-2_147_483_648.0, 2_147_483_520.0),
            DataType::S8 => (-128.0, 127.0),
            DataType::U8 => (0.0, 255.0),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::F32 => "f32",
            DataType::S32 => "s32",
            DataType::S8 => "s8",
            DataType::U8 => "u8",
        };
        f.write_str(s)
    }
}

/// Errors produced while planning, generating or launching kernels.
///
/// Malformed call records are deliberately absent: the call boundary is
/// trusted and never validated inside generated code.
#[derive(Debug, Error)]
pub enum JitError {
    /// The descriptor is well formed but no generated kernel covers it on
    /// the given capability set. Callers are expected to fall back.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    #[error("invalid problem descriptor: {0}")]
    InvalidDescriptor(String),

    /// Emitted code does not fit the reserved executable region.
    #[error("generated code needs {needed} bytes but only {capacity} are reserved")]
    GenerationOverflow { needed: usize, capacity: usize },

    #[error("assembler error: {0}")]
    Assembler(String),

    #[error("executable memory: {0}")]
    ExecutableMemory(String),

    #[error("buffer mismatch: {0}")]
    BufferMismatch(String),

    #[error("thread pool: {0}")]
    ThreadPool(String),
}

impl From<iced_x86::IcedError> for JitError {
    fn from(e: iced_x86::IcedError) -> Self {
        JitError::Assembler(e.to_string())
    }
}

pub type JitResult<T> = Result<T, JitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_and_bounds() {
        assert_eq!(DataType::F32.size(), 4);
        assert_eq!(DataType::U8.size(), 1);
        assert!(DataType::S8.is_signed_int8());
        assert!(!DataType::U8.is_signed_int8());
        let (lo, hi) = DataType::S32.saturation_bounds();
        assert_eq!(hi as i64, 2_147_483_520);
        assert_eq!(lo as i64, i32::MIN as i64);
    }

    #[test]
    fn error_messages_carry_context() {
        let e = JitError::GenerationOverflow { needed: 5000, capacity: 4096 };
        let msg = e.to_string();
        assert!(msg.contains("5000") && msg.contains("4096"), "{msg}");
        assert!(JitError::Unsupported("no avx2".into())
            .to_string()
            .contains("no avx2"));
    }
}
