//! Error types for the allocator

use thiserror::Error;

/// Errors returned by [`Heap`](crate::Heap) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  /// The OS refused to map more memory.
  #[error("out of memory: mapping {bytes} bytes failed (errno {errno})")]
  OutOfMemory { bytes: usize, errno: i32 },

  /// Zero-sized request, or one too large to express as a mapping length.
  #[error("invalid allocation size {0}")]
  InvalidSize(usize),

  /// `release` was given something that is not a live allocation.
  #[error("invalid pointer {addr:#x}: {fault}")]
  InvalidPointer { addr: usize, fault: PointerFault },
}

/// Why a pointer was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PointerFault {
  #[error("no recognizable page or region header")]
  BadHeader,
  #[error("not the start of a block")]
  Misaligned,
  #[error("block is already free")]
  DoubleRelease,
}

pub type Result<T, E = AllocError> = core::result::Result<T, E>;
