//! Size classes.
//!
//! Requests up to [`MAX_SMALL_SIZE`] bytes are rounded up to the smallest
//! class that fits. Anything larger takes the oversized path and gets its own
//! region.

use crate::{HEADER_SIZE, MAX_SMALL_SIZE, PAGE_SIZE};

/// Block capacities, in bytes, smallest first.
pub const SIZE_CLASSES: [usize; CLASS_COUNT] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4080];
/// Number of small size classes.
pub const CLASS_COUNT: usize = 9;

/// Result of classifying a request size.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SizeClass {
  /// Index into [`SIZE_CLASSES`].
  Small(usize),
  /// Larger than [`MAX_SMALL_SIZE`]; served by a dedicated region.
  Oversized,
}

/// Classify `size` using the minimal-fit rule.
///
/// Zero classifies as the smallest class; callers reject it before getting here.
pub fn classify(size: usize) -> SizeClass {
  if size > MAX_SMALL_SIZE {
    return SizeClass::Oversized;
  }

  for (idx, &capacity) in SIZE_CLASSES.iter().enumerate() {
    if capacity >= size {
      return SizeClass::Small(idx);
    }
  }

  SizeClass::Oversized
}

/// Block capacity of class `idx`.
#[inline]
pub const fn class_size(idx: usize) -> usize {
  SIZE_CLASSES[idx]
}

/// Number of blocks that fit in one page body for class `idx`.
#[inline]
pub const fn blocks_per_page(idx: usize) -> usize {
  MAX_SMALL_SIZE / SIZE_CLASSES[idx]
}

/// Bytes of a page body actually covered by blocks of class `idx`.
///
/// A page whose `bytes_available` equals this value holds no live allocations.
#[inline]
pub const fn usable_bytes(idx: usize) -> usize {
  blocks_per_page(idx) * SIZE_CLASSES[idx]
}

/// Reverse lookup from a block capacity to its class index.
pub fn index_of(capacity: usize) -> Option<usize> {
  SIZE_CLASSES.iter().position(|&c| c == capacity)
}

/// Pages needed to serve an oversized request: `ceil((size - 4080) / 4096) + 1`.
///
/// Returns `None` if `size` is not oversized or the mapping length would
/// overflow `usize`.
pub fn region_pages(size: usize) -> Option<usize> {
  if size <= MAX_SMALL_SIZE {
    return None;
  }
  let pages = (size - MAX_SMALL_SIZE).div_ceil(PAGE_SIZE) + 1;
  pages.checked_mul(PAGE_SIZE)?;
  Some(pages)
}

/// Usable body of a region spanning `pages` pages.
#[inline]
pub const fn region_body(pages: usize) -> usize {
  pages * PAGE_SIZE - HEADER_SIZE
}
