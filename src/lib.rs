//! Segregated size-class allocator backed by OS pages.
//!
//! Small requests (up to [`MAX_SMALL_SIZE`] bytes) are rounded up to one of
//! nine fixed size classes and carved out of dedicated 4 KiB pages. Larger
//! requests get their own multi-page mapping. Every mapping starts with a
//! 16-byte [`PageHeader`], so the owner of any pointer is found by masking off
//! the low page-offset bits.
//!
//! ```
//! use bucketalloc::Heap;
//!
//! let mut heap = Heap::new();
//! let ptr = heap.allocate(100).unwrap();
//! assert!(unsafe { heap.usable_size(ptr) }.unwrap() >= 100);
//! unsafe { heap.release(ptr).unwrap() };
//! assert_eq!(heap.mapped_pages(), 0);
//! ```
//!
//! [`Heap`] is single-threaded. Wrap it in a [`LockedHeap`] for shared use, or
//! install [`PageAllocator`] as the `#[global_allocator]`.

#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]

use core::mem::size_of;

// =============================================================================
// Constants
// =============================================================================

/// Size of every small page, and the granularity of region mappings.
pub const PAGE_SIZE: usize = 4096;
/// Clears the page-offset bits of an address.
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);
/// Bytes reserved at the start of each page or region.
pub const HEADER_SIZE: usize = 16;
/// Largest request served from a size class.
pub const MAX_SMALL_SIZE: usize = PAGE_SIZE - HEADER_SIZE;
/// Alignment guaranteed for every returned pointer.
pub const MIN_ALIGN: usize = 16;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(size_of::<PageHeader>() == HEADER_SIZE);
const _: () = assert!(HEADER_SIZE % MIN_ALIGN == 0);
const _: () = assert!(size_class::SIZE_CLASSES[0] >= size_of::<usize>());
const _: () = assert!(size_class::SIZE_CLASSES[size_class::CLASS_COUNT - 1] == MAX_SMALL_SIZE);

mod arena;
mod config;
mod error;
mod freelist;
mod global;
mod heap;
mod page;
pub mod size_class;

pub use config::HeapConfig;
pub use error::{AllocError, PointerFault, Result};
pub use global::{LockedHeap, PageAllocator, bucket_free, bucket_malloc};
pub use heap::Heap;
pub use page::PageHeader;
pub use size_class::SizeClass;
