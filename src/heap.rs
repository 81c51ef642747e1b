//! The allocator facade: `allocate` and `release` over pages, regions and
//! free lists.

use core::ptr::NonNull;

use crate::arena::PageArena;
use crate::config::HeapConfig;
use crate::error::{AllocError, PointerFault, Result};
use crate::freelist::{self, FreeLists};
use crate::page::{self, Owner, Page, Region};
use crate::size_class::{self, SizeClass};
use crate::{HEADER_SIZE, MAX_SMALL_SIZE, PAGE_SIZE};

/// A single-threaded allocator instance.
///
/// Each heap owns its free lists and its footprint counters, so independent
/// heaps never share blocks. Pages are process-wide mappings, which is why a
/// heap may move between threads; sharing one needs a [`LockedHeap`].
///
/// Dropping a heap with live allocations leaks the pages that hold them.
/// Pages with no live allocations are already unmapped.
///
/// [`LockedHeap`]: crate::LockedHeap
#[derive(Debug)]
pub struct Heap {
  free: FreeLists,
  arena: PageArena,
  config: HeapConfig,
}

// SAFETY: the raw pointers in `FreeLists` point into anonymous mappings that
// any thread may touch. `Heap` has no thread-local state.
unsafe impl Send for Heap {}

impl Default for Heap {
  fn default() -> Self {
    Self::new()
  }
}

impl Heap {
  pub const fn new() -> Self {
    Self::with_config(HeapConfig::new())
  }

  pub const fn with_config(config: HeapConfig) -> Self {
    Self {
      free: FreeLists::new(),
      arena: PageArena::new(),
      config,
    }
  }

  pub fn config(&self) -> HeapConfig {
    self.config
  }

  /// Pages currently mapped by this heap, regions included.
  pub fn mapped_pages(&self) -> usize {
    self.arena.mapped_pages()
  }

  /// Mapping calls this heap has made since it was created.
  pub fn map_calls(&self) -> usize {
    self.arena.map_calls()
  }

  /// Allocate at least `size` bytes, aligned to [`MIN_ALIGN`](crate::MIN_ALIGN).
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
    if size == 0 {
      return Err(AllocError::InvalidSize(size));
    }

    let result = match size_class::classify(size) {
      SizeClass::Small(class) => self.allocate_small(class),
      SizeClass::Oversized => self.allocate_region(size),
    };

    if let Err(AllocError::OutOfMemory { bytes, errno }) = result
      && self.config.trace_events
    {
      tracing::warn!(size, bytes, errno, "mapping denied");
    }
    result
  }

  /// Like [`Heap::allocate`], with the first `size` bytes zeroed.
  pub fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>> {
    let ptr = self.allocate(size)?;
    // Regions are always fresh mappings; only recycled blocks hold old bytes.
    if size <= MAX_SMALL_SIZE {
      unsafe { ptr.as_ptr().write_bytes(0, size) };
    }
    Ok(ptr)
  }

  fn allocate_small(&mut self, class: usize) -> Result<NonNull<u8>> {
    let block = loop {
      if let Some(block) = self.free.pop(class) {
        break block;
      }

      let page = self.arena.map_page(class)?;
      if self.config.trace_events {
        tracing::trace!(
          class_size = size_class::class_size(class),
          addr = page.base(),
          "mapped page"
        );
      }
      // SAFETY: the page is fresh and none of its blocks are out.
      unsafe { self.free.init_page(class, page) };
    };

    let page = Page::containing(block);
    // SAFETY: the block came off a free list, so its page is mapped.
    unsafe {
      let available = page.bytes_available();
      debug_assert!(available >= size_class::class_size(class));
      page.set_bytes_available(available - size_class::class_size(class));
    }
    Ok(block)
  }

  fn allocate_region(&mut self, size: usize) -> Result<NonNull<u8>> {
    let pages = size_class::region_pages(size).ok_or(AllocError::InvalidSize(size))?;
    let region = self.arena.map_region(pages)?;
    if self.config.trace_events {
      tracing::debug!(size, pages, addr = region.base(), "mapped region");
    }
    Ok(region.body())
  }

  /// Return `ptr` to the heap.
  ///
  /// The header that owns `ptr` is validated before anything is touched. A
  /// rejected pointer leaves the heap unchanged.
  ///
  /// # Safety
  /// `ptr` must have come from [`Heap::allocate`] on this heap, or at least lie
  /// in a readable page. Releasing the last live block of a page unmaps it, so
  /// releasing that block again reads unmapped memory and cannot be caught.
  pub unsafe fn release(&mut self, ptr: NonNull<u8>) -> Result<()> {
    let owner = match unsafe { page::resolve(ptr) } {
      Ok(owner) => owner,
      Err(err) => return Err(self.rejected(err)),
    };

    match owner {
      Owner::Region(region) => {
        unsafe { self.release_region(region) };
        Ok(())
      }
      Owner::Page { page, class } => unsafe { self.release_small(ptr, page, class) },
    }
  }

  unsafe fn release_small(&mut self, ptr: NonNull<u8>, page: Page, class: usize) -> Result<()> {
    // The tag narrows the scan to blocks that look free. The full scan also
    // catches a freed block whose tag was overwritten.
    let suspect = self.config.check_double_release || unsafe { freelist::has_free_tag(ptr) };
    if suspect && self.free.contains(class, ptr) {
      return Err(self.rejected(AllocError::InvalidPointer {
        addr: ptr.as_ptr() as usize,
        fault: PointerFault::DoubleRelease,
      }));
    }

    let class_size = size_class::class_size(class);
    let available = unsafe { page.bytes_available() } + class_size;

    if available == size_class::usable_bytes(class) {
      // Last live block: pull the page's free blocks off the list and give
      // the page back.
      let removed = unsafe { self.free.remove_page_blocks(class, page) };
      debug_assert_eq!(removed, size_class::blocks_per_page(class) - 1);
      unsafe { self.arena.unmap_page(page) };
      if self.config.trace_events {
        tracing::trace!(class_size, addr = page.base(), "unmapped page");
      }
    } else {
      unsafe {
        self.free.push(class, ptr);
        page.set_bytes_available(available);
      }
    }
    Ok(())
  }

  unsafe fn release_region(&mut self, region: Region) {
    let pages = unsafe { region.mapped_len() } / PAGE_SIZE;
    unsafe { self.arena.unmap_region(region) };
    if self.config.trace_events {
      tracing::debug!(pages, addr = region.base(), "unmapped region");
    }
  }

  /// Capacity of the block or region body that starts at `ptr`.
  ///
  /// # Safety
  /// Same as [`Heap::release`].
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize> {
    match unsafe { page::resolve(ptr) }? {
      Owner::Page { class, .. } => Ok(size_class::class_size(class)),
      Owner::Region(region) => Ok(unsafe { region.mapped_len() } - HEADER_SIZE),
    }
  }

  fn rejected(&self, err: AllocError) -> AllocError {
    if self.config.trace_events {
      tracing::error!(%err, "release rejected");
    }
    err
  }
}
