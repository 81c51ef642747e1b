//! OS mappings for pages and regions.
//!
//! This is the only module that talks to the kernel. Every mapping is
//! anonymous, private and zero-filled, and starts on a page boundary, which is
//! what makes address masking in [`crate::page`] sound.

use core::ptr::{NonNull, null_mut};

use crate::error::{AllocError, Result};
use crate::page::{Page, PageHeader, Region};
use crate::size_class::{self, region_body};
use crate::PAGE_SIZE;

// =============================================================================
// Platform
// =============================================================================

/// Map `size` bytes of fresh memory. Returns `Err(errno)` on failure.
unsafe fn os_mmap(size: usize) -> core::result::Result<NonNull<u8>, i32> {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    Err(last_errno())
  } else {
    NonNull::new(ptr as *mut u8).ok_or(libc::ENOMEM)
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  let rc = unsafe { libc::munmap(ptr.cast(), size) };
  debug_assert_eq!(rc, 0, "munmap({ptr:p}, {size}) failed");
}

fn last_errno() -> i32 {
  std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

// =============================================================================
// Arena
// =============================================================================

/// Source of pages and regions, plus the footprint counters that make reuse
/// and reclamation observable.
#[derive(Debug, Default)]
pub struct PageArena {
  /// Pages currently mapped, counting every page of every region.
  mapped_pages: usize,
  /// Mapping calls made over the arena's lifetime.
  map_calls: usize,
}

impl PageArena {
  pub const fn new() -> Self {
    Self {
      mapped_pages: 0,
      map_calls: 0,
    }
  }

  pub fn mapped_pages(&self) -> usize {
    self.mapped_pages
  }

  pub fn map_calls(&self) -> usize {
    self.map_calls
  }

  /// Map one page for size class `class` and write its header.
  ///
  /// The header starts with every block free.
  pub(crate) fn map_page(&mut self, class: usize) -> Result<Page> {
    let base = self.map(PAGE_SIZE, 1)?;
    // SAFETY: `base` is a fresh, writable, page-aligned mapping.
    unsafe {
      base.cast::<PageHeader>().write(PageHeader {
        class_size: size_class::class_size(class) as u64,
        bytes_available: size_class::usable_bytes(class) as u64,
      });
      Ok(Page::from_base(base))
    }
  }

  /// Map `pages` contiguous pages for one oversized allocation.
  ///
  /// `pages` comes from [`size_class::region_pages`], so the length cannot
  /// overflow.
  pub(crate) fn map_region(&mut self, pages: usize) -> Result<Region> {
    debug_assert!(pages >= 2);
    let len = pages * PAGE_SIZE;
    let base = self.map(len, pages)?;
    // SAFETY: as in `map_page`.
    unsafe {
      base.cast::<PageHeader>().write(PageHeader {
        class_size: len as u64,
        bytes_available: region_body(pages) as u64,
      });
      Ok(Region::from_base(base))
    }
  }

  /// # Safety
  /// `page` must be mapped by this arena, and nothing may touch it afterwards.
  pub(crate) unsafe fn unmap_page(&mut self, page: Page) {
    unsafe { os_munmap(page.header().cast(), PAGE_SIZE) };
    self.mapped_pages -= 1;
  }

  /// Unmap the whole region in one call, using the length in its header.
  ///
  /// # Safety
  /// `region` must be mapped by this arena, and nothing may touch it afterwards.
  pub(crate) unsafe fn unmap_region(&mut self, region: Region) {
    let len = unsafe { region.mapped_len() };
    unsafe { os_munmap(region.header().cast(), len) };
    self.mapped_pages -= len / PAGE_SIZE;
  }

  fn map(&mut self, len: usize, pages: usize) -> Result<NonNull<u8>> {
    self.map_calls += 1;
    let base =
      unsafe { os_mmap(len) }.map_err(|errno| AllocError::OutOfMemory { bytes: len, errno })?;
    debug_assert_eq!(base.as_ptr() as usize % PAGE_SIZE, 0);
    self.mapped_pages += pages;
    Ok(base)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_map_page_writes_header() {
    let mut arena = PageArena::new();
    let page = arena.map_page(3).unwrap();
    assert_eq!(page.base() % PAGE_SIZE, 0);
    unsafe {
      assert_eq!((*page.header()).class_size, 128);
      assert_eq!((*page.header()).bytes_available, 31 * 128);
    }
    assert_eq!(arena.mapped_pages(), 1);
    assert_eq!(arena.map_calls(), 1);

    unsafe { arena.unmap_page(page) };
    assert_eq!(arena.mapped_pages(), 0);
    assert_eq!(arena.map_calls(), 1);
  }

  #[test]
  fn test_fresh_page_body_is_zeroed() {
    let mut arena = PageArena::new();
    let page = arena.map_page(8).unwrap();
    let body = unsafe { core::slice::from_raw_parts(page.body().as_ptr(), 4080) };
    assert!(body.iter().all(|&b| b == 0));
    unsafe { arena.unmap_page(page) };
  }

  #[test]
  fn test_region_header_and_footprint() {
    let mut arena = PageArena::new();
    let region = arena.map_region(3).unwrap();
    unsafe {
      assert_eq!(region.mapped_len(), 3 * PAGE_SIZE);
      assert_eq!((*region.header()).bytes_available as usize, 3 * PAGE_SIZE - 16);
    }
    assert_eq!(region.body().as_ptr() as usize, region.base() + 16);
    assert_eq!(arena.mapped_pages(), 3);

    // The whole body is writable.
    unsafe { region.body().as_ptr().write_bytes(0xAB, 3 * PAGE_SIZE - 16) };

    unsafe { arena.unmap_region(region) };
    assert_eq!(arena.mapped_pages(), 0);
  }
}
