//! Shared and process-wide entry points.
//!
//! [`LockedHeap`] puts one [`Heap`] behind a single lock. [`PageAllocator`]
//! and the C API route through one process-wide `LockedHeap`.

use core::{
  alloc::{GlobalAlloc, Layout},
  fmt::{self, Write},
  ptr::{self, NonNull, null_mut},
};

use crate::config::HeapConfig;
use crate::error::{AllocError, Result};
use crate::heap::Heap;
use crate::MIN_ALIGN;

// =============================================================================
// LockedHeap
// =============================================================================

/// A [`Heap`] shared between threads.
///
/// Every operation holds the lock for its whole duration. The lock is a spin
/// lock because it must never allocate: it sits underneath the global
/// allocator.
pub struct LockedHeap {
  inner: spin::Mutex<Heap>,
}

impl LockedHeap {
  pub const fn new(config: HeapConfig) -> Self {
    Self {
      inner: spin::Mutex::new(Heap::with_config(config)),
    }
  }

  pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
    self.inner.lock().allocate(size)
  }

  pub fn allocate_zeroed(&self, size: usize) -> Result<NonNull<u8>> {
    self.inner.lock().allocate_zeroed(size)
  }

  /// # Safety
  /// See [`Heap::release`].
  pub unsafe fn release(&self, ptr: NonNull<u8>) -> Result<()> {
    unsafe { self.inner.lock().release(ptr) }
  }

  /// # Safety
  /// See [`Heap::usable_size`].
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize> {
    unsafe { self.inner.lock().usable_size(ptr) }
  }

  pub fn mapped_pages(&self) -> usize {
    self.inner.lock().mapped_pages()
  }

  pub fn map_calls(&self) -> usize {
    self.inner.lock().map_calls()
  }
}

impl Default for LockedHeap {
  fn default() -> Self {
    Self::new(HeapConfig::new())
  }
}

/// The heap behind [`PageAllocator`], [`bucket_malloc`] and the C API.
static GLOBAL: LockedHeap = LockedHeap::new(HeapConfig::quiet());

/// Writes straight to fd 2, so reporting never allocates.
struct Stderr;

impl fmt::Write for Stderr {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    unsafe { libc::write(libc::STDERR_FILENO, s.as_ptr().cast(), s.len()) };
    Ok(())
  }
}

/// Report a contract violation and abort.
#[cold]
fn fatal(context: &str, err: AllocError) -> ! {
  let _ = writeln!(Stderr, "bucketalloc: {context}: {err}");
  std::process::abort()
}

/// Release `ptr` to the global heap, aborting on a contract violation.
unsafe fn release_or_abort(ptr: NonNull<u8>) {
  if let Err(err) = unsafe { GLOBAL.release(ptr) } {
    fatal("invalid release", err);
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// `#[global_allocator]` adapter over the process-wide heap.
///
/// Releasing a pointer the heap does not recognise aborts the process.
pub struct PageAllocator;

impl PageAllocator {
  /// Serve an alignment above [`MIN_ALIGN`] by over-allocating and storing
  /// the block address in the word just below the aligned pointer.
  unsafe fn alloc_overaligned(layout: Layout, zeroed: bool) -> *mut u8 {
    let Some(total) = layout.size().checked_add(layout.align()) else {
      return null_mut();
    };
    let result = if zeroed {
      GLOBAL.allocate_zeroed(total)
    } else {
      GLOBAL.allocate(total)
    };
    let Ok(raw) = result else {
      return null_mut();
    };

    // `raw` is 16-aligned, so the gap is at least 16 bytes.
    let aligned = align_up(raw.as_ptr() as usize + 1, layout.align());
    unsafe {
      (aligned as *mut usize).sub(1).write(raw.as_ptr() as usize);
    }
    aligned as *mut u8
  }

  unsafe fn overaligned_block(ptr: *mut u8) -> *mut u8 {
    unsafe { (ptr as *const usize).sub(1).read() as *mut u8 }
  }
}

unsafe impl GlobalAlloc for PageAllocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > MIN_ALIGN {
      return unsafe { Self::alloc_overaligned(layout, false) };
    }
    GLOBAL
      .allocate(layout.size().max(1))
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    let block = if layout.align() > MIN_ALIGN && !ptr.is_null() {
      unsafe { Self::overaligned_block(ptr) }
    } else {
      ptr
    };
    if let Some(block) = NonNull::new(block) {
      unsafe { release_or_abort(block) };
    }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() > MIN_ALIGN {
      return unsafe { Self::alloc_overaligned(layout, true) };
    }
    GLOBAL
      .allocate_zeroed(layout.size().max(1))
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    // Still inside the same block: nothing to move.
    if layout.align() <= MIN_ALIGN
      && let Some(old) = NonNull::new(ptr)
      && let Ok(capacity) = unsafe { GLOBAL.usable_size(old) }
      && new_size <= capacity
    {
      return ptr;
    }

    let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
    let new_ptr = unsafe { self.alloc(new_layout) };
    if !new_ptr.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
        self.dealloc(ptr, layout);
      }
    }
    new_ptr
  }
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Allocate `size` bytes from the process-wide heap. Null on failure.
pub unsafe fn bucket_malloc(size: usize) -> *mut u8 {
  GLOBAL.allocate(size.max(1)).map_or(null_mut(), NonNull::as_ptr)
}

/// Release a pointer from [`bucket_malloc`]. Null is ignored.
pub unsafe fn bucket_free(ptr: *mut u8) {
  if let Some(ptr) = NonNull::new(ptr) {
    unsafe { release_or_abort(ptr) };
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================
//
// Only malloc, free, calloc, realloc and malloc_usable_size are exported.
// posix_memalign, aligned_alloc and memalign are not, so under LD_PRELOAD those
// stay with the C library, and passing their results to this free aborts.

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  unsafe { bucket_malloc(size) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { bucket_free(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    return null_mut();
  };
  GLOBAL
    .allocate_zeroed(total.max(1))
    .map_or(null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  let Some(old) = NonNull::new(ptr) else {
    return unsafe { bucket_malloc(size) };
  };

  if size == 0 {
    unsafe { release_or_abort(old) };
    return null_mut();
  }

  let capacity = match unsafe { GLOBAL.usable_size(old) } {
    Ok(capacity) => capacity,
    Err(err) => fatal("invalid realloc", err),
  };
  if size <= capacity {
    return ptr;
  }

  let new_ptr = unsafe { bucket_malloc(size) };
  if !new_ptr.is_null() {
    unsafe {
      ptr::copy_nonoverlapping(ptr, new_ptr, capacity);
      release_or_abort(old);
    }
  }
  new_ptr
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  NonNull::new(ptr)
    .and_then(|ptr| unsafe { GLOBAL.usable_size(ptr) }.ok())
    .unwrap_or(0)
}
