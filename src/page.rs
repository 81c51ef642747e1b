//! Page and region headers, and pointer-to-owner resolution.

use core::ptr::NonNull;

use crate::error::{AllocError, PointerFault, Result};
use crate::size_class::{self, region_body};
use crate::{HEADER_SIZE, MAX_SMALL_SIZE, PAGE_MASK, PAGE_SIZE};

/// Metadata at offset 0 of every mapping.
///
/// For a small page `class_size` is the block capacity and `bytes_available`
/// counts free bytes across its blocks. For a region `class_size` holds the
/// total mapped length (always above [`MAX_SMALL_SIZE`]) and `bytes_available`
/// holds the body length.
#[repr(C)]
#[derive(Debug)]
pub struct PageHeader {
  pub class_size: u64,
  pub bytes_available: u64,
}

/// A small page, identified by its header.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Page(NonNull<PageHeader>);

/// An oversized region, identified by its header.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Region(NonNull<PageHeader>);

/// What a header says about the pointer it was resolved from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Owner {
  Page { page: Page, class: usize },
  Region(Region),
}

/// Base address of the mapping containing `addr`.
#[inline(always)]
pub const fn page_base(addr: usize) -> usize {
  addr & PAGE_MASK
}

impl Page {
  /// # Safety
  /// `base` must be the start of a live page mapping.
  #[inline]
  pub(crate) unsafe fn from_base(base: NonNull<u8>) -> Self {
    debug_assert_eq!(base.as_ptr() as usize % PAGE_SIZE, 0);
    Self(base.cast())
  }

  /// The page that owns `block`. Pure arithmetic; nothing is read.
  #[inline]
  pub(crate) fn containing(block: NonNull<u8>) -> Self {
    let base = page_base(block.as_ptr() as usize);
    // SAFETY: blocks sit past the header of a mapping, and the OS never maps
    // address zero, so the base is non-null.
    Self(unsafe { NonNull::new_unchecked(base as *mut PageHeader) })
  }

  #[inline]
  pub fn base(self) -> usize {
    self.0.as_ptr() as usize
  }

  #[inline]
  pub(crate) fn header(self) -> *mut PageHeader {
    self.0.as_ptr()
  }

  /// First block of the page body.
  #[inline]
  pub(crate) fn body(self) -> NonNull<u8> {
    // SAFETY: the body starts inside the same 4 KiB mapping.
    unsafe { self.0.cast::<u8>().add(HEADER_SIZE) }
  }

  /// # Safety
  /// The page must be mapped.
  #[inline]
  pub(crate) unsafe fn bytes_available(self) -> usize {
    unsafe { (*self.header()).bytes_available as usize }
  }

  /// # Safety
  /// The page must be mapped.
  #[inline]
  pub(crate) unsafe fn set_bytes_available(self, bytes: usize) {
    unsafe { (*self.header()).bytes_available = bytes as u64 };
  }
}

impl Region {
  /// # Safety
  /// `base` must be the start of a live region mapping.
  #[inline]
  pub(crate) unsafe fn from_base(base: NonNull<u8>) -> Self {
    debug_assert_eq!(base.as_ptr() as usize % PAGE_SIZE, 0);
    Self(base.cast())
  }

  #[inline]
  pub fn base(self) -> usize {
    self.0.as_ptr() as usize
  }

  #[inline]
  pub(crate) fn header(self) -> *mut PageHeader {
    self.0.as_ptr()
  }

  /// The single block handed to the caller.
  #[inline]
  pub(crate) fn body(self) -> NonNull<u8> {
    // SAFETY: every region is at least two pages long.
    unsafe { self.0.cast::<u8>().add(HEADER_SIZE) }
  }

  /// Total mapped length in bytes.
  ///
  /// # Safety
  /// The region must be mapped.
  #[inline]
  pub(crate) unsafe fn mapped_len(self) -> usize {
    unsafe { (*self.header()).class_size as usize }
  }
}

/// Resolve the page or region owning `ptr` and check that its header is
/// consistent with `ptr` being a live allocation.
///
/// Nothing is mutated. Any mismatch is reported as
/// [`AllocError::InvalidPointer`].
///
/// # Safety
/// The page containing `ptr` must be readable. This holds for every pointer
/// returned by a heap and not yet released. A pointer whose page has already
/// been unmapped cannot be checked.
pub(crate) unsafe fn resolve(ptr: NonNull<u8>) -> Result<Owner> {
  let addr = ptr.as_ptr() as usize;
  let base = page_base(addr);
  let invalid = |fault| AllocError::InvalidPointer { addr, fault };

  if addr - base < HEADER_SIZE {
    return Err(invalid(PointerFault::Misaligned));
  }

  let header = base as *const PageHeader;
  let (class_size, available) = unsafe {
    (
      (*header).class_size as usize,
      (*header).bytes_available as usize,
    )
  };

  if class_size > MAX_SMALL_SIZE {
    let plausible = class_size % PAGE_SIZE == 0
      && class_size >= 2 * PAGE_SIZE
      && available == region_body(class_size / PAGE_SIZE);
    if !plausible {
      return Err(invalid(PointerFault::BadHeader));
    }
    if addr != base + HEADER_SIZE {
      return Err(invalid(PointerFault::Misaligned));
    }
    // SAFETY: header checked above; `base` is non-null since `addr > base`.
    let region = unsafe { Region::from_base(NonNull::new_unchecked(base as *mut u8)) };
    return Ok(Owner::Region(region));
  }

  let Some(class) = size_class::index_of(class_size) else {
    return Err(invalid(PointerFault::BadHeader));
  };

  // A page with a live block is never completely free.
  let usable = size_class::usable_bytes(class);
  if available % class_size != 0 || available >= usable {
    return Err(invalid(PointerFault::BadHeader));
  }

  let offset = addr - base - HEADER_SIZE;
  if offset >= usable || offset % class_size != 0 {
    return Err(invalid(PointerFault::Misaligned));
  }

  // SAFETY: as above.
  let page = unsafe { Page::from_base(NonNull::new_unchecked(base as *mut u8)) };
  Ok(Owner::Page { page, class })
}
