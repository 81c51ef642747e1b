//! Per-class free lists.
//!
//! Each size class owns one LIFO stack of free blocks. The links live inside
//! the free blocks themselves: the first word of a free block points at the
//! next one and the second word holds [`FREE_TAG`]. This is the only place raw
//! block memory is reinterpreted.

use core::mem::size_of;
use core::ptr::{NonNull, null_mut};

use crate::page::Page;
use crate::size_class::{self, CLASS_COUNT, SIZE_CLASSES};

/// Marks a block that sits on a free list. A live block may hold this value
/// by chance, so a match is only a hint.
pub(crate) const FREE_TAG: usize = 0xF7EE_B10C_u32 as usize;

#[repr(C)]
struct FreeBlock {
  next: *mut FreeBlock,
  tag: usize,
}

const _: () = assert!(size_of::<FreeBlock>() <= SIZE_CLASSES[0]);

/// # Safety
/// `block` must be a free block on some list.
#[inline(always)]
unsafe fn next_of(block: *mut FreeBlock) -> *mut FreeBlock {
  unsafe { (*block).next }
}

/// # Safety
/// `block` must be a free block owned by the caller.
#[inline(always)]
unsafe fn set_next(block: *mut FreeBlock, next: *mut FreeBlock) {
  unsafe { (*block).next = next };
}

/// Whether the free tag is present at `block`.
///
/// # Safety
/// `block` must point at a block inside a mapped page.
#[inline(always)]
pub(crate) unsafe fn has_free_tag(block: NonNull<u8>) -> bool {
  unsafe { (*block.as_ptr().cast::<FreeBlock>()).tag == FREE_TAG }
}

/// One stack head per size class.
#[derive(Debug)]
pub(crate) struct FreeLists {
  heads: [*mut FreeBlock; CLASS_COUNT],
}

impl FreeLists {
  pub const fn new() -> Self {
    Self {
      heads: [null_mut(); CLASS_COUNT],
    }
  }

  #[cfg(test)]
  pub fn is_empty(&self, class: usize) -> bool {
    self.heads[class].is_null()
  }

  /// Put `block` on top of the class stack.
  ///
  /// # Safety
  /// `block` must be a free block of class `class` that is on no list.
  #[inline]
  pub unsafe fn push(&mut self, class: usize, block: NonNull<u8>) {
    let block = block.as_ptr().cast::<FreeBlock>();
    unsafe {
      set_next(block, self.heads[class]);
      (*block).tag = FREE_TAG;
    }
    self.heads[class] = block;
  }

  /// Take the top block of the class stack.
  #[inline]
  pub fn pop(&mut self, class: usize) -> Option<NonNull<u8>> {
    let head = NonNull::new(self.heads[class])?;
    // SAFETY: everything on a list is a mapped free block.
    unsafe {
      self.heads[class] = next_of(head.as_ptr());
      (*head.as_ptr()).tag = 0;
    }
    Some(head.cast())
  }

  /// Split a freshly mapped page into blocks and push all of them.
  ///
  /// Blocks are pushed from the highest address down, so the lowest one pops
  /// first.
  ///
  /// # Safety
  /// `page` must be a fresh page of class `class` with no block handed out.
  pub unsafe fn init_page(&mut self, class: usize, page: Page) {
    let block_size = size_class::class_size(class);
    let body = page.body();
    for i in (0..size_class::blocks_per_page(class)).rev() {
      // SAFETY: every block lies inside the page body.
      unsafe { self.push(class, body.add(i * block_size)) };
    }
  }

  /// Unlink every block of `page` from the class stack and return how many
  /// were removed.
  ///
  /// Membership is decided by masking each block down to its page base.
  ///
  /// # Safety
  /// The list must be well formed.
  pub unsafe fn remove_page_blocks(&mut self, class: usize, page: Page) -> usize {
    let mut removed = 0;
    let mut link: *mut *mut FreeBlock = &mut self.heads[class];

    unsafe {
      while !(*link).is_null() {
        let block = *link;
        if Page::containing(NonNull::new_unchecked(block.cast())) == page {
          *link = next_of(block);
          removed += 1;
        } else {
          link = &raw mut (*block).next;
        }
      }
    }

    removed
  }

  /// Whether `block` is currently on the class stack.
  pub fn contains(&self, class: usize, block: NonNull<u8>) -> bool {
    let target = block.as_ptr().cast::<FreeBlock>();
    let mut cur = self.heads[class];
    while !cur.is_null() {
      if cur == target {
        return true;
      }
      // SAFETY: everything on a list is a mapped free block.
      cur = unsafe { next_of(cur) };
    }
    false
  }

  /// Number of blocks on the class stack.
  #[cfg(test)]
  pub fn len(&self, class: usize) -> usize {
    let mut n = 0;
    let mut cur = self.heads[class];
    while !cur.is_null() {
      n += 1;
      cur = unsafe { next_of(cur) };
    }
    n
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{HEADER_SIZE, PAGE_SIZE};

  #[repr(C, align(4096))]
  struct FakePage([u8; PAGE_SIZE]);

  fn fake_pages(n: usize) -> Vec<FakePage> {
    (0..n).map(|_| FakePage([0; PAGE_SIZE])).collect()
  }

  fn page_of(p: &mut FakePage) -> Page {
    unsafe { Page::from_base(NonNull::new(p.0.as_mut_ptr()).unwrap()) }
  }

  #[test]
  fn test_push_pop_is_lifo() {
    let mut pages = fake_pages(1);
    let page = page_of(&mut pages[0]);
    let mut lists = FreeLists::new();
    let a = page.body();
    let b = unsafe { a.add(16) };

    assert!(lists.is_empty(0));
    unsafe {
      lists.push(0, a);
      lists.push(0, b);
    }
    assert_eq!(lists.pop(0), Some(b));
    assert_eq!(lists.pop(0), Some(a));
    assert_eq!(lists.pop(0), None);
  }

  #[test]
  fn test_tag_follows_list_membership() {
    let mut pages = fake_pages(1);
    let page = page_of(&mut pages[0]);
    let mut lists = FreeLists::new();
    let a = page.body();

    unsafe {
      assert!(!has_free_tag(a));
      lists.push(1, a);
      assert!(has_free_tag(a));
    }
    assert_eq!(lists.pop(1), Some(a));
    assert!(!unsafe { has_free_tag(a) });
  }

  #[test]
  fn test_init_page_pops_lowest_first() {
    let mut pages = fake_pages(1);
    let page = page_of(&mut pages[0]);
    let mut lists = FreeLists::new();
    unsafe { lists.init_page(4, page) };

    assert_eq!(lists.len(4), 15);
    let mut prev = 0;
    for i in 0..15 {
      let block = lists.pop(4).unwrap().as_ptr() as usize;
      assert_eq!(block, page.base() + HEADER_SIZE + i * 256);
      assert!(block > prev);
      prev = block;
    }
    assert!(lists.is_empty(4));
  }

  #[test]
  fn test_remove_page_blocks_keeps_other_pages() {
    let mut pages = fake_pages(2);
    let first = page_of(&mut pages[0]);
    let second = page_of(&mut pages[1]);
    let mut lists = FreeLists::new();

    unsafe {
      lists.init_page(3, first);
      lists.init_page(3, second);
    }
    // Second page's blocks sit on top. Take two, hand one back.
    let x = lists.pop(3).unwrap();
    let y = lists.pop(3).unwrap();
    assert_eq!(Page::containing(y), second);
    unsafe { lists.push(3, x) };
    assert!(lists.contains(3, first.body()));
    assert!(!lists.contains(3, y));

    let removed = unsafe { lists.remove_page_blocks(3, first) };
    assert_eq!(removed, 31);
    assert_eq!(lists.len(3), 30);
    assert!(!lists.contains(3, first.body()));
    assert!(lists.contains(3, x));

    let removed = unsafe { lists.remove_page_blocks(3, second) };
    assert_eq!(removed, 30);
    assert!(lists.is_empty(3));
  }
}
