//! Page and region lifecycle observed through the footprint counters.

use std::ptr::NonNull;

use bucketalloc::size_class::{self, SizeClass, blocks_per_page, classify};
use bucketalloc::{AllocError, HEADER_SIZE, Heap, MAX_SMALL_SIZE, PAGE_SIZE, PageHeader};

fn header_of(ptr: NonNull<u8>) -> &'static PageHeader {
  let base = ptr.as_ptr() as usize & bucketalloc::PAGE_MASK;
  unsafe { &*(base as *const PageHeader) }
}

#[test]
fn classify_boundaries() {
  assert_eq!(classify(16), SizeClass::Small(0));
  assert_eq!(classify(17), SizeClass::Small(1));
  assert_eq!(size_class::class_size(1), 32);
  assert_eq!(classify(4080), SizeClass::Small(8));
  assert_eq!(classify(4081), SizeClass::Oversized);
}

#[test]
fn every_size_gets_enough_capacity() {
  let mut heap = Heap::new();
  let sizes = [1, 16, 17, 100, 129, 4080, 4081, 5000, 10000];
  let mut live = Vec::new();

  for size in sizes {
    let ptr = heap.allocate(size).unwrap();
    let header = header_of(ptr);
    let capacity = if header.class_size as usize > MAX_SMALL_SIZE {
      header.class_size as usize - HEADER_SIZE
    } else {
      header.class_size as usize
    };
    assert!(capacity >= size, "size {size} got capacity {capacity}");
    assert_eq!(unsafe { heap.usable_size(ptr) }, Ok(capacity));
    live.push(ptr);
  }

  for ptr in live {
    unsafe { heap.release(ptr).unwrap() };
  }
  assert_eq!(heap.mapped_pages(), 0);
}

#[test]
fn lifo_reuse_maps_nothing_new() {
  let mut heap = Heap::new();
  let n = blocks_per_page(0) - 1;

  let first: Vec<_> = (0..n).map(|_| heap.allocate(16).unwrap()).collect();
  let calls = heap.map_calls();
  assert_eq!(calls, 1);

  for &ptr in first.iter().rev() {
    unsafe { heap.release(ptr).unwrap() };
  }
  let second: Vec<_> = (0..n).map(|_| heap.allocate(16).unwrap()).collect();

  assert_eq!(heap.map_calls(), calls);
  assert_eq!(heap.mapped_pages(), 1);
  // Released in reverse, so popped back in the original order.
  assert_eq!(first, second);

  for ptr in second {
    unsafe { heap.release(ptr).unwrap() };
  }
  assert_eq!(heap.mapped_pages(), 0);
}

#[test]
fn full_page_is_reclaimed_on_last_release() {
  let mut heap = Heap::new();
  // Keep a page of another class alive so the count is not trivially zero.
  let anchor = heap.allocate(500).unwrap();
  let before = heap.mapped_pages();

  let n = blocks_per_page(3);
  let blocks: Vec<_> = (0..n).map(|_| heap.allocate(128).unwrap()).collect();
  assert_eq!(heap.mapped_pages(), before + 1);
  assert_eq!(header_of(blocks[0]).bytes_available, 0);

  let (last, rest) = blocks.split_last().unwrap();
  for &ptr in rest {
    unsafe { heap.release(ptr).unwrap() };
  }
  assert_eq!(heap.mapped_pages(), before + 1);

  unsafe { heap.release(*last).unwrap() };
  assert_eq!(heap.mapped_pages(), before);

  // The class list was purged along with the page: the next request maps again.
  let calls = heap.map_calls();
  let again = heap.allocate(128).unwrap();
  assert_eq!(heap.map_calls(), calls + 1);

  unsafe {
    heap.release(again).unwrap();
    heap.release(anchor).unwrap();
  }
  assert_eq!(heap.mapped_pages(), 0);
}

#[test]
fn second_page_opens_when_first_is_full() {
  let mut heap = Heap::new();
  let n = blocks_per_page(5);
  let blocks: Vec<_> = (0..=n).map(|_| heap.allocate(512).unwrap()).collect();
  assert_eq!(heap.mapped_pages(), 2);

  let first_base = blocks[0].as_ptr() as usize & bucketalloc::PAGE_MASK;
  let last_base = blocks[n].as_ptr() as usize & bucketalloc::PAGE_MASK;
  assert_ne!(first_base, last_base);

  // Emptying the first page returns it while the second stays.
  for &ptr in &blocks[..n] {
    unsafe { heap.release(ptr).unwrap() };
  }
  assert_eq!(heap.mapped_pages(), 1);
  unsafe { heap.release(blocks[n]).unwrap() };
  assert_eq!(heap.mapped_pages(), 0);
}

#[test]
fn oversized_request_rounds_page_count_up() {
  let mut heap = Heap::new();
  let ptr = heap.allocate(4081).unwrap();
  assert_eq!(heap.mapped_pages(), 2);
  assert_eq!(header_of(ptr).class_size as usize, 2 * PAGE_SIZE);
  assert_eq!(ptr.as_ptr() as usize % PAGE_SIZE, HEADER_SIZE);

  // The last byte of the request is writable.
  unsafe { ptr.as_ptr().add(4080).write(0x5A) };
  unsafe { heap.release(ptr).unwrap() };
  assert_eq!(heap.mapped_pages(), 0);
}

#[test]
fn oversized_round_trip_restores_footprint() {
  let mut heap = Heap::new();
  let small = heap.allocate(48).unwrap();
  let before = heap.mapped_pages();

  let ptr = heap.allocate(10000).unwrap();
  assert_eq!(heap.mapped_pages(), before + 3);
  unsafe { ptr.as_ptr().write_bytes(0xEE, 10000) };
  unsafe { heap.release(ptr).unwrap() };
  assert_eq!(heap.mapped_pages(), before);

  unsafe { heap.release(small).unwrap() };
}

#[test]
fn regions_are_never_reused() {
  let mut heap = Heap::new();
  let a = heap.allocate(6000).unwrap();
  unsafe { heap.release(a).unwrap() };
  let calls = heap.map_calls();
  let b = heap.allocate(6000).unwrap();
  assert_eq!(heap.map_calls(), calls + 1);
  unsafe { heap.release(b).unwrap() };
}

#[test]
fn zero_size_is_invalid() {
  let mut heap = Heap::new();
  assert_eq!(heap.allocate(0), Err(AllocError::InvalidSize(0)));
  assert_eq!(heap.allocate_zeroed(0), Err(AllocError::InvalidSize(0)));
}
