//! Runtime configuration for a [`Heap`](crate::Heap).

/// Per-heap switches.
///
/// Compile-time choices live in cargo features; these are the knobs that can
/// differ between two heaps in the same process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
  /// Emit `tracing` events for page and region traffic.
  pub trace_events: bool,
  /// Scan the class free list on every small release. Without it the scan
  /// only runs for blocks that still carry the free-list tag, which catches
  /// plain double releases but not one whose tag was overwritten after the
  /// first release. Costs O(free blocks of the class).
  pub check_double_release: bool,
}

impl HeapConfig {
  /// Events on; full double-release scans in debug builds or with the
  /// `debug-tripwire` feature.
  pub const fn new() -> Self {
    Self {
      trace_events: true,
      check_double_release: cfg!(any(debug_assertions, feature = "debug-tripwire")),
    }
  }

  /// Like [`HeapConfig::new`] with events off.
  ///
  /// Required for a heap that backs the global allocator: a subscriber that
  /// allocates would re-enter the heap while its lock is held.
  pub const fn quiet() -> Self {
    Self {
      trace_events: false,
      ..Self::new()
    }
  }
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self::new()
  }
}
