use crate::{HeapError, HeapResult, PAGE_SHIFT, PAGE_SIZE};

/// Address space reserved by the default heap.
#[cfg(target_pointer_width = "64")]
const DEFAULT_ARENA_BYTES: usize = 1 << 36; // 64GB
#[cfg(not(target_pointer_width = "64"))]
const DEFAULT_ARENA_BYTES: usize = 1 << 30; // 1GB

/// Smallest chunk requested from the OS on growth.
const DEFAULT_MIN_GROW_BYTES: usize = 1 << 20; // 1MB

/// Spans of fewer pages than this get their own exact-size free list.
const DEFAULT_FREE_LIST_LEN: usize = DEFAULT_MIN_GROW_BYTES >> PAGE_SHIFT;

/// Growth requests are rounded up to a multiple of this many pages (64KB).
const DEFAULT_GROW_GRANULARITY: usize = 16;

/// Tunables for a [`Heap`](crate::Heap).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
  /// Address space reserved up front by the mmap source.
  pub arena_bytes: usize,
  /// Number of exact-size free lists; larger spans go on the large list.
  pub free_list_len: usize,
  /// Growth rounding, in pages. Power of two.
  pub grow_granularity: usize,
  /// Minimum bytes requested per growth. Whole pages.
  pub min_grow_bytes: usize,
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      arena_bytes: DEFAULT_ARENA_BYTES,
      free_list_len: DEFAULT_FREE_LIST_LEN,
      grow_granularity: DEFAULT_GROW_GRANULARITY,
      min_grow_bytes: DEFAULT_MIN_GROW_BYTES,
    }
  }
}

impl HeapConfig {
  pub fn with_arena_bytes(mut self, bytes: usize) -> Self {
    self.arena_bytes = bytes;
    self
  }

  pub fn with_free_list_len(mut self, len: usize) -> Self {
    self.free_list_len = len;
    self
  }

  pub fn with_grow_granularity(mut self, pages: usize) -> Self {
    self.grow_granularity = pages;
    self
  }

  pub fn with_min_grow_bytes(mut self, bytes: usize) -> Self {
    self.min_grow_bytes = bytes;
    self
  }

  pub fn min_grow_pages(&self) -> usize {
    self.min_grow_bytes >> PAGE_SHIFT
  }

  pub fn validate(&self) -> HeapResult<()> {
    if self.arena_bytes < PAGE_SIZE {
      return Err(HeapError::InvalidConfig("arena must hold at least one page"));
    }
    if self.free_list_len < 2 {
      return Err(HeapError::InvalidConfig("need at least two free lists"));
    }
    if !self.grow_granularity.is_power_of_two() {
      return Err(HeapError::InvalidConfig("grow granularity must be a power of two"));
    }
    if self.min_grow_bytes == 0 || self.min_grow_bytes % PAGE_SIZE != 0 {
      return Err(HeapError::InvalidConfig("minimum growth must be whole pages"));
    }
    Ok(())
  }
}
