//! Page heap: hands out runs of whole pages ("spans") to size-class
//! allocators, coalescing freed runs and growing the arena on demand.
//!
//! ```no_run
//! use spanheap::{Heap, HeapConfig, SIZE_CLASS_LARGE};
//!
//! let heap = Heap::new(HeapConfig::default()).unwrap();
//! let span = heap.alloc(8, SIZE_CLASS_LARGE).unwrap();
//! assert_eq!(heap.lookup_exact(span.base()), Some(span.id()));
//! heap.free(span);
//! ```

/// Heap corruption: log it and halt. Release builds abort on panic.
macro_rules! fatal {
  ($($arg:tt)*) => {{
    log::error!($($arg)*);
    panic!($($arg)*)
  }};
}

mod config;
mod error;
mod free_list;
mod heap;
mod os;
mod page_map;
mod span;

pub use config::HeapConfig;
pub use error::{HeapError, HeapResult};
pub use heap::{Heap, HeapSnapshot, HeapStats};
pub use os::{MmapSource, PageSource};
pub use span::{SIZE_CLASS_LARGE, SpanId, SpanInfo, SpanRef, SpanState};

// =============================================================================
// Constants
// =============================================================================

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT; // 4KB

/// Absolute page number: address >> `PAGE_SHIFT`.
pub type PageId = usize;

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(PAGE_SIZE >= core::mem::size_of::<usize>());

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
