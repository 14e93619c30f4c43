use std::io;

use thiserror::Error;

/// Heap operation result
pub type HeapResult<T> = Result<T, HeapError>;

/// Recoverable heap errors.
///
/// Corruption of the heap's own bookkeeping is not reported here; it halts
/// the process.
#[derive(Error, Debug)]
pub enum HeapError {
  #[error("out of memory: cannot allocate {requested_pages} pages ({heap_sys} bytes obtained from the OS)")]
  OutOfMemory {
    requested_pages: usize,
    heap_sys: usize,
  },

  #[error("invalid page count: {0}")]
  InvalidPageCount(usize),

  #[error("invalid heap configuration: {0}")]
  InvalidConfig(&'static str),

  #[error("failed to reserve a {bytes}-byte arena")]
  Reserve {
    bytes: usize,
    #[source]
    source: io::Error,
  },

  #[error("heap inconsistency: {0}")]
  Corrupt(String),
}

impl HeapError {
  pub fn is_out_of_memory(&self) -> bool {
    matches!(self, Self::OutOfMemory { .. })
  }
}
