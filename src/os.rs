use core::{
  ops::Range,
  ptr::{NonNull, null_mut},
};
use std::io;

use crate::{PAGE_SIZE, align_up};

/// Where the heap gets its pages from.
///
/// # Safety
///
/// `reserve` must return zeroed, `PAGE_SIZE`-aligned memory lying inside
/// `range()`, and must never hand out the same bytes twice.
pub unsafe trait PageSource: Send {
  /// Address range every region returned by `reserve` falls in.
  fn range(&self) -> Range<usize>;

  /// Commit `bytes` more bytes of memory, or `None` if there is no more.
  fn reserve(&mut self, bytes: usize) -> Option<NonNull<u8>>;
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_reserve(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_NONE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_commit(ptr: *mut u8, size: usize) -> bool {
  unsafe { libc::mprotect(ptr.cast(), size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
}

unsafe fn os_release(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

fn os_page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size > 0 { size as usize } else { PAGE_SIZE }
}

// =============================================================================
// Mmap source
// =============================================================================

/// Reserves one address range up front and commits it front to back.
///
/// The range is mapped `PROT_NONE` so it costs nothing until committed.
/// Committed memory is fresh anonymous memory, hence zeroed.
pub struct MmapSource {
  base: NonNull<u8>,
  len: usize,
  used: usize,
  os_page: usize,
}

// The mapping is owned exclusively by this value.
unsafe impl Send for MmapSource {}

impl MmapSource {
  /// Reserve `len` bytes of address space, rounded up to whole pages.
  pub fn new(len: usize) -> io::Result<Self> {
    let os_page = os_page_size().max(PAGE_SIZE);
    let len = align_up(len.max(1), os_page);
    let base = unsafe { os_reserve(len) };
    let Some(base) = NonNull::new(base) else {
      return Err(io::Error::last_os_error());
    };
    Ok(Self {
      base,
      len,
      used: 0,
      os_page,
    })
  }

  /// Bytes committed so far.
  pub fn used(&self) -> usize {
    self.used
  }

  /// Bytes reserved in total.
  pub fn capacity(&self) -> usize {
    self.len
  }
}

unsafe impl PageSource for MmapSource {
  fn range(&self) -> Range<usize> {
    let base = self.base.as_ptr() as usize;
    base..base + self.len
  }

  fn reserve(&mut self, bytes: usize) -> Option<NonNull<u8>> {
    if bytes == 0 || bytes % PAGE_SIZE != 0 || bytes > self.len - self.used {
      return None;
    }

    // The OS page may be larger than ours; widen to whole OS pages. Any
    // overlap with the previous commit is already read/write.
    let base = self.base.as_ptr() as usize;
    let start = base + self.used;
    let commit_start = start & !(self.os_page - 1);
    let commit_end = align_up(start + bytes, self.os_page).min(base + self.len);
    let ok = unsafe { os_commit(commit_start as *mut u8, commit_end - commit_start) };
    if !ok {
      return None;
    }

    self.used += bytes;
    NonNull::new(start as *mut u8)
  }
}

impl Drop for MmapSource {
  fn drop(&mut self) {
    unsafe { os_release(self.base.as_ptr(), self.len) };
  }
}
