use core::{
  ptr::null_mut,
  sync::atomic::{AtomicPtr, AtomicU32, Ordering},
};

use crate::{PageId, span::SpanId};

const LEAF_BITS: usize = 10;
/// Pages covered by one leaf (4MB of address space).
const LEAF_LEN: usize = 1 << LEAF_BITS;
const LEAF_MASK: usize = LEAF_LEN - 1;

const NO_SPAN: u32 = 0;

struct Leaf {
  entries: [AtomicU32; LEAF_LEN],
}

impl Leaf {
  fn new() -> Box<Self> {
    Box::new(Self {
      entries: [const { AtomicU32::new(NO_SPAN) }; LEAF_LEN],
    })
  }
}

/// Two-level map from page to owning span, covering one reserved range.
///
/// Leaves are allocated as the arena grows into them and stay until the map
/// is dropped, so readers never race with a leaf being freed. Writes happen
/// under the heap lock; reads may come from any thread.
pub(crate) struct PageMap {
  base: PageId,
  pages: usize,
  leaves: Box<[AtomicPtr<Leaf>]>,
}

impl PageMap {
  /// Map for `pages` pages starting at page `base`. Allocates no leaves.
  pub fn new(base: PageId, pages: usize) -> Self {
    let leaves = (0..pages.div_ceil(LEAF_LEN))
      .map(|_| AtomicPtr::new(null_mut()))
      .collect();
    Self {
      base,
      pages,
      leaves,
    }
  }

  #[inline]
  pub fn base(&self) -> PageId {
    self.base
  }

  /// One past the last page the map can cover.
  #[inline]
  pub fn end(&self) -> PageId {
    self.base + self.pages
  }

  #[inline]
  pub fn covers(&self, start: PageId, npages: usize) -> bool {
    start >= self.base
      && start
        .checked_add(npages)
        .is_some_and(|end| end <= self.end())
  }

  /// Allocate the leaves backing `[start, start + npages)`.
  pub fn grow(&self, start: PageId, npages: usize) {
    if npages == 0 {
      return;
    }
    if !self.covers(start, npages) {
      fatal!(
        "page map [{:#x}, {:#x}) cannot cover pages [{start:#x}, {:#x})",
        self.base,
        self.end(),
        start + npages
      );
    }
    let first = (start - self.base) >> LEAF_BITS;
    let last = (start + npages - 1 - self.base) >> LEAF_BITS;
    for slot in &self.leaves[first..=last] {
      if slot.load(Ordering::Relaxed).is_null() {
        slot.store(Box::into_raw(Leaf::new()), Ordering::Release);
      }
    }
  }

  #[inline]
  fn leaf(&self, page: PageId) -> Option<(&Leaf, usize)> {
    let idx = page.checked_sub(self.base)?;
    if idx >= self.pages {
      return None;
    }
    let leaf = self.leaves[idx >> LEAF_BITS].load(Ordering::Acquire);
    // Leaves live as long as the map.
    unsafe { leaf.as_ref() }.map(|leaf| (leaf, idx & LEAF_MASK))
  }

  /// Span recorded for `page`, if any. Lock-free.
  #[inline]
  pub fn get(&self, page: PageId) -> Option<SpanId> {
    let (leaf, slot) = self.leaf(page)?;
    SpanId::from_raw(leaf.entries[slot].load(Ordering::Acquire))
  }

  #[inline]
  pub fn set(&self, page: PageId, span: SpanId) {
    let Some((leaf, slot)) = self.leaf(page) else {
      fatal!("page map set outside the grown arena: page {page:#x} -> {span:?}");
    };
    leaf.entries[slot].store(span.to_raw(), Ordering::Release);
  }
}

impl Drop for PageMap {
  fn drop(&mut self) {
    for slot in self.leaves.iter() {
      let leaf = slot.load(Ordering::Acquire);
      if !leaf.is_null() {
        drop(unsafe { Box::from_raw(leaf) });
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::span::SpanPool;

  #[test]
  fn empty_map_knows_nothing() {
    let map = PageMap::new(0x1000, 4 * LEAF_LEN);
    assert_eq!(map.get(0x1000), None);
    assert_eq!(map.get(0x0fff), None);
    assert_eq!(map.get(map.end()), None);
  }

  #[test]
  fn set_then_get_across_leaves() {
    let mut pool = SpanPool::new();
    let a = pool.alloc(0, 1);
    let b = pool.alloc(0, 1);

    let base = 0x40000;
    let map = PageMap::new(base, 4 * LEAF_LEN);
    map.grow(base + LEAF_LEN - 2, 4);

    map.set(base + LEAF_LEN - 1, a);
    map.set(base + LEAF_LEN, b);
    assert_eq!(map.get(base + LEAF_LEN - 1), Some(a));
    assert_eq!(map.get(base + LEAF_LEN), Some(b));
    assert_eq!(map.get(base + LEAF_LEN + 1), None);

    // Leaf 3 was never grown.
    assert_eq!(map.get(base + 3 * LEAF_LEN), None);
  }

  #[test]
  fn covers_checks_both_ends() {
    let map = PageMap::new(100, 50);
    assert!(map.covers(100, 50));
    assert!(!map.covers(99, 1));
    assert!(!map.covers(140, 11));
    assert!(!map.covers(usize::MAX, 2));
  }

  #[test]
  #[should_panic(expected = "outside the grown arena")]
  fn set_outside_grown_range_is_fatal() {
    let mut pool = SpanPool::new();
    let a = pool.alloc(0, 1);
    let map = PageMap::new(0, 2 * LEAF_LEN);
    map.set(LEAF_LEN + 1, a);
  }
}
