use core::{
  num::NonZeroU32,
  ops::{Index, IndexMut},
};

use crate::{PAGE_SHIFT, PageId};

/// Size class tag for raw spans that no fixed size class backs.
pub const SIZE_CLASS_LARGE: u32 = 0;

// =============================================================================
// Identity
// =============================================================================

/// Index of a span record in the heap's record pool.
///
/// Ids of merged spans are recycled, so an id alone says nothing about which
/// pages it covers; hold on to a [`SpanRef`] for that.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SpanId(NonZeroU32);

impl SpanId {
  #[inline]
  fn from_index(index: usize) -> Self {
    let raw = u32::try_from(index + 1).ok().and_then(NonZeroU32::new);
    match raw {
      Some(raw) => Self(raw),
      None => fatal!("span record pool exhausted at index {index}"),
    }
  }

  #[inline]
  pub(crate) fn index(self) -> usize {
    self.0.get() as usize - 1
  }

  /// Raw encoding used by the page map; 0 is reserved for "no span".
  #[inline]
  pub(crate) fn to_raw(self) -> u32 {
    self.0.get()
  }

  #[inline]
  pub(crate) fn from_raw(raw: u32) -> Option<Self> {
    NonZeroU32::new(raw).map(Self)
  }
}

// =============================================================================
// Span record
// =============================================================================

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpanState {
  /// On a free list, owned by the heap.
  Free = 0,
  /// Handed out to a caller.
  InUse = 1,
  /// Merged into a neighbour; the record is waiting to be reused.
  Dead = 2,
  /// Sentinel of a free list. Never covers pages.
  ListHead = 3,
}

/// Metadata for a contiguous run of pages.
#[derive(Clone, Debug)]
pub(crate) struct Span {
  pub start: PageId,
  pub npages: usize,
  pub state: SpanState,
  pub size_class: u32,
  pub needs_zeroing: bool,
  pub ref_count: u32,
  pub prev: Option<SpanId>,
  pub next: Option<SpanId>,
}

impl Span {
  fn new(start: PageId, npages: usize) -> Self {
    Self {
      start,
      npages,
      state: SpanState::Dead,
      size_class: SIZE_CLASS_LARGE,
      needs_zeroing: false,
      ref_count: 0,
      prev: None,
      next: None,
    }
  }

  /// One past the last page.
  #[inline]
  pub fn end(&self) -> PageId {
    self.start + self.npages
  }

  #[inline]
  pub fn contains(&self, page: PageId) -> bool {
    page >= self.start && page - self.start < self.npages
  }

  #[inline]
  pub fn is_linked(&self) -> bool {
    self.prev.is_some() || self.next.is_some()
  }
}

// =============================================================================
// Record pool
// =============================================================================

/// Fixed-size allocator for span records.
///
/// Records are never returned to the system allocator; dead ones go on a
/// recycle stack and are handed out again first.
pub(crate) struct SpanPool {
  records: Vec<Span>,
  recycled: Vec<SpanId>,
  inuse: usize,
}

impl SpanPool {
  pub fn new() -> Self {
    Self {
      records: Vec::new(),
      recycled: Vec::new(),
      inuse: 0,
    }
  }

  /// Get a fresh record covering `[start, start + npages)`, with no state.
  pub fn alloc(&mut self, start: PageId, npages: usize) -> SpanId {
    self.inuse += 1;
    self.alloc_record(Span::new(start, npages))
  }

  /// Get a list sentinel. Sentinels are not counted as records in use.
  pub fn alloc_list_head(&mut self) -> SpanId {
    let id = self.alloc_record(Span::new(0, 0));
    let head = &mut self[id];
    head.state = SpanState::ListHead;
    head.prev = Some(id);
    head.next = Some(id);
    id
  }

  fn alloc_record(&mut self, span: Span) -> SpanId {
    if let Some(id) = self.recycled.pop() {
      self.records[id.index()] = span;
      return id;
    }
    let id = SpanId::from_index(self.records.len());
    self.records.push(span);
    id
  }

  /// Return a dead record to the pool.
  pub fn free(&mut self, id: SpanId) {
    let span = &self[id];
    if span.state != SpanState::Dead || span.is_linked() {
      fatal!("span record {id:?} recycled while {:?}", span.state);
    }
    self.inuse -= 1;
    self.recycled.push(id);
  }

  /// Records handed out by `alloc` and not yet freed.
  pub fn inuse(&self) -> usize {
    self.inuse
  }

  /// All records, including sentinels and recycled ones.
  pub fn iter(&self) -> impl Iterator<Item = (SpanId, &Span)> {
    self
      .records
      .iter()
      .enumerate()
      .map(|(i, span)| (SpanId::from_index(i), span))
  }
}

impl Index<SpanId> for SpanPool {
  type Output = Span;

  #[inline]
  fn index(&self, id: SpanId) -> &Span {
    match self.records.get(id.index()) {
      Some(span) => span,
      None => fatal!("{id:?} is not a span record of this heap"),
    }
  }
}

impl IndexMut<SpanId> for SpanPool {
  #[inline]
  fn index_mut(&mut self, id: SpanId) -> &mut Span {
    match self.records.get_mut(id.index()) {
      Some(span) => span,
      None => fatal!("{id:?} is not a span record of this heap"),
    }
  }
}

// =============================================================================
// Caller-facing views
// =============================================================================

/// A span handed out by [`Heap::alloc`](crate::Heap::alloc).
///
/// The range and size class stay valid until the span is freed; the heap
/// never moves or resizes an in-use span.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SpanRef {
  id: SpanId,
  start: PageId,
  npages: usize,
  size_class: u32,
}

impl SpanRef {
  pub(crate) fn new(id: SpanId, span: &Span) -> Self {
    Self {
      id,
      start: span.start,
      npages: span.npages,
      size_class: span.size_class,
    }
  }

  #[inline]
  pub fn id(&self) -> SpanId {
    self.id
  }

  /// First page.
  #[inline]
  pub fn start(&self) -> PageId {
    self.start
  }

  #[inline]
  pub fn npages(&self) -> usize {
    self.npages
  }

  /// One past the last page.
  #[inline]
  pub fn end(&self) -> PageId {
    self.start + self.npages
  }

  #[inline]
  pub fn size_class(&self) -> u32 {
    self.size_class
  }

  /// Address of the first byte.
  #[inline]
  pub fn base(&self) -> *mut u8 {
    (self.start << PAGE_SHIFT) as *mut u8
  }

  /// Length in bytes.
  #[inline]
  pub fn bytes(&self) -> usize {
    self.npages << PAGE_SHIFT
  }

  #[inline]
  pub fn contains(&self, addr: *const u8) -> bool {
    let page = addr as usize >> PAGE_SHIFT;
    page >= self.start && page < self.end()
  }
}

/// Point-in-time copy of a span record.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SpanInfo {
  pub id: SpanId,
  pub start: PageId,
  pub npages: usize,
  pub state: SpanState,
  pub size_class: u32,
  pub needs_zeroing: bool,
  pub ref_count: u32,
}

impl SpanInfo {
  pub(crate) fn new(id: SpanId, span: &Span) -> Self {
    Self {
      id,
      start: span.start,
      npages: span.npages,
      state: span.state,
      size_class: span.size_class,
      needs_zeroing: span.needs_zeroing,
      ref_count: span.ref_count,
    }
  }

  #[inline]
  pub fn end(&self) -> PageId {
    self.start + self.npages
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pool_recycles_dead_records() {
    let mut pool = SpanPool::new();
    let a = pool.alloc(10, 4);
    let b = pool.alloc(14, 2);
    assert_ne!(a, b);
    assert_eq!(pool.inuse(), 2);

    pool[a].state = SpanState::Dead;
    pool.free(a);
    assert_eq!(pool.inuse(), 1);

    let c = pool.alloc(30, 1);
    assert_eq!(c, a);
    assert_eq!(pool[c].start, 30);
    assert_eq!(pool[c].npages, 1);
    assert_eq!(pool[c].ref_count, 0);
  }

  #[test]
  fn list_heads_are_not_counted() {
    let mut pool = SpanPool::new();
    let head = pool.alloc_list_head();
    assert_eq!(pool.inuse(), 0);
    assert_eq!(pool[head].state, SpanState::ListHead);
    assert_eq!(pool[head].next, Some(head));
  }

  #[test]
  #[should_panic(expected = "recycled while")]
  fn recycling_a_live_record_is_fatal() {
    let mut pool = SpanPool::new();
    let a = pool.alloc(0, 1);
    pool[a].state = SpanState::InUse;
    pool.free(a);
  }

  #[test]
  #[should_panic(expected = "is not a span record")]
  fn unknown_id_is_fatal() {
    let mut pool = SpanPool::new();
    pool.alloc(0, 1);
    let foreign = SpanId::from_index(5);
    let _ = pool[foreign].start;
  }

  #[test]
  fn span_ref_addresses() {
    let mut pool = SpanPool::new();
    let id = pool.alloc(0x100, 3);
    let span = SpanRef::new(id, &pool[id]);
    assert_eq!(span.base() as usize, 0x100 << PAGE_SHIFT);
    assert_eq!(span.bytes(), 3 << PAGE_SHIFT);
    assert!(span.contains((0x102 << PAGE_SHIFT | 7) as *const u8));
    assert!(!span.contains((0x103 << PAGE_SHIFT) as *const u8));
  }
}
