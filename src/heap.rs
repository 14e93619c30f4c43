use core::ptr;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::{
  HeapConfig, HeapError, HeapResult, PAGE_SHIFT, PAGE_SIZE, PageId,
  free_list::{FreeLists, list_iter, list_remove},
  os::{MmapSource, PageSource},
  page_map::PageMap,
  span::{Span, SpanId, SpanInfo, SpanPool, SpanRef, SpanState},
};

// =============================================================================
// Public views
// =============================================================================

/// Heap-wide counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Bytes obtained from the page source.
  pub sys_bytes: usize,
  /// Bytes in spans handed out to callers.
  pub inuse_bytes: usize,
  /// Bytes sitting on free lists.
  pub free_bytes: usize,
  /// Span records in use (free and in-use spans).
  pub span_records: usize,
  /// Successful arena growths.
  pub grow_count: usize,
}

/// Copy of the heap's span layout, for inspection and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapSnapshot {
  /// Free and in-use spans, by start page.
  pub spans: Vec<SpanInfo>,
  /// Contents of each exact-size free list, front to back.
  pub exact: Vec<Vec<SpanId>>,
  /// Contents of the large free list, front to back.
  pub large: Vec<SpanId>,
}

impl HeapSnapshot {
  pub fn free_spans(&self) -> impl Iterator<Item = &SpanInfo> {
    self.spans.iter().filter(|s| s.state == SpanState::Free)
  }

  pub fn in_use_spans(&self) -> impl Iterator<Item = &SpanInfo> {
    self.spans.iter().filter(|s| s.state == SpanState::InUse)
  }

  pub fn get(&self, id: SpanId) -> Option<&SpanInfo> {
    self.spans.iter().find(|s| s.id == id)
  }
}

// =============================================================================
// Heap
// =============================================================================

/// Page-granularity heap.
///
/// Hands out runs of whole pages ("spans") carved from memory obtained from a
/// [`PageSource`]. `alloc`, `free` and `lookup_interior` serialize on one
/// lock; `lookup_exact` reads the page map without it.
pub struct Heap<S: PageSource = MmapSource> {
  inner: Mutex<HeapInner<S>>,
  map: PageMap,
}

struct HeapInner<S> {
  pool: SpanPool,
  free: FreeLists,
  source: S,
  config: HeapConfig,
  /// One past the highest committed address.
  arena_used: usize,
  sys_bytes: usize,
  inuse_pages: usize,
  grow_count: usize,
}

impl Heap<MmapSource> {
  /// Heap backed by a fresh mmap reservation of `config.arena_bytes`.
  pub fn new(config: HeapConfig) -> HeapResult<Self> {
    config.validate()?;
    let source = MmapSource::new(config.arena_bytes).map_err(|source| HeapError::Reserve {
      bytes: config.arena_bytes,
      source,
    })?;
    Self::with_source(config, source)
  }

  /// The process-wide heap, created on first use with the default config.
  pub fn global() -> &'static Self {
    static HEAP: OnceLock<Heap> = OnceLock::new();
    HEAP.get_or_init(|| match Heap::new(HeapConfig::default()) {
      Ok(heap) => heap,
      Err(err) => fatal!("page heap initialization failed: {err}"),
    })
  }
}

impl<S: PageSource> Heap<S> {
  pub fn with_source(config: HeapConfig, source: S) -> HeapResult<Self> {
    config.validate()?;
    let range = source.range();
    if range.start % PAGE_SIZE != 0 || range.end < range.start {
      return Err(HeapError::InvalidConfig("page source range is not page aligned"));
    }

    let map = PageMap::new(range.start >> PAGE_SHIFT, (range.end - range.start) >> PAGE_SHIFT);
    let mut pool = SpanPool::new();
    let free = FreeLists::new(&mut pool, config.free_list_len);

    Ok(Self {
      inner: Mutex::new(HeapInner {
        pool,
        free,
        source,
        config,
        arena_used: range.start,
        sys_bytes: 0,
        inuse_pages: 0,
        grow_count: 0,
      }),
      map,
    })
  }

  /// Allocate `npages` contiguous pages tagged with `size_class`.
  ///
  /// The memory is zeroed. Fails only when the page source is exhausted.
  pub fn alloc(&self, npages: usize, size_class: u32) -> HeapResult<SpanRef> {
    if npages == 0 || npages > usize::MAX >> PAGE_SHIFT {
      return Err(HeapError::InvalidPageCount(npages));
    }

    let mut inner = self.inner.lock();
    let id = inner.alloc_locked(&self.map, npages, size_class)?;
    inner.inuse_pages += npages;
    #[cfg(feature = "debug-tripwire")]
    inner.tripwire(&self.map);
    Ok(SpanRef::new(id, &inner.pool[id]))
  }

  /// Return a span to the heap.
  ///
  /// The span must be in use with a zero reference count. Anything else means
  /// the caller's bookkeeping is broken and halts the process.
  pub fn free(&self, span: SpanRef) {
    let mut inner = self.inner.lock();
    let record = inner.owned(&span, "free");
    // The caller may have written to it.
    record.needs_zeroing = true;
    inner.free_locked(&self.map, span.id());
    inner.inuse_pages -= span.npages();
    #[cfg(feature = "debug-tripwire")]
    inner.tripwire(&self.map);
  }

  /// Bump the caller-managed reference count. Returns the new count.
  pub fn retain(&self, span: &SpanRef) -> u32 {
    let mut inner = self.inner.lock();
    let record = inner.owned(span, "retain");
    let Some(count) = record.ref_count.checked_add(1) else {
      fatal!("reference count overflow on span {:?}", span.id());
    };
    record.ref_count = count;
    count
  }

  /// Drop the caller-managed reference count. Returns the new count.
  pub fn release(&self, span: &SpanRef) -> u32 {
    let mut inner = self.inner.lock();
    let record = inner.owned(span, "release");
    let Some(count) = record.ref_count.checked_sub(1) else {
      fatal!("reference count underflow on span {:?}", span.id());
    };
    record.ref_count = count;
    count
  }

  /// Span whose first or last page holds `addr`.
  ///
  /// `addr` must be a span boundary (the span's base, or an address in its
  /// last page); anything else may return an unrelated span. Takes no lock,
  /// but only the id comes back: reading the record (size class, state)
  /// through [`Heap::span`] takes the heap lock.
  #[inline]
  pub fn lookup_exact(&self, addr: *const u8) -> Option<SpanId> {
    self.map.get(addr as usize >> PAGE_SHIFT)
  }

  /// In-use span containing `addr`, if any. Any address may be passed.
  pub fn lookup_interior(&self, addr: *const u8) -> Option<SpanRef> {
    let addr = addr as usize;
    let inner = self.inner.lock();
    if addr < self.arena_start() || addr >= inner.arena_used {
      return None;
    }

    // Interior entries of free spans may be stale.
    let page = addr >> PAGE_SHIFT;
    let id = self.map.get(page)?;
    let span = &inner.pool[id];
    if !span.contains(page) || span.state != SpanState::InUse {
      return None;
    }
    Some(SpanRef::new(id, span))
  }

  /// Current state of a span record. An id that never came from this heap
  /// is fatal.
  pub fn span(&self, id: SpanId) -> SpanInfo {
    let inner = self.inner.lock();
    SpanInfo::new(id, &inner.pool[id])
  }

  /// Lowest address the heap can ever hand out.
  pub fn arena_start(&self) -> usize {
    self.map.base() << PAGE_SHIFT
  }

  /// First page of the arena.
  pub fn arena_base_page(&self) -> PageId {
    self.map.base()
  }

  pub fn config(&self) -> HeapConfig {
    self.inner.lock().config.clone()
  }

  pub fn stats(&self) -> HeapStats {
    let inner = self.inner.lock();
    let inuse_bytes = inner.inuse_pages << PAGE_SHIFT;
    HeapStats {
      sys_bytes: inner.sys_bytes,
      inuse_bytes,
      free_bytes: inner.sys_bytes - inuse_bytes,
      span_records: inner.pool.inuse(),
      grow_count: inner.grow_count,
    }
  }

  pub fn snapshot(&self) -> HeapSnapshot {
    let inner = self.inner.lock();
    let pool = &inner.pool;
    let mut spans: Vec<SpanInfo> = pool
      .iter()
      .filter(|(_, span)| is_live(span))
      .map(|(id, span)| SpanInfo::new(id, span))
      .collect();
    spans.sort_by_key(|s| s.start);

    HeapSnapshot {
      spans,
      exact: (0..inner.free.len())
        .map(|n| list_iter(pool, inner.free.exact(n)).collect())
        .collect(),
      large: list_iter(pool, inner.free.large()).collect(),
    }
  }

  /// Walk every span and check the heap's invariants.
  pub fn verify(&self) -> HeapResult<()> {
    self.inner.lock().verify_locked(&self.map).map_err(HeapError::Corrupt)
  }
}

#[inline]
fn is_live(span: &Span) -> bool {
  matches!(span.state, SpanState::Free | SpanState::InUse)
}

// =============================================================================
// Locked operations
// =============================================================================

impl<S: PageSource> HeapInner<S> {
  /// Smallest adequate free span: exact lists first, then the large list.
  fn find(&self, npage: usize) -> Option<SpanId> {
    self
      .free
      .first_fit_exact(&self.pool, npage)
      .or_else(|| self.free.best_fit_large(&self.pool, npage))
  }

  fn alloc_locked(&mut self, map: &PageMap, npage: usize, size_class: u32) -> HeapResult<SpanId> {
    let id = match self.find(npage) {
      Some(id) => id,
      None => {
        self.grow(map, npage)?;
        self.find(npage).ok_or_else(|| HeapError::OutOfMemory {
          requested_pages: npage,
          heap_sys: self.sys_bytes,
        })?
      }
    };

    let span = &self.pool[id];
    if span.state != SpanState::Free {
      fatal!("alloc: span {id:?} on a free list is {:?}", span.state);
    }
    if span.npages < npage {
      fatal!("alloc: span {id:?} has {} pages, wanted {npage}", span.npages);
    }
    list_remove(&mut self.pool, id);

    let span = &mut self.pool[id];
    span.state = SpanState::InUse;
    let (start, npages, dirty) = (span.start, span.npages, span.needs_zeroing);

    if npages > npage {
      // Trim the excess and put it back through the free path so it
      // coalesces like any other free.
      span.npages = npage;
      let tail_start = start + npage;
      let tail_pages = npages - npage;
      let tail = self.pool.alloc(tail_start, tail_pages);
      map.set(tail_start - 1, id);
      map.set(tail_start, tail);
      map.set(tail_start + tail_pages - 1, tail);
      let t = &mut self.pool[tail];
      t.needs_zeroing = dirty;
      t.state = SpanState::InUse;
      self.free_locked(map, tail);
    }

    let span = &mut self.pool[id];
    if dirty {
      unsafe { ptr::write_bytes((start << PAGE_SHIFT) as *mut u8, 0, npage << PAGE_SHIFT) };
      span.needs_zeroing = false;
    }

    // Map every page so interior pointers resolve.
    span.size_class = size_class;
    for page in start..start + npage {
      map.set(page, id);
    }
    Ok(id)
  }

  fn free_locked(&mut self, map: &PageMap, id: SpanId) {
    let span = &mut self.pool[id];
    if span.state != SpanState::InUse || span.ref_count != 0 {
      fatal!(
        "invalid free of span {id:?} at page {:#x}: state {:?}, ref_count {}",
        span.start,
        span.state,
        span.ref_count
      );
    }
    span.state = SpanState::Free;
    list_remove(&mut self.pool, id);

    // Coalesce with the span ending right before us.
    let start = self.pool[id].start;
    if let Some(left) = start.checked_sub(1).and_then(|page| map.get(page))
      && self.pool[left].state != SpanState::InUse
    {
      let (l_start, l_pages, l_dirty) = {
        let l = &self.pool[left];
        (l.start, l.npages, l.needs_zeroing)
      };
      let span = &mut self.pool[id];
      span.needs_zeroing |= l_dirty;
      span.start = l_start;
      span.npages += l_pages;
      map.set(l_start, id);
      self.retire(left);
    }

    // And with the one starting right after us.
    let end = self.pool[id].end();
    if let Some(right) = map.get(end)
      && self.pool[right].state != SpanState::InUse
    {
      let (r_pages, r_dirty) = {
        let r = &self.pool[right];
        (r.npages, r.needs_zeroing)
      };
      let span = &mut self.pool[id];
      span.needs_zeroing |= r_dirty;
      span.npages += r_pages;
      map.set(span.end() - 1, id);
      self.retire(right);
    }

    self.free.insert(&mut self.pool, id);
  }

  /// Drop a span that was merged into a neighbour.
  fn retire(&mut self, id: SpanId) {
    list_remove(&mut self.pool, id);
    self.pool[id].state = SpanState::Dead;
    self.pool.free(id);
  }

  /// Get at least `npage` more pages from the source and free them into the
  /// heap.
  fn grow(&mut self, map: &PageMap, npage: usize) -> HeapResult<()> {
    let oom = |heap_sys| HeapError::OutOfMemory {
      requested_pages: npage,
      heap_sys,
    };
    let Some(exact) = npage.checked_mul(PAGE_SIZE) else {
      return Err(oom(self.sys_bytes));
    };

    // Ask for a big chunk to keep the number of OS mappings down.
    let rounded = npage
      .checked_next_multiple_of(self.config.grow_granularity)
      .and_then(|n| n.checked_mul(PAGE_SIZE))
      .unwrap_or(exact);
    let mut ask = rounded.max(self.config.min_grow_bytes);

    let mut region = self.source.reserve(ask);
    if region.is_none() && ask > exact {
      log::warn!("page heap: {ask}-byte growth refused, retrying with {exact} bytes");
      ask = exact;
      region = self.source.reserve(ask);
    }
    let Some(region) = region else {
      log::error!(
        "page heap: out of memory: cannot allocate {ask}-byte block ({} in use)",
        self.sys_bytes
      );
      return Err(oom(self.sys_bytes));
    };

    let addr = region.as_ptr() as usize;
    let start = addr >> PAGE_SHIFT;
    let npages = ask >> PAGE_SHIFT;
    if addr % PAGE_SIZE != 0 || !map.covers(start, npages) {
      fatal!("page source returned {ask} bytes at {addr:#x}, outside its range");
    }
    map.grow(start, npages);
    self.sys_bytes += ask;
    self.grow_count += 1;
    self.arena_used = self.arena_used.max(addr + ask);
    log::debug!(
      "page heap: grew by {npages} pages at {addr:#x} ({} bytes total)",
      self.sys_bytes
    );

    // Free a fake in-use span so the new region merges with its neighbours.
    let id = self.pool.alloc(start, npages);
    map.set(start, id);
    map.set(start + npages - 1, id);
    self.pool[id].state = SpanState::InUse;
    self.free_locked(map, id);
    Ok(())
  }

  /// Resolve a caller's span, which must still be the in-use span it was
  /// handed.
  fn owned(&mut self, span: &SpanRef, op: &str) -> &mut Span {
    let record = &mut self.pool[span.id()];
    if record.state != SpanState::InUse
      || record.start != span.start()
      || record.npages != span.npages()
    {
      fatal!(
        "invalid {op} of span {:?} [{:#x}, +{}): record is {:?} [{:#x}, +{}), ref_count {}",
        span.id(),
        span.start(),
        span.npages(),
        record.state,
        record.start,
        record.npages,
        record.ref_count
      );
    }
    record
  }

  fn verify_locked(&self, map: &PageMap) -> Result<(), String> {
    let mut live: Vec<(SpanId, &Span)> =
      self.pool.iter().filter(|(_, span)| is_live(span)).collect();
    live.sort_by_key(|(_, span)| span.start);

    let mut total_pages = 0;
    let mut inuse_pages = 0;
    let mut free_spans = 0;
    for (i, &(id, span)) in live.iter().enumerate() {
      if span.npages == 0 || !map.covers(span.start, span.npages) {
        return Err(format!(
          "span {id:?} [{:#x}, +{}) is outside the arena",
          span.start, span.npages
        ));
      }
      if map.get(span.start) != Some(id) || map.get(span.end() - 1) != Some(id) {
        return Err(format!("span {id:?} at page {:#x} has stale boundary entries", span.start));
      }

      match span.state {
        SpanState::InUse => {
          if span.is_linked() {
            return Err(format!("in-use span {id:?} is on a free list"));
          }
          if let Some(page) = (span.start..span.end()).find(|&p| map.get(p) != Some(id)) {
            return Err(format!("in-use span {id:?} does not own its page {page:#x}"));
          }
          inuse_pages += span.npages;
        }
        _ => {
          if !span.is_linked() {
            return Err(format!("free span {id:?} is on no free list"));
          }
          free_spans += 1;
        }
      }

      if let Some(&(next_id, next)) = live.get(i + 1) {
        if next.start < span.end() {
          return Err(format!("spans {id:?} and {next_id:?} overlap"));
        }
        if next.start == span.end()
          && span.state == SpanState::Free
          && next.state == SpanState::Free
        {
          return Err(format!("adjacent free spans {id:?} and {next_id:?} were not merged"));
        }
      }
      total_pages += span.npages;
    }

    if total_pages << PAGE_SHIFT != self.sys_bytes {
      return Err(format!(
        "spans cover {total_pages} pages but {} bytes came from the source",
        self.sys_bytes
      ));
    }
    if inuse_pages != self.inuse_pages {
      return Err(format!(
        "{inuse_pages} pages in use, counter says {}",
        self.inuse_pages
      ));
    }
    let listed = self.free.check(&self.pool)?;
    if listed != free_spans {
      return Err(format!("{listed} spans on free lists, {free_spans} free spans"));
    }
    Ok(())
  }

  #[cfg(feature = "debug-tripwire")]
  fn tripwire(&self, map: &PageMap) {
    if let Err(err) = self.verify_locked(map) {
      fatal!("debug-tripwire: {err}");
    }
  }
}
