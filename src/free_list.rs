use crate::span::{SpanId, SpanPool, SpanState};

// =============================================================================
// Intrusive span lists
// =============================================================================
//
// Lists are circular and doubly linked through the records' `prev`/`next`
// fields, with a `ListHead` sentinel record. A span is on a list iff its links
// are set.

/// Link `span` right after the sentinel `list`.
pub(crate) fn list_insert(pool: &mut SpanPool, list: SpanId, span: SpanId) {
  if pool[span].is_linked() {
    fatal!(
      "span {span:?} inserted into a free list while already linked (prev {:?}, next {:?})",
      pool[span].prev,
      pool[span].next
    );
  }
  let Some(first) = pool[list].next else {
    fatal!("free list head {list:?} has no links");
  };
  pool[span].next = Some(first);
  pool[span].prev = Some(list);
  pool[first].prev = Some(span);
  pool[list].next = Some(span);
}

/// Unlink `span` from whatever list holds it. Detached spans are left alone.
pub(crate) fn list_remove(pool: &mut SpanPool, span: SpanId) {
  let (Some(prev), Some(next)) = (pool[span].prev, pool[span].next) else {
    return;
  };
  pool[prev].next = Some(next);
  pool[next].prev = Some(prev);
  pool[span].prev = None;
  pool[span].next = None;
}

#[inline]
pub(crate) fn list_is_empty(pool: &SpanPool, list: SpanId) -> bool {
  pool[list].next == Some(list)
}

/// Walk a list from the sentinel, front to back.
pub(crate) fn list_iter(pool: &SpanPool, list: SpanId) -> ListIter<'_> {
  ListIter {
    pool,
    list,
    cur: pool[list].next,
  }
}

pub(crate) struct ListIter<'a> {
  pool: &'a SpanPool,
  list: SpanId,
  cur: Option<SpanId>,
}

impl Iterator for ListIter<'_> {
  type Item = SpanId;

  fn next(&mut self) -> Option<SpanId> {
    let cur = self.cur?;
    if cur == self.list {
      self.cur = None;
      return None;
    }
    self.cur = self.pool[cur].next;
    Some(cur)
  }
}

// =============================================================================
// Free list set
// =============================================================================

/// Free spans bucketed by page count.
///
/// `exact[n]` holds only spans of exactly `n` pages, for `n < len()`. Larger
/// spans share the unordered `large` list.
pub(crate) struct FreeLists {
  exact: Box<[SpanId]>,
  large: SpanId,
}

impl FreeLists {
  pub fn new(pool: &mut SpanPool, len: usize) -> Self {
    let exact = (0..len).map(|_| pool.alloc_list_head()).collect();
    let large = pool.alloc_list_head();
    Self { exact, large }
  }

  /// Bound between the exact lists and the large list.
  #[inline]
  pub fn len(&self) -> usize {
    self.exact.len()
  }

  /// Sentinel of the list a span of `npages` belongs on.
  #[inline]
  pub fn list_for(&self, npages: usize) -> SpanId {
    if npages < self.exact.len() {
      self.exact[npages]
    } else {
      self.large
    }
  }

  #[inline]
  pub fn exact(&self, npages: usize) -> SpanId {
    self.exact[npages]
  }

  #[inline]
  pub fn large(&self) -> SpanId {
    self.large
  }

  pub fn insert(&self, pool: &mut SpanPool, span: SpanId) {
    let list = self.list_for(pool[span].npages);
    list_insert(pool, list, span);
  }

  /// First span on the first non-empty exact list at or above `npages`.
  pub fn first_fit_exact(&self, pool: &SpanPool, npages: usize) -> Option<SpanId> {
    (npages.max(1)..self.exact.len())
      .map(|n| self.exact[n])
      .find(|&list| !list_is_empty(pool, list))
      .and_then(|list| pool[list].next)
  }

  /// Smallest large span with at least `npages` pages; lowest start on ties.
  pub fn best_fit_large(&self, pool: &SpanPool, npages: usize) -> Option<SpanId> {
    let mut best: Option<SpanId> = None;
    for id in list_iter(pool, self.large) {
      let span = &pool[id];
      if span.npages < npages {
        continue;
      }
      let better = match best {
        None => true,
        Some(b) => {
          let b = &pool[b];
          span.npages < b.npages || (span.npages == b.npages && span.start < b.start)
        }
      };
      if better {
        best = Some(id);
      }
    }
    best
  }

  /// Check that every listed span is free and sized for its list.
  pub fn check(&self, pool: &SpanPool) -> Result<usize, String> {
    let mut listed = 0;
    let lists = self.exact.iter().copied().chain(core::iter::once(self.large));
    for (n, list) in lists.enumerate() {
      for id in list_iter(pool, list) {
        let span = &pool[id];
        if span.state != SpanState::Free {
          return Err(format!("span {id:?} on free list {n} is {:?}", span.state));
        }
        if list != self.list_for(span.npages) {
          return Err(format!(
            "span {id:?} of {} pages is on free list {n}",
            span.npages
          ));
        }
        listed += 1;
      }
    }
    Ok(listed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn free_span(pool: &mut SpanPool, start: usize, npages: usize) -> SpanId {
    let id = pool.alloc(start, npages);
    pool[id].state = SpanState::Free;
    id
  }

  #[test]
  fn insert_and_remove_splice() {
    let mut pool = SpanPool::new();
    let list = pool.alloc_list_head();
    assert!(list_is_empty(&pool, list));

    let a = free_span(&mut pool, 0, 1);
    let b = free_span(&mut pool, 1, 1);
    let c = free_span(&mut pool, 2, 1);
    list_insert(&mut pool, list, a);
    list_insert(&mut pool, list, b);
    list_insert(&mut pool, list, c);
    assert_eq!(list_iter(&pool, list).collect::<Vec<_>>(), vec![c, b, a]);

    list_remove(&mut pool, b);
    assert!(!pool[b].is_linked());
    assert_eq!(list_iter(&pool, list).collect::<Vec<_>>(), vec![c, a]);

    // Detached: no-op.
    list_remove(&mut pool, b);
    assert_eq!(list_iter(&pool, list).count(), 2);

    list_remove(&mut pool, a);
    list_remove(&mut pool, c);
    assert!(list_is_empty(&pool, list));
  }

  #[test]
  #[should_panic(expected = "already linked")]
  fn double_insert_is_fatal() {
    let mut pool = SpanPool::new();
    let first = pool.alloc_list_head();
    let second = pool.alloc_list_head();
    let a = free_span(&mut pool, 0, 1);
    list_insert(&mut pool, first, a);
    list_insert(&mut pool, second, a);
  }

  #[test]
  fn exact_search_takes_next_larger_list() {
    let mut pool = SpanPool::new();
    let lists = FreeLists::new(&mut pool, 8);
    let four = free_span(&mut pool, 0, 4);
    let six = free_span(&mut pool, 10, 6);
    lists.insert(&mut pool, four);
    lists.insert(&mut pool, six);

    assert_eq!(lists.first_fit_exact(&pool, 3), Some(four));
    assert_eq!(lists.first_fit_exact(&pool, 5), Some(six));
    assert_eq!(lists.first_fit_exact(&pool, 7), None);
    assert_eq!(lists.best_fit_large(&pool, 1), None);
  }

  #[test]
  fn large_search_is_best_fit_lowest_start() {
    let mut pool = SpanPool::new();
    let lists = FreeLists::new(&mut pool, 4);
    let spans = [(100, 30), (40, 9), (200, 12), (60, 9), (10, 5)];
    let ids: Vec<_> = spans
      .iter()
      .map(|&(start, npages)| {
        let id = free_span(&mut pool, start, npages);
        lists.insert(&mut pool, id);
        id
      })
      .collect();

    assert_eq!(lists.best_fit_large(&pool, 6), Some(ids[1]));
    assert_eq!(lists.best_fit_large(&pool, 5), Some(ids[4]));
    assert_eq!(lists.best_fit_large(&pool, 10), Some(ids[2]));
    assert_eq!(lists.best_fit_large(&pool, 31), None);
    assert_eq!(lists.check(&pool), Ok(5));
  }
}
