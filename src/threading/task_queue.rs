//! The delay-ordered task queue described in spec.md §4.C.
//!
//! Grounded in `original_source/libs/core/src/Threads/ThreadPoolDelayedQueue.cc`
//! and its sibling header, which hold nestable/non-nestable FIFOs plus a
//! delay-ordered list and expose `PushItem`/`PushItemDelayed`/`GetNextItem`/
//! `MayHaveItems`. `TaskQueue<T>` here is the generic container both the
//! foreground runner (§4.F) and the worker thread pool (§4.D) are built on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::time::TimeSource;

struct DelayedEntry<T> {
    deadline: f64,
    seq: u64,
    non_nestable: bool,
    item: T,
}

struct Inner<T> {
    nestable: VecDeque<T>,
    non_nestable: VecDeque<T>,
    // Kept sorted by (deadline, seq) ascending; small in practice so linear
    // insertion is simpler and cheaper than a heap with removal support.
    delayed: Vec<DelayedEntry<T>>,
    terminated: bool,
}

/// Callback fired when a newly-pushed delayed item becomes the new head of
/// the delay-ordered list, so a pumping thread pool worker (§4.D) can wake
/// immediately instead of waiting out its poll interval.
pub type DelayedReadyCallback = Box<dyn Fn() + Send + Sync>;

/// A generic delay-ordered task queue: nestable / non-nestable / delayed
/// sub-queues behind one lock.
pub struct TaskQueue<T> {
    inner: Mutex<Inner<T>>,
    clock: Arc<dyn TimeSource>,
    next_seq: AtomicU64,
    has_items_hint: AtomicBool,
    on_delayed_ready: Mutex<Option<DelayedReadyCallback>>,
}

impl<T> TaskQueue<T> {
    /// Create an empty queue driven by `clock`.
    pub fn new(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                nestable: VecDeque::new(),
                non_nestable: VecDeque::new(),
                delayed: Vec::new(),
                terminated: false,
            }),
            clock,
            next_seq: AtomicU64::new(0),
            has_items_hint: AtomicBool::new(false),
            on_delayed_ready: Mutex::new(None),
        }
    }

    /// Register the callback fired when a delayed push becomes the new
    /// earliest-deadline entry.
    pub fn set_delayed_ready_callback(&self, callback: DelayedReadyCallback) {
        *self.on_delayed_ready.lock().unwrap() = Some(callback);
    }

    /// Push a nestable, immediately-ready item.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminated {
            return false;
        }
        inner.nestable.push_back(item);
        self.has_items_hint.store(true, Ordering::Relaxed);
        true
    }

    /// Push a non-nestable, immediately-ready item (gated by nesting depth
    /// at dequeue time; see [`TaskQueue::get_next`]).
    pub fn push_non_nestable(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminated {
            return false;
        }
        inner.non_nestable.push_back(item);
        self.has_items_hint.store(true, Ordering::Relaxed);
        true
    }

    /// Push an item ready no earlier than `delay_sec` from now.
    pub fn push_delayed(&self, item: T, delay_sec: f64) -> bool {
        self.push_delayed_inner(item, delay_sec, false)
    }

    /// Push a non-nestable item ready no earlier than `delay_sec` from now.
    pub fn push_non_nestable_delayed(&self, item: T, delay_sec: f64) -> bool {
        self.push_delayed_inner(item, delay_sec, true)
    }

    fn push_delayed_inner(&self, item: T, delay_sec: f64, non_nestable: bool) -> bool {
        let deadline = self.clock.monotonic_seconds() + delay_sec.max(0.0);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let became_head = {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminated {
                return false;
            }
            let entry = DelayedEntry {
                deadline,
                seq,
                non_nestable,
                item,
            };
            let pos = inner
                .delayed
                .iter()
                .position(|e| (e.deadline, e.seq) > (deadline, seq))
                .unwrap_or(inner.delayed.len());
            inner.delayed.insert(pos, entry);
            self.has_items_hint.store(true, Ordering::Relaxed);
            pos == 0
        };
        if became_head {
            if let Some(cb) = self.on_delayed_ready.lock().unwrap().as_ref() {
                cb();
            }
        }
        true
    }

    /// Return the next deliverable item, honoring:
    /// - the earliest-ready delayed item whose deadline has passed, gated by
    ///   `nesting_depth` if it is non-nestable, ahead of any FIFO item;
    /// - at `nesting_depth == 0`, non-nestable FIFO items become eligible;
    ///   at any positive depth they are skipped.
    ///
    /// `nesting_depth` defaults to `0` (all items eligible) when `None`.
    pub fn get_next(&self, nesting_depth: Option<u32>) -> Option<T> {
        let depth = nesting_depth.unwrap_or(0);
        let mut inner = self.inner.lock().unwrap();
        if inner.terminated {
            return None;
        }
        let now = self.clock.monotonic_seconds();

        if let Some(idx) = inner
            .delayed
            .iter()
            .position(|e| e.deadline <= now && (!e.non_nestable || depth == 0))
        {
            let entry = inner.delayed.remove(idx);
            self.update_hint(&inner);
            return Some(entry.item);
        }

        if let Some(item) = inner.nestable.pop_front() {
            self.update_hint(&inner);
            return Some(item);
        }

        if depth == 0 {
            if let Some(item) = inner.non_nestable.pop_front() {
                self.update_hint(&inner);
                return Some(item);
            }
        }

        None
    }

    fn update_hint(&self, inner: &Inner<T>) {
        let has_items = !inner.nestable.is_empty()
            || !inner.non_nestable.is_empty()
            || !inner.delayed.is_empty();
        self.has_items_hint.store(has_items, Ordering::Relaxed);
    }

    /// Cheap, possibly-stale predicate used as a wake condition. May
    /// over-report (say `true` when nothing is actually eligible yet because
    /// every delayed item's deadline is still in the future).
    pub fn may_have_items(&self) -> bool {
        self.has_items_hint.load(Ordering::Relaxed)
    }

    /// Drain all queues and reject all further pushes.
    pub fn terminate(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.terminated = true;
        inner.nestable.clear();
        inner.non_nestable.clear();
        inner.delayed.clear();
        self.has_items_hint.store(false, Ordering::Relaxed);
    }

    /// Whether [`TaskQueue::terminate`] has been called.
    pub fn is_terminated(&self) -> bool {
        self.inner.lock().unwrap().terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::StubTimeSource;

    fn queue() -> (TaskQueue<u32>, Arc<StubTimeSource>) {
        let clock = Arc::new(StubTimeSource::new());
        (TaskQueue::new(clock.clone()), clock)
    }

    #[test]
    fn fifo_order_among_nestable_items() {
        let (q, _clock) = queue();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.get_next(None), Some(1));
        assert_eq!(q.get_next(None), Some(2));
        assert_eq!(q.get_next(None), Some(3));
        assert_eq!(q.get_next(None), None);
    }

    #[test]
    fn non_nestable_hidden_at_positive_depth() {
        let (q, _clock) = queue();
        q.push_non_nestable(1);
        assert_eq!(q.get_next(Some(1)), None);
        assert_eq!(q.get_next(Some(0)), Some(1));
    }

    #[test]
    fn delayed_items_wait_for_deadline() {
        let (q, clock) = queue();
        q.push_delayed(1, 5.0);
        assert_eq!(q.get_next(None), None);
        clock.advance(5.0);
        assert_eq!(q.get_next(None), Some(1));
    }

    #[test]
    fn delayed_zero_delay_is_immediate() {
        let (q, _clock) = queue();
        q.push_delayed(1, 0.0);
        assert_eq!(q.get_next(None), Some(1));
    }

    #[test]
    fn delayed_items_rank_ahead_of_fifo_once_ready() {
        let (q, clock) = queue();
        q.push(100);
        q.push_delayed(1, 1.0);
        clock.advance(1.0);
        assert_eq!(q.get_next(None), Some(1));
        assert_eq!(q.get_next(None), Some(100));
    }

    #[test]
    fn equal_deadline_ties_broken_fifo() {
        let (q, clock) = queue();
        q.push_delayed(1, 1.0);
        q.push_delayed(2, 1.0);
        clock.advance(1.0);
        assert_eq!(q.get_next(None), Some(1));
        assert_eq!(q.get_next(None), Some(2));
    }

    #[test]
    fn non_nestable_delayed_gated_by_depth() {
        let (q, clock) = queue();
        q.push_non_nestable_delayed(1, 1.0);
        q.push_delayed(2, 1.0);
        clock.advance(1.0);
        // at depth 1, the non-nestable delayed entry is skipped in favor of
        // the nestable delayed entry even though it was pushed later.
        assert_eq!(q.get_next(Some(1)), Some(2));
        assert_eq!(q.get_next(Some(1)), None);
        assert_eq!(q.get_next(Some(0)), Some(1));
    }

    #[test]
    fn terminate_drains_and_blocks_future_pushes() {
        let (q, _clock) = queue();
        q.push(1);
        q.terminate();
        assert_eq!(q.get_next(None), None);
        assert!(!q.push(2));
        assert!(!q.may_have_items());
    }

    #[test]
    fn terminate_is_idempotent() {
        let (q, _clock) = queue();
        q.terminate();
        q.terminate();
        assert!(q.is_terminated());
    }

    #[test]
    fn delayed_ready_callback_fires_when_new_head_arrives() {
        let (q, _clock) = queue();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        q.set_delayed_ready_callback(Box::new(move || {
            fired_clone.store(true, Ordering::SeqCst);
        }));
        q.push_delayed(1, 10.0);
        assert!(fired.load(Ordering::SeqCst));
    }
}
