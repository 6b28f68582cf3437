//! Min-heap timer queue with lazy cancellation
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) (tombstone)
//! - Pop due: O(k log n) for k expired timers
//! - Next deadline: O(1)
//!
//! # Cancellation
//!
//! `cancel` tombstones the id; the entry is dropped when it next
//! surfaces from the heap. The loop's dispatch path re-checks the
//! tombstone before every firing, so an id cancelled mid-pass (by an
//! earlier callback in the same pass, or by the timer's own callback)
//! never fires again. `active` tracks ids that are in the heap or in
//! flight, which keeps a cancel of a long-dead id from leaking a
//! tombstone.

use super::entry::TimerEntry;
use gev_core::TimerId;

use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

/// Wrapper for heap ordering (min-heap by deadline, then insertion).
struct HeapEntry(TimerEntry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.seq == other.0.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest deadline first),
        // insertion sequence as the tie-break.
        match other.0.deadline.cmp(&self.0.deadline) {
            std::cmp::Ordering::Equal => other.0.seq.cmp(&self.0.seq),
            ord => ord,
        }
    }
}

/// Ordered collection of scheduled callbacks. Owner-thread only.
pub struct TimerQueue {
    heap: BinaryHeap<HeapEntry>,

    /// Cancelled ids awaiting removal (lazy cancellation).
    cancelled: HashSet<TimerId>,

    /// Ids currently in the heap or popped-but-unfinished.
    active: HashSet<TimerId>,

    /// Next id to hand out; per-loop monotonic, never reused.
    next_id: u64,

    /// Insertion counter for deadline tie-breaks.
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::with_capacity(64),
            cancelled: HashSet::new(),
            active: HashSet::new(),
            next_id: 1,
            next_seq: 1,
        }
    }

    /// Schedule a callback for `deadline`; `interval` makes it periodic.
    pub fn insert(
        &mut self,
        deadline: Instant,
        interval: Option<Duration>,
        callback: Box<dyn FnMut()>,
    ) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.active.insert(id);
        self.heap.push(HeapEntry(TimerEntry {
            id,
            seq,
            deadline,
            interval,
            callback,
        }));
        id
    }

    /// Tombstone a timer. Idempotent; a no-op for ids that already
    /// fired their last time or never existed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if !self.active.contains(&id) {
            return false;
        }
        self.cancelled.insert(id)
    }

    /// True when `id` has been tombstoned but not yet reaped.
    #[inline]
    pub fn is_cancelled(&self, id: TimerId) -> bool {
        self.cancelled.contains(&id)
    }

    /// Pop every entry whose deadline has passed, in (deadline,
    /// insertion) order. Tombstoned entries are reaped here and not
    /// returned. Returned entries stay `active` until `reinsert` or
    /// `finish`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        while let Some(head) = self.heap.peek() {
            if head.0.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap().0;
            if self.cancelled.remove(&entry.id) {
                self.active.remove(&entry.id);
                continue;
            }
            due.push(entry);
        }
        due
    }

    /// Put a periodic entry back with a new deadline. The id is kept;
    /// a fresh insertion sequence preserves the tie-break semantics.
    pub fn reinsert(&mut self, mut entry: TimerEntry, deadline: Instant) {
        debug_assert!(self.active.contains(&entry.id));
        entry.deadline = deadline;
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry(entry));
    }

    /// Retire an id that will never fire again (one-shot fired, or a
    /// periodic cancelled while in flight).
    pub fn finish(&mut self, id: TimerId) {
        self.active.remove(&id);
        self.cancelled.remove(&id);
    }

    /// Earliest scheduled deadline, if any. Tombstoned entries at the
    /// front are counted; the cost is a spurious early wakeup, which is
    /// harmless.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.0.deadline)
    }

    /// Live (non-tombstoned) timer count.
    pub fn len(&self) -> usize {
        self.heap.len().saturating_sub(self.cancelled.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn noop() -> Box<dyn FnMut()> {
        Box::new(|| {})
    }

    #[test]
    fn test_pop_due_in_deadline_order() {
        let mut q = TimerQueue::new();
        let now = Instant::now();

        let c = q.insert(now + Duration::from_millis(30), None, noop());
        let a = q.insert(now + Duration::from_millis(10), None, noop());
        let b = q.insert(now + Duration::from_millis(20), None, noop());

        let due = q.pop_due(now + Duration::from_millis(50));
        let ids: Vec<_> = due.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let mut q = TimerQueue::new();
        let deadline = Instant::now() + Duration::from_millis(10);

        let first = q.insert(deadline, None, noop());
        let second = q.insert(deadline, None, noop());
        let third = q.insert(deadline, None, noop());

        let due = q.pop_due(deadline);
        let ids: Vec<_> = due.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first, second, third]);
    }

    #[test]
    fn test_undue_entries_stay() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        q.insert(now + Duration::from_secs(60), None, noop());
        assert!(q.pop_due(now).is_empty());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_cancel_is_idempotent_and_reaps() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let id = q.insert(now + Duration::from_millis(5), None, noop());

        assert!(q.cancel(id));
        assert!(!q.cancel(id)); // second cancel is a no-op
        assert_eq!(q.len(), 0);

        // Tombstoned entry is reaped, not returned.
        assert!(q.pop_due(now + Duration::from_secs(1)).is_empty());
        assert!(!q.is_cancelled(id));
        // Fully retired: a third cancel no-ops without leaking.
        assert!(!q.cancel(id));
        assert!(q.cancelled.is_empty());
        assert!(q.active.is_empty());
    }

    #[test]
    fn test_cancel_unknown_id_is_noop() {
        let mut q = TimerQueue::new();
        assert!(!q.cancel(gev_core::TimerId(999)));
        assert!(q.cancelled.is_empty());
    }

    #[test]
    fn test_reinsert_keeps_id() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let id = q.insert(now, Some(Duration::from_millis(10)), noop());

        let mut due = q.pop_due(now);
        assert_eq!(due.len(), 1);
        let entry = due.pop().unwrap();
        assert_eq!(entry.id, id);

        q.reinsert(entry, now + Duration::from_millis(10));
        // Cancel still works on the rescheduled incarnation.
        assert!(q.cancel(id));
        assert!(q.pop_due(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_callbacks_survive_the_heap() {
        let mut q = TimerQueue::new();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();

        for i in 0..3u32 {
            let fired = fired.clone();
            q.insert(
                now + Duration::from_millis(i as u64),
                None,
                Box::new(move || fired.borrow_mut().push(i)),
            );
        }

        for mut entry in q.pop_due(now + Duration::from_millis(10)) {
            (entry.callback)();
            q.finish(entry.id);
        }
        assert_eq!(*fired.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_next_deadline_tracks_minimum() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        assert!(q.next_deadline().is_none());

        q.insert(now + Duration::from_millis(100), None, noop());
        q.insert(now + Duration::from_millis(40), None, noop());
        assert_eq!(q.next_deadline(), Some(now + Duration::from_millis(40)));
    }
}
