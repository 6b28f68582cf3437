//! Timer entry storage

use gev_core::TimerId;

use std::time::{Duration, Instant};

/// A scheduled callback, stored in the queue's heap.
///
/// `seq` is the insertion sequence number; two entries with the same
/// deadline fire in insertion order. A periodic entry keeps its id
/// across refirings so cancellation works at any point in its life.
pub struct TimerEntry {
    /// Unique per loop, never reused.
    pub id: TimerId,

    /// Insertion sequence, tie-break for equal deadlines.
    pub(crate) seq: u64,

    /// Absolute fire time.
    pub deadline: Instant,

    /// Repeat interval for periodic timers, `None` for one-shots.
    pub interval: Option<Duration>,

    /// The scheduled work.
    pub callback: Box<dyn FnMut()>,
}

impl TimerEntry {
    /// True when this entry reschedules after firing.
    #[inline]
    pub fn is_periodic(&self) -> bool {
        self.interval.is_some()
    }
}

impl std::fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEntry")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("deadline", &self.deadline)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
