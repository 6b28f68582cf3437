//! Timer and connection identifier types

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier for a scheduled timer, unique within its `EventLoop`.
///
/// Returned by `run_after`/`run_every` and consumed by `cancel_timer`.
/// Ids are monotonically increasing per loop and never reused, so a
/// stale id cancels nothing instead of cancelling a stranger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl TimerId {
    /// Raw id value (for logging).
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Process-wide unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl ConnId {
    /// Allocate the next connection id.
    #[inline]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ConnId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value (for logging).
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}
