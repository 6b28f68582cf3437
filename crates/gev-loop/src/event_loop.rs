//! # The event loop, one per OS thread
//!
//! The central scheduler. Each loop owns a `Poller`, a `TimerQueue`, a
//! mutex-guarded list of cross-thread tasks, and an eventfd waker whose
//! only job is to force a blocked multiplexer wait to return.
//!
//! Per `dispatch_once` iteration:
//! 1. Wait on the multiplexer, with the next timer deadline as the
//!    timeout (indefinitely when no timer is scheduled)
//! 2. Dispatch exactly one of {read, write, close} per ready
//!    descriptor, prioritized read > write > close-as-fallback
//! 3. Swap the pending task list out under its lock, release the lock,
//!    then run every task
//! 4. Pop and fire due timers in ascending-deadline order, insertion
//!    order breaking ties
//!
//! Everything a loop owns is mutated only on the loop's owning thread;
//! I/O callbacks, timer callbacks, and cross-thread tasks all run
//! serialized there, so loop-owned state needs no locking. The only
//! blocking call a loop thread ever makes is the multiplexer wait.

use crate::poller::{Interest, Poller};
use crate::timer::{TimerQueue, MAX_PERIODIC_CATCHUP};
use crate::waker::{self, Waker};
use gev_core::{gdebug, gtrace, TimerId};

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// A unit of work marshaled onto a loop's owning thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// The closed set of events a sink can be handed. Exactly one is
/// dispatched per ready descriptor per wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    Readable,
    Writable,
    /// Hangup or error with no readable/writable bit set.
    Closed,
}

/// Per-descriptor event handler contract.
///
/// Implementors live in the owning loop's sink table and are invoked
/// only on that loop's thread.
pub trait EventSink {
    fn on_event(self: Rc<Self>, event: SocketEvent);
}

/// Drains the loop's own eventfd when it becomes readable.
struct WakerSink {
    fd: RawFd,
}

impl EventSink for WakerSink {
    fn on_event(self: Rc<Self>, event: SocketEvent) {
        if event == SocketEvent::Readable {
            waker::drain_eventfd(self.fd);
        }
    }
}

/// One event loop, pinned to the thread that created it.
///
/// # Safety
///
/// `poller`, `timers`, and `sinks` are single-thread state: every
/// method touching them asserts it runs on `owner`. The cross-thread
/// surface (`pending`, `quit`, and the waker's descriptor) is made of
/// `Send + Sync` parts. That owner-pinning is the justification for
/// the manual `Send`/`Sync` impls; tear a loop down only after its
/// thread has left `run()`.
pub struct EventLoop {
    owner: ThreadId,
    poller: RefCell<Poller>,
    timers: RefCell<TimerQueue>,
    /// Stable table of event records, keyed by the descriptor the
    /// kernel hands back. Never holds a raw heap address.
    sinks: RefCell<HashMap<RawFd, Rc<dyn EventSink>>>,
    pending: Mutex<Vec<Task>>,
    waker: Waker,
    quit: AtomicBool,
}

unsafe impl Send for EventLoop {}
unsafe impl Sync for EventLoop {}

impl EventLoop {
    /// Create a loop owned by the calling thread. Multiplexer or waker
    /// setup failure is fatal: a reactor cannot run without either.
    pub fn new() -> Arc<Self> {
        crate::signal::ignore_sigpipe();

        let mut poller = Poller::new()
            .unwrap_or_else(|e| panic!("gev-loop: multiplexer setup failed: {}", e));
        let waker =
            Waker::create().unwrap_or_else(|e| panic!("gev-loop: waker setup failed: {}", e));
        let waker_fd = waker.fd();
        poller
            .register_or_update(waker_fd, Interest::NONE, Interest::READ)
            .unwrap_or_else(|e| panic!("gev-loop: waker registration failed: {}", e));

        let lp = Arc::new(Self {
            owner: thread::current().id(),
            poller: RefCell::new(poller),
            timers: RefCell::new(TimerQueue::new()),
            sinks: RefCell::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            waker,
            quit: AtomicBool::new(false),
        });
        lp.sinks
            .borrow_mut()
            .insert(waker_fd, Rc::new(WakerSink { fd: waker_fd }));
        gdebug!("gev-loop: created on {:?}", lp.owner);
        lp
    }

    /// True when the caller is the loop's owning thread.
    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Abort with a diagnostic when called off the owning thread.
    pub fn assert_in_loop_thread(&self, what: &str) {
        if !self.is_in_loop_thread() {
            panic!(
                "gev-loop: {} called from {:?}, loop owned by {:?}",
                what,
                thread::current().id(),
                self.owner
            );
        }
    }

    /// Drive the loop until `quit`. Owner thread only.
    pub fn run(&self) {
        self.assert_in_loop_thread("run");
        gdebug!("gev-loop: running");
        while !self.quit.load(Ordering::Acquire) {
            self.dispatch_once();
        }
        gdebug!("gev-loop: stopped");
    }

    /// One scheduler iteration: wait, dispatch I/O, run marshaled
    /// tasks, fire due timers.
    pub fn dispatch_once(&self) {
        self.assert_in_loop_thread("dispatch_once");

        let timeout = self
            .timers
            .borrow()
            .next_deadline()
            .map(|d| d.saturating_duration_since(Instant::now()));
        let events = self.poller.borrow_mut().wait(timeout);

        for ev in &events {
            // Clone the sink out so no table borrow is held while its
            // callbacks run; a callback may register or deregister.
            let sink = self.sinks.borrow().get(&ev.fd).cloned();
            let Some(sink) = sink else {
                gtrace!("gev-loop: event for unregistered fd {}", ev.fd);
                continue;
            };
            let r = ev.readiness;
            let event = if r.readable() {
                SocketEvent::Readable
            } else if r.writable() {
                SocketEvent::Writable
            } else {
                SocketEvent::Closed
            };
            sink.on_event(event);
        }

        self.drain_pending_tasks();
        self.fire_due_timers();
    }

    /// Request the loop to stop after the current iteration. Safe from
    /// any thread; cooperative, never preemptive.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        self.waker.notify();
    }

    // ── Cross-thread dispatch ────────────────────────────────────────

    /// Run `task` on the owning thread: synchronously inline when the
    /// caller already is that thread, otherwise queued and the waker
    /// signaled so a blocked wait returns promptly. Every submitted
    /// task runs exactly once.
    pub fn safe_call(self: &Arc<Self>, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
            return;
        }
        {
            let mut pending = self.pending.lock().unwrap();
            pending.push(Box::new(task));
        }
        self.waker.notify();
    }

    fn drain_pending_tasks(&self) {
        // Swap out under the lock, run with the lock released: a task
        // calling safe_call must not deadlock.
        let tasks = {
            let mut pending = self.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }
    }

    // ── Timers ───────────────────────────────────────────────────────

    /// Fire `cb` once after `delay`. Owner thread only.
    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + 'static) -> TimerId {
        self.assert_in_loop_thread("run_after");
        self.timers
            .borrow_mut()
            .insert(Instant::now() + delay, None, Box::new(cb))
    }

    /// Fire `cb` every `interval`, first firing one interval from now.
    /// Owner thread only.
    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + 'static) -> TimerId {
        self.assert_in_loop_thread("run_every");
        self.timers
            .borrow_mut()
            .insert(Instant::now() + interval, Some(interval), Box::new(cb))
    }

    /// Tombstone a timer. Idempotent; a no-op for already-fired ids.
    /// From a non-owning thread the cancellation marshals itself
    /// through `safe_call`; on the owning thread it is immediate, and
    /// the timer will not fire again even within the current pass.
    pub fn cancel_timer(self: &Arc<Self>, id: TimerId) {
        if self.is_in_loop_thread() {
            self.timers.borrow_mut().cancel(id);
        } else {
            let lp = self.clone();
            self.safe_call(move || {
                lp.timers.borrow_mut().cancel(id);
            });
        }
    }

    fn fire_due_timers(&self) {
        let now = Instant::now();
        // Pop first, fire after: a firing callback may insert or cancel
        // timers on this same loop.
        let due = self.timers.borrow_mut().pop_due(now);
        for mut entry in due {
            // An earlier callback in this pass may have cancelled it.
            if self.timers.borrow().is_cancelled(entry.id) {
                self.timers.borrow_mut().finish(entry.id);
                continue;
            }
            (entry.callback)();

            let Some(interval) = entry.interval else {
                self.timers.borrow_mut().finish(entry.id);
                continue;
            };

            // Fixed-phase rescheduling: advance from the previous
            // deadline, not from now, so the long-run phase does not
            // drift. When the loop has fallen behind, catch up within
            // this pass a bounded number of times, then resync.
            let mut deadline = entry.deadline + interval;
            let mut catchups = 0;
            while deadline <= Instant::now()
                && catchups < MAX_PERIODIC_CATCHUP
                && !self.timers.borrow().is_cancelled(entry.id)
            {
                (entry.callback)();
                deadline += interval;
                catchups += 1;
            }
            if self.timers.borrow().is_cancelled(entry.id) {
                self.timers.borrow_mut().finish(entry.id);
                continue;
            }
            if deadline <= Instant::now() {
                deadline = Instant::now() + interval;
            }
            self.timers.borrow_mut().reinsert(entry, deadline);
        }
    }

    // ── Sink table and poller access ─────────────────────────────────

    /// Install the event record for `fd`. Owner thread only.
    pub fn register_sink(&self, fd: RawFd, sink: Rc<dyn EventSink>) {
        self.assert_in_loop_thread("register_sink");
        gtrace!("gev-loop: sink registered for fd {}", fd);
        self.sinks.borrow_mut().insert(fd, sink);
    }

    /// Remove the event record for `fd`. Owner thread only.
    pub fn unregister_sink(&self, fd: RawFd) {
        self.assert_in_loop_thread("unregister_sink");
        gtrace!("gev-loop: sink removed for fd {}", fd);
        self.sinks.borrow_mut().remove(&fd);
    }

    /// Scoped access to the multiplexer for interest updates. Owner
    /// thread only; the borrow must not escape `f`.
    pub fn with_poller<R>(&self, f: impl FnOnce(&mut Poller) -> R) -> R {
        self.assert_in_loop_thread("with_poller");
        f(&mut self.poller.borrow_mut())
    }

    /// Live timer count (for tests and stats).
    pub fn timer_count(&self) -> usize {
        self.assert_in_loop_thread("timer_count");
        self.timers.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_run_after_quit_scenario() {
        let lp = EventLoop::new();
        let lp2 = lp.clone();
        lp.run_after(Duration::from_millis(100), move || lp2.quit());

        let start = Instant::now();
        lp.run();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "quit early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "quit late: {:?}", elapsed);
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let lp = EventLoop::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (label, delay_ms) in [(3u32, 60u64), (1, 20), (2, 40)] {
            let order = order.clone();
            lp.run_after(Duration::from_millis(delay_ms), move || {
                order.borrow_mut().push(label)
            });
        }
        let lp2 = lp.clone();
        lp.run_after(Duration::from_millis(120), move || lp2.quit());
        lp.run();

        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_run_after_fires_no_earlier_than_delay() {
        let lp = EventLoop::new();
        let fired_at = Rc::new(RefCell::new(None));
        let f = fired_at.clone();
        let start = Instant::now();
        lp.run_after(Duration::from_millis(50), move || {
            *f.borrow_mut() = Some(Instant::now())
        });
        let lp2 = lp.clone();
        lp.run_after(Duration::from_millis(120), move || lp2.quit());
        lp.run();

        let fired = fired_at.borrow().expect("timer never fired");
        assert!(fired - start >= Duration::from_millis(50));
    }

    #[test]
    fn test_run_every_bounded_drift() {
        let lp = EventLoop::new();
        let fires = Rc::new(RefCell::new(Vec::new()));
        let f = fires.clone();
        let interval = Duration::from_millis(20);
        let start = Instant::now();
        lp.run_every(interval, move || f.borrow_mut().push(Instant::now()));
        let lp2 = lp.clone();
        lp.run_after(Duration::from_millis(210), move || lp2.quit());
        lp.run();

        let fires = fires.borrow();
        assert!(
            (6..=14).contains(&fires.len()),
            "unexpected fire count {}",
            fires.len()
        );
        // Fixed phase: each firing stays near start + k*interval, with
        // a bound independent of how many periods elapsed.
        for (k, t) in fires.iter().enumerate() {
            let expected = start + interval * (k as u32 + 1);
            let drift = if *t > expected { *t - expected } else { expected - *t };
            assert!(
                drift < Duration::from_millis(100),
                "fire {} drifted {:?}",
                k,
                drift
            );
        }
    }

    #[test]
    fn test_cancel_timer_in_same_pass() {
        let lp = EventLoop::new();
        let fired = Rc::new(Cell::new(false));
        let victim_id = Rc::new(Cell::new(None));

        let lp2 = lp.clone();
        let holder = victim_id.clone();
        lp.run_after(Duration::from_millis(1), move || {
            if let Some(id) = holder.get() {
                lp2.cancel_timer(id);
            }
        });
        let f = fired.clone();
        let id = lp.run_after(Duration::from_millis(2), move || f.set(true));
        victim_id.set(Some(id));

        // Let both deadlines pass so one dispatch handles them together.
        thread::sleep(Duration::from_millis(30));
        lp.dispatch_once();
        assert!(!fired.get(), "cancelled timer fired in the same pass");
    }

    #[test]
    fn test_cancel_periodic_stops_catchup_refires() {
        let lp = EventLoop::new();
        let count = Rc::new(Cell::new(0u32));
        let own_id = Rc::new(Cell::new(None));

        let lp2 = lp.clone();
        let c = count.clone();
        let holder = own_id.clone();
        let id = lp.run_every(Duration::from_millis(5), move || {
            c.set(c.get() + 1);
            if let Some(id) = holder.get() {
                lp2.cancel_timer(id);
            }
        });
        own_id.set(Some(id));

        // Fall far behind: without the cancel check this pass would
        // refire several catch-ups.
        thread::sleep(Duration::from_millis(60));
        lp.dispatch_once();
        assert_eq!(count.get(), 1, "self-cancelled periodic refired");

        // And it never fires again.
        thread::sleep(Duration::from_millis(20));
        lp.dispatch_once();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_cancel_is_idempotent_after_fire() {
        let lp = EventLoop::new();
        let id = lp.run_after(Duration::from_millis(1), || {});
        thread::sleep(Duration::from_millis(10));
        lp.dispatch_once();
        // Fired and gone: cancelling now is a harmless no-op, twice.
        lp.cancel_timer(id);
        lp.cancel_timer(id);
        assert_eq!(lp.timer_count(), 0);
    }

    #[test]
    fn test_periodic_catchup_is_bounded() {
        let lp = EventLoop::new();
        let count = Rc::new(Cell::new(0u32));
        let c = count.clone();
        lp.run_every(Duration::from_millis(2), move || c.set(c.get() + 1));

        // Fall ~25 intervals behind; one pass may catch up at most
        // 1 + MAX_PERIODIC_CATCHUP firings.
        thread::sleep(Duration::from_millis(50));
        lp.dispatch_once();
        let after_first_pass = count.get();
        assert!(after_first_pass >= 1);
        assert!(
            after_first_pass <= 1 + MAX_PERIODIC_CATCHUP,
            "unbounded catch-up: {} fires",
            after_first_pass
        );
    }

    #[test]
    fn test_safe_call_exactly_once_from_many_threads() {
        let lp = EventLoop::new();
        let counter = Arc::new(AtomicUsize::new(0));
        const K: usize = 8;

        let mut handles = Vec::new();
        for _ in 0..K {
            let lp = lp.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                lp.safe_call(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let lp2 = lp.clone();
        lp.run_after(Duration::from_millis(100), move || lp2.quit());
        lp.run();

        assert_eq!(counter.load(Ordering::SeqCst), K);
    }

    #[test]
    fn test_safe_call_runs_inline_on_owner_thread() {
        let lp = EventLoop::new();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        lp.safe_call(move || r.store(true, Ordering::SeqCst));
        // No dispatch needed: it already ran.
        assert!(ran.load(Ordering::SeqCst));
        assert!(lp.pending.lock().unwrap().is_empty());
    }

    #[test]
    fn test_quit_from_other_thread_wakes_blocked_wait() {
        let lp = EventLoop::new();
        let lp2 = lp.clone();
        let start = Instant::now();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            lp2.quit();
        });
        // No timers scheduled: without the waker this wait would block
        // forever.
        lp.run();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(5));
        h.join().unwrap();
    }

    #[test]
    fn test_timer_mutation_off_thread_panics() {
        let lp = EventLoop::new();
        let h = thread::spawn(move || {
            lp.run_after(Duration::from_millis(1), || {});
        });
        assert!(h.join().is_err(), "run_after off-thread must panic");
    }
}
