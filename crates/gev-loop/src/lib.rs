//! # gev-loop
//!
//! Platform-specific reactor runtime for gev.
//!
//! This crate provides:
//! - Readiness multiplexing (epoll, edge-triggered)
//! - Non-blocking socket wrapper with elastic receive/send staging
//! - Per-loop timer queue with lazy cancellation
//! - The event loop itself: I/O dispatch, cross-thread tasks, timers
//! - Connection lifecycle and outbound queue management
//! - Accept/distribution across a pool of loop-owning worker threads
//!
//! One `EventLoop` per OS thread; everything a loop owns is mutated
//! only on that loop's thread. Other threads reach a loop exclusively
//! through `safe_call`, `quit`, and the eventfd waker behind them.

#![allow(dead_code)]

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod poller;
pub mod service;
pub mod signal;
pub mod socket;
pub mod timer;
pub mod waker;

// Re-exports
pub use acceptor::Acceptor;
pub use config::ServiceConfig;
pub use connection::{ConnState, Connection};
pub use error::{LoopError, Result};
pub use event_loop::{EventLoop, EventSink, SocketEvent};
pub use poller::{Interest, PollEvent, Poller, Readiness};
pub use service::Service;
pub use socket::{RecvOutcome, Socket, WriteOutcome};
pub use timer::TimerQueue;
pub use waker::Waker;

// The readiness facility, FIONREAD draining, eventfd wakeups, and
// accept4 are all Linux-specific in this implementation.
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        // ok
    } else {
        compile_error!("gev-loop currently supports Linux only (epoll/eventfd)");
    }
}
