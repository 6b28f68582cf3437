//! # gev - a reactor-pattern networking core
//!
//! A from-scratch readiness reactor: an edge-triggered multiplexer
//! wrapped in an event loop, non-blocking sockets with elastic staging
//! buffers, cross-thread task and timer dispatch, and an accept layer
//! that fans one listening socket out over a pool of loop-owning worker
//! threads.
//!
//! ## Quick Start
//!
//! ```ignore
//! use gev::{EventLoop, Service, ServiceConfig};
//! use std::net::Ipv4Addr;
//!
//! fn main() {
//!     let lp = EventLoop::new();
//!     let service = Service::new(lp.clone(), ServiceConfig::new(Ipv4Addr::UNSPECIFIED, 7000));
//!
//!     service.on_connect(|conn| {
//!         // Echo everything back, in arrival order.
//!         conn.on_read(|conn, buf| {
//!             let bytes = buf.drain_all();
//!             conn.send(&bytes);
//!         });
//!     });
//!
//!     service.start(4); // four worker loops
//!     lp.run();         // the base loop accepts and distributes
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        User Code                            │
//! │       on_connect / on_read / send / run_after / safe_call   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Service                             │
//! │      accept loop, round-robin hand-off via safe_call        │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │ EventLoop │      │ EventLoop │      │ EventLoop │
//!    │ worker 0  │      │ worker 1  │      │ worker N  │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │         Poller (epoll, edge-triggered) + Timers         │
//!    │    Socket rx/tx staging, eventfd wakeup, sink table     │
//!    └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading model
//!
//! One `EventLoop` per OS thread. I/O callbacks, timer callbacks, and
//! cross-thread tasks for a loop all run serialized on that loop's
//! thread, so loop-owned state needs no locking. The only way another
//! thread may touch a loop is `safe_call` and `quit`.

pub use gev_core::{env_get, env_get_bool, Buffer, ConnId, Drained, LogLevel, TimerId};
pub use gev_core::{gdebug, gerror, ginfo, gtrace, gwarn};

pub use gev_loop::{
    Acceptor, ConnState, Connection, EventLoop, EventSink, Interest, LoopError, PollEvent,
    Poller, Readiness, RecvOutcome, Service, ServiceConfig, Socket, SocketEvent, TimerQueue,
    Waker, WriteOutcome,
};

/// Crate version, from the workspace manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facade_reexports_compose() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        assert_eq!(buf.len(), 3);
        assert_eq!(TimerId(5).raw(), 5);
        assert!(!VERSION.is_empty());
    }
}
