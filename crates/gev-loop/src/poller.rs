//! Readiness multiplexer over epoll, edge-triggered
//!
//! Every registration carries `EPOLLET`: a readiness notification
//! reports a transition, not a level, so the consumer must fully drain
//! what is available or risk never hearing about it again. The draining
//! strategy lives in `Socket::receive_into_buffer` (query exact queued
//! bytes, one sized receive); the poller itself only reports.
//!
//! The opaque per-descriptor key handed to the kernel is the raw fd
//! itself. The loop resolves it through its own sink table, so there is
//! never a heap address in kernel-owned memory that could dangle.

use crate::error::{last_errno, LoopError, Result};
use gev_core::gerror;

use std::os::unix::io::RawFd;
use std::time::Duration;

/// Interest mask for one descriptor: none, read, write, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);

    #[inline]
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn reads(&self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    #[inline]
    pub fn writes(&self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    #[inline]
    pub fn with(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    #[inline]
    pub fn without(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    fn to_epoll(self) -> u32 {
        let mut bits = 0u32;
        if self.reads() {
            bits |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
        }
        if self.writes() {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }
}

/// Readiness bits reported by the kernel for one descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Readiness(u32);

impl Readiness {
    #[inline]
    pub fn readable(&self) -> bool {
        self.0 & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0
    }

    #[inline]
    pub fn writable(&self) -> bool {
        self.0 & libc::EPOLLOUT as u32 != 0
    }

    #[inline]
    pub fn hangup(&self) -> bool {
        self.0 & libc::EPOLLHUP as u32 != 0
    }

    #[inline]
    pub fn error(&self) -> bool {
        self.0 & libc::EPOLLERR as u32 != 0
    }
}

/// One ready descriptor out of a `wait` call.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub fd: RawFd,
    pub readiness: Readiness,
}

/// Edge-triggered epoll wrapper.
pub struct Poller {
    epfd: RawFd,
    /// Scratch for epoll_wait; doubled when a wait fills it.
    events: Vec<libc::epoll_event>,
}

const INITIAL_EVENT_CAPACITY: usize = 64;

impl Poller {
    /// Create the epoll instance. Failure here is a setup failure; the
    /// caller aborts with a diagnostic.
    pub fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(LoopError::last_os());
        }
        Ok(Self {
            epfd,
            events: vec![unsafe { std::mem::zeroed() }; INITIAL_EVENT_CAPACITY],
        })
    }

    /// Bring the kernel's view of `fd` from `old` to `new` interest.
    ///
    /// ADD/MOD/DEL is derived from which side of the transition is
    /// empty. `(NONE, NONE)` is a no-op.
    pub fn register_or_update(&mut self, fd: RawFd, old: Interest, new: Interest) -> Result<()> {
        let op = match (old.is_none(), new.is_none()) {
            (true, true) => return Ok(()),
            (true, false) => libc::EPOLL_CTL_ADD,
            (false, false) => libc::EPOLL_CTL_MOD,
            (false, true) => libc::EPOLL_CTL_DEL,
        };
        let mut ev = libc::epoll_event {
            events: new.to_epoll() | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            let errno = last_errno();
            return Err(match errno {
                libc::EEXIST => LoopError::AlreadyRegistered(fd),
                libc::ENOENT => LoopError::NotRegistered(fd),
                e => LoopError::Os(e),
            });
        }
        Ok(())
    }

    /// Wait for readiness, up to `timeout` (`None` blocks indefinitely).
    ///
    /// Interrupted waits are retried transparently. Any other wait
    /// failure is logged and reported as no events; the loop carries on.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Vec<PollEvent> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => duration_to_ms_ceil(d),
        };

        let n = loop {
            let ret = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    self.events.as_mut_ptr(),
                    self.events.len() as i32,
                    timeout_ms,
                )
            };
            if ret >= 0 {
                break ret as usize;
            }
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            gerror!("gev-poller: epoll_wait failed: errno {}", errno);
            break 0;
        };

        let mut out = Vec::with_capacity(n);
        for ev in &self.events[..n] {
            out.push(PollEvent {
                fd: ev.u64 as RawFd,
                readiness: Readiness(ev.events),
            });
        }

        // A full scratch buffer means there may be more ready fds than
        // we could report; give the next wait more room.
        if n == self.events.len() {
            let new_len = self.events.len() * 2;
            self.events.resize(new_len, unsafe { std::mem::zeroed() });
        }

        out
    }

    /// The epoll descriptor (for logging).
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

/// Round a duration up to whole milliseconds for epoll_wait, so a timer
/// never fires early because of truncation.
fn duration_to_ms_ceil(d: Duration) -> i32 {
    let ms = d.as_millis();
    let rounded = if d > Duration::from_millis(ms as u64) {
        ms + 1
    } else {
        ms
    };
    rounded.min(i32::MAX as u128) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_nonblocking() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_interest_combinators() {
        let both = Interest::READ.with(Interest::WRITE);
        assert!(both.reads() && both.writes());
        assert!(both.without(Interest::WRITE).reads());
        assert!(!both.without(Interest::WRITE).writes());
        assert!(Interest::NONE.is_none());
    }

    #[test]
    fn test_wait_times_out_empty() {
        let mut poller = Poller::new().unwrap();
        let start = std::time::Instant::now();
        let events = poller.wait(Some(Duration::from_millis(20)));
        assert!(events.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_register_and_readable_event() {
        let mut poller = Poller::new().unwrap();
        let (rd, wr) = pipe_nonblocking();

        poller
            .register_or_update(rd, Interest::NONE, Interest::READ)
            .unwrap();

        // Nothing written yet: no event.
        assert!(poller.wait(Some(Duration::from_millis(10))).is_empty());

        let n = unsafe { libc::write(wr, b"x".as_ptr() as *const _, 1) };
        assert_eq!(n, 1);

        let events = poller.wait(Some(Duration::from_millis(500)));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, rd);
        assert!(events[0].readiness.readable());

        poller
            .register_or_update(rd, Interest::READ, Interest::NONE)
            .unwrap();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_update_rejects_unknown_fd() {
        let mut poller = Poller::new().unwrap();
        let (rd, wr) = pipe_nonblocking();
        // MOD without a prior ADD.
        let err = poller
            .register_or_update(rd, Interest::READ, Interest::WRITE)
            .unwrap_err();
        assert_eq!(err, LoopError::NotRegistered(rd));
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_edge_triggered_reports_transition_once() {
        let mut poller = Poller::new().unwrap();
        let (rd, wr) = pipe_nonblocking();
        poller
            .register_or_update(rd, Interest::NONE, Interest::READ)
            .unwrap();

        let n = unsafe { libc::write(wr, b"abc".as_ptr() as *const _, 3) };
        assert_eq!(n, 3);

        assert_eq!(poller.wait(Some(Duration::from_millis(500))).len(), 1);
        // Data left undrained: the edge already fired, no new report.
        assert!(poller.wait(Some(Duration::from_millis(30))).is_empty());

        // New bytes arrive: a new edge.
        let n = unsafe { libc::write(wr, b"d".as_ptr() as *const _, 1) };
        assert_eq!(n, 1);
        assert_eq!(poller.wait(Some(Duration::from_millis(500))).len(), 1);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
