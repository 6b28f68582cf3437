//! Eventfd-backed loop wakeup channel
//!
//! The only purpose of this descriptor is to force a blocked
//! multiplexer wait to return so the loop can drain its pending task
//! list. Multiple `notify()` calls before the loop reads the counter
//! coalesce into a single wakeup (eventfd counter semantics), which is
//! exactly what we want: one pass drains every queued task.

use crate::error::{last_errno, LoopError, Result};
use gev_core::gwarn;

use std::os::unix::io::RawFd;

pub struct Waker {
    fd: RawFd,
}

impl Waker {
    /// Create a fresh eventfd. The waker owns the descriptor and closes
    /// it on drop.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(LoopError::last_os());
        }
        Ok(Self { fd })
    }

    /// The raw descriptor, registered read-interest with the loop's
    /// poller.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Signal the owning loop. Safe from any thread.
    pub fn notify(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = last_errno();
            // EAGAIN means the counter is saturated, so a wakeup is
            // already pending. Anything else is worth hearing about.
            if errno != libc::EAGAIN {
                gwarn!("gev-waker: write failed: errno {}", errno);
            }
        }
    }

    /// Reset the counter after a wakeup. Owner thread only.
    ///
    /// A full read zeroes the eventfd, so the next `notify()` is a
    /// fresh edge for the edge-triggered poller.
    pub fn drain(&self) {
        drain_eventfd(self.fd);
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Read an eventfd counter down to zero. EAGAIN (already zero) is fine.
pub(crate) fn drain_eventfd(fd: RawFd) {
    let mut val: u64 = 0;
    let ret = unsafe {
        libc::read(
            fd,
            &mut val as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if ret < 0 {
        let errno = last_errno();
        if errno != libc::EAGAIN {
            gwarn!("gev-waker: read failed: errno {}", errno);
        }
    }
}
