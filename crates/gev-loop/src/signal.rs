//! Process-wide signal disposition
//!
//! A server writing to a peer that closed first must see EPIPE from the
//! send, not die from SIGPIPE. Installed once, from the first
//! `EventLoop` constructed.

use nix::sys::signal::{signal, SigHandler, Signal};

use std::sync::atomic::{AtomicBool, Ordering};

static SIGPIPE_IGNORED: AtomicBool = AtomicBool::new(false);

/// Ignore SIGPIPE for the whole process. Idempotent.
pub fn ignore_sigpipe() {
    if SIGPIPE_IGNORED.swap(true, Ordering::SeqCst) {
        return; // Already installed
    }
    // Safety: SigIgn carries no handler code into signal context.
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_sigpipe_idempotent() {
        ignore_sigpipe();
        ignore_sigpipe();
        assert!(SIGPIPE_IGNORED.load(Ordering::SeqCst));
    }
}
