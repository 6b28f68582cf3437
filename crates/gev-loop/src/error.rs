//! gev-loop error types.

use std::fmt;
use std::os::unix::io::RawFd;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopError {
    /// OS error with errno.
    Os(i32),
    /// Descriptor already registered with this multiplexer.
    AlreadyRegistered(RawFd),
    /// Descriptor not registered with this multiplexer.
    NotRegistered(RawFd),
    /// Operation attempted from a thread that does not own the loop.
    WrongThread,
    /// Address could not be expressed (non-IPv4 peer, truncated sockaddr).
    BadAddress,
}

impl LoopError {
    /// Capture the current errno as an `Os` error.
    #[inline]
    pub(crate) fn last_os() -> Self {
        LoopError::Os(last_errno())
    }
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Os(e) => write!(f, "OS error: errno {}", e),
            Self::AlreadyRegistered(fd) => write!(f, "fd {} already registered", fd),
            Self::NotRegistered(fd) => write!(f, "fd {} not registered", fd),
            Self::WrongThread => write!(f, "called from non-owning thread"),
            Self::BadAddress => write!(f, "address not representable"),
        }
    }
}

impl std::error::Error for LoopError {}

pub type Result<T> = std::result::Result<T, LoopError>;

/// Read the calling thread's errno.
#[inline]
pub(crate) fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}
