//! Non-blocking socket wrapper
//!
//! Owns the descriptor, its current interest mask, and the two staging
//! buffers: `rx` for bytes received but not yet consumed by the owner's
//! read callback, `tx` for bytes the kernel would not take
//! synchronously.
//!
//! # Draining under edge-triggered readiness
//!
//! `receive_into_buffer` queries the exact number of bytes queued on
//! the socket (`FIONREAD`), then issues a single receive sized to that
//! count. No would-block retry loop, no starvation of other ready
//! descriptors, and still correct under edge-triggered semantics: bytes
//! arriving after the query produce a fresh readiness edge.
//!
//! **Precondition**: one reader per descriptor. Never register the same
//! fd with two multiplexers, never receive from two threads. The byte
//! count query is only meaningful when nobody else can consume those
//! bytes between the query and the receive.

use crate::error::{last_errno, LoopError, Result};
use crate::poller::{Interest, Poller};
use gev_core::{gwarn, Buffer};

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

/// Outcome of one `receive_into_buffer` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// Bytes appended to the receive buffer.
    Received(usize),
    /// Zero-length read or unrecoverable error: the peer is gone. The
    /// owner must surface its close notification exactly once.
    Closed,
    /// Transient condition (interrupted, spurious edge); try again on
    /// the next readiness event.
    Retry,
}

/// Outcome of a `write` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Everything left synchronously; nothing is pending.
    Flushed,
    /// A remainder sits in the send buffer; the owner must arm
    /// write-interest to resume when the socket drains.
    Buffered,
}

/// Outcome of a `flush` call against the send buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Send buffer is empty.
    Drained,
    /// Socket stopped accepting bytes; write-interest stays armed.
    Partial,
    /// Unrecoverable send error (peer reset, broken pipe).
    Failed(i32),
}

/// Non-blocking descriptor with staging buffers and an interest mask.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
    interest: Interest,
    rx: Buffer,
    tx: Buffer,
}

impl Socket {
    /// Fresh non-blocking TCP socket.
    pub fn new_stream() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(LoopError::last_os());
        }
        Ok(Self::from_fd(fd))
    }

    /// Adopt a descriptor that is already non-blocking (an `accept4`
    /// result, or a test socketpair after `set_nonblocking`).
    pub fn from_fd(fd: RawFd) -> Self {
        Self {
            fd,
            interest: Interest::NONE,
            rx: Buffer::with_capacity(Buffer::INITIAL_CAPACITY),
            tx: Buffer::with_capacity(Buffer::INITIAL_CAPACITY),
        }
    }

    /// Create, configure, bind and listen. Used by the acceptor; a
    /// server cannot proceed without its listening socket, so callers
    /// treat failure here as fatal.
    pub fn bind_listen(
        addr: SocketAddrV4,
        backlog: i32,
        reuse_addr: bool,
        reuse_port: bool,
    ) -> Result<Self> {
        let sock = Self::new_stream()?;
        if reuse_addr {
            sock.set_reuse_addr(true)?;
        }
        if reuse_port {
            sock.set_reuse_port(true)?;
        }

        let sin = to_sockaddr_in(&addr);
        let ret = unsafe {
            libc::bind(
                sock.fd,
                &sin as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(LoopError::last_os());
        }

        let ret = unsafe { libc::listen(sock.fd, backlog) };
        if ret != 0 {
            return Err(LoopError::last_os());
        }
        Ok(sock)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn interest(&self) -> Interest {
        self.interest
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.interest.writes()
    }

    // ── Option setters ───────────────────────────────────────────────

    pub fn set_reuse_addr(&self, on: bool) -> Result<()> {
        self.set_sockopt_bool(libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub fn set_reuse_port(&self, on: bool) -> Result<()> {
        self.set_sockopt_bool(libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    /// Disable Nagle's algorithm.
    pub fn set_nodelay(&self, on: bool) -> Result<()> {
        self.set_sockopt_bool(libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    pub fn set_keepalive(&self, on: bool) -> Result<()> {
        self.set_sockopt_bool(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    pub fn set_nonblocking(&self) -> Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(LoopError::last_os());
        }
        let ret = unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(LoopError::last_os());
        }
        Ok(())
    }

    fn set_sockopt_bool(&self, level: i32, name: i32, on: bool) -> Result<()> {
        let opt: libc::c_int = on as libc::c_int;
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                &opt as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(LoopError::last_os());
        }
        Ok(())
    }

    // ── Interest updates through the multiplexer ─────────────────────

    pub fn enable_read(&mut self, poller: &mut Poller) -> Result<()> {
        self.update_interest(poller, self.interest.with(Interest::READ))
    }

    pub fn enable_write(&mut self, poller: &mut Poller) -> Result<()> {
        self.update_interest(poller, self.interest.with(Interest::WRITE))
    }

    pub fn disable_write(&mut self, poller: &mut Poller) -> Result<()> {
        self.update_interest(poller, self.interest.without(Interest::WRITE))
    }

    pub fn disable_all(&mut self, poller: &mut Poller) -> Result<()> {
        self.update_interest(poller, Interest::NONE)
    }

    fn update_interest(&mut self, poller: &mut Poller, new: Interest) -> Result<()> {
        if new == self.interest {
            return Ok(());
        }
        poller.register_or_update(self.fd, self.interest, new)?;
        self.interest = new;
        Ok(())
    }

    // ── I/O primitives ───────────────────────────────────────────────

    /// Bytes currently queued on the socket, per the kernel.
    pub fn bytes_queued(&self) -> usize {
        let mut n: libc::c_int = 0;
        let ret = unsafe { libc::ioctl(self.fd, libc::FIONREAD, &mut n) };
        if ret < 0 {
            return 0;
        }
        n.max(0) as usize
    }

    /// Receive into the rx buffer: query the queued byte count, then
    /// one receive of exactly that count.
    pub fn receive_into_buffer(&mut self) -> RecvOutcome {
        let queued = self.bytes_queued();
        if queued == 0 {
            // Readable with nothing queued: either the peer closed or
            // the edge was spurious. A one-byte probe settles it
            // without blocking.
            let mut probe = [0u8; 1];
            let n = recv_retry_eintr(self.fd, &mut probe);
            return match n {
                0 => RecvOutcome::Closed,
                1 => {
                    // A byte landed between the query and the probe; it
                    // is covered here, the rest by the next edge.
                    self.rx.append(&probe);
                    RecvOutcome::Received(1)
                }
                _ => {
                    let errno = last_errno();
                    if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                        RecvOutcome::Retry
                    } else {
                        gwarn!("gev-socket: recv probe on fd {}: errno {}", self.fd, errno);
                        RecvOutcome::Closed
                    }
                }
            };
        }

        let fd = self.fd;
        let mut res: isize = 0;
        self.rx.append_with(queued, |dst| {
            res = recv_retry_eintr(fd, dst);
            if res > 0 {
                res as usize
            } else {
                0
            }
        });
        match res {
            n if n > 0 => RecvOutcome::Received(n as usize),
            0 => RecvOutcome::Closed,
            _ => {
                let errno = last_errno();
                if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                    RecvOutcome::Retry
                } else {
                    gwarn!("gev-socket: recv on fd {}: errno {}", self.fd, errno);
                    RecvOutcome::Closed
                }
            }
        }
    }

    /// Send `bytes`, preserving submission order against anything
    /// already staged.
    ///
    /// With an empty send buffer this attempts an immediate synchronous
    /// send and stages only the remainder. With a non-empty send buffer
    /// the bytes are staged outright; sending them now would jump the
    /// queue.
    pub fn write(&mut self, bytes: &[u8]) -> WriteOutcome {
        if bytes.is_empty() {
            return if self.tx.is_empty() {
                WriteOutcome::Flushed
            } else {
                WriteOutcome::Buffered
            };
        }
        if !self.tx.is_empty() {
            self.tx.append(bytes);
            return WriteOutcome::Buffered;
        }

        let mut sent = 0usize;
        while sent < bytes.len() {
            let n = unsafe {
                libc::send(
                    self.fd,
                    bytes[sent..].as_ptr() as *const libc::c_void,
                    bytes.len() - sent,
                    libc::MSG_NOSIGNAL,
                )
            };
            if n > 0 {
                sent += n as usize;
                continue;
            }
            let errno = last_errno();
            match errno {
                libc::EINTR => continue,
                libc::EAGAIN => break,
                _ => {
                    // The failure itself surfaces through the readiness
                    // path (hangup/error event); stage the remainder so
                    // ordering holds if the peer somehow recovers.
                    gwarn!("gev-socket: send on fd {}: errno {}", self.fd, errno);
                    break;
                }
            }
        }

        if sent == bytes.len() {
            WriteOutcome::Flushed
        } else {
            self.tx.append(&bytes[sent..]);
            WriteOutcome::Buffered
        }
    }

    /// Push staged send-buffer bytes at the socket until it drains or
    /// stops accepting.
    pub fn flush(&mut self) -> FlushOutcome {
        while !self.tx.is_empty() {
            let readable = self.tx.readable();
            let n = unsafe {
                libc::send(
                    self.fd,
                    readable.as_ptr() as *const libc::c_void,
                    readable.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n > 0 {
                self.tx.consume(n as usize);
                continue;
            }
            let errno = last_errno();
            match errno {
                libc::EINTR => continue,
                libc::EAGAIN => return FlushOutcome::Partial,
                _ => return FlushOutcome::Failed(errno),
            }
        }
        FlushOutcome::Drained
    }

    // ── Buffer access ────────────────────────────────────────────────

    /// Readable bytes staged in the receive buffer.
    #[inline]
    pub fn rx_len(&self) -> usize {
        self.rx.len()
    }

    /// Bytes staged in the send buffer.
    #[inline]
    pub fn tx_len(&self) -> usize {
        self.tx.len()
    }

    #[inline]
    pub fn tx_is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Move the receive buffer out so its owner can run a callback
    /// against it without holding a borrow on the socket. Pair with
    /// `restore_rx`.
    pub fn take_rx(&mut self) -> Buffer {
        std::mem::take(&mut self.rx)
    }

    pub fn restore_rx(&mut self, rx: Buffer) {
        self.rx = rx;
    }

    // ── Address readers ──────────────────────────────────────────────

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(self.fd, &mut sin as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret != 0 {
            return Err(LoopError::last_os());
        }
        from_sockaddr_in(&sin, len)
    }

    pub fn peer_addr(&self) -> Result<SocketAddrV4> {
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::getpeername(self.fd, &mut sin as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret != 0 {
            return Err(LoopError::last_os());
        }
        from_sockaddr_in(&sin, len)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// One recv, retrying only on EINTR so an interrupted call cannot eat
/// an edge-triggered notification.
fn recv_retry_eintr(fd: RawFd, dst: &mut [u8]) -> isize {
    loop {
        let n = unsafe { libc::recv(fd, dst.as_mut_ptr() as *mut libc::c_void, dst.len(), 0) };
        if n < 0 && last_errno() == libc::EINTR {
            continue;
        }
        return n;
    }
}

pub(crate) fn to_sockaddr_in(addr: &SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    // octets() is big-endian; storing as-is yields network byte order.
    sin.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
    sin
}

pub(crate) fn from_sockaddr_in(
    sin: &libc::sockaddr_in,
    len: libc::socklen_t,
) -> Result<SocketAddrV4> {
    if len < std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        || sin.sin_family != libc::AF_INET as libc::sa_family_t
    {
        return Err(LoopError::BadAddress);
    }
    let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
    Ok(SocketAddrV4::new(ip, u16::from_be(sin.sin_port)))
}
