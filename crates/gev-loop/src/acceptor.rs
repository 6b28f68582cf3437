//! Listening socket and accept loop
//!
//! Registered read-interest on its designated loop; on readiness it
//! accepts until the call would block and hands each new descriptor to
//! the dispatch callback.
//!
//! # Descriptor exhaustion
//!
//! The acceptor keeps one reserved idle descriptor (`/dev/null`) in its
//! pocket. When `accept` fails with EMFILE/ENFILE the reserve is
//! closed, the pending connection accepted and immediately closed, and
//! the reserve reopened: the overflow connection is shed instead of
//! sitting forever in the backlog with the process wedged against its
//! descriptor limit.

use crate::error::{last_errno, Result};
use crate::event_loop::{EventLoop, EventSink, SocketEvent};
use crate::socket::{from_sockaddr_in, Socket};
use gev_core::{gdebug, gerror, ginfo, gwarn};

use std::cell::{Cell, RefCell};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;

/// Receives each accepted descriptor with its peer address. `Send`
/// because the service installs it from the thread that owns the base
/// loop before the loop runs.
pub type AcceptCallback = Box<dyn FnMut(RawFd, SocketAddrV4) + Send>;

pub struct Acceptor {
    lp: Arc<EventLoop>,
    sock: RefCell<Socket>,
    /// Reserved descriptor released to shed connections under EMFILE.
    idle_fd: Cell<RawFd>,
    on_accept: RefCell<Option<AcceptCallback>>,
    listening: Cell<bool>,
}

impl Acceptor {
    /// Bind and listen. The caller treats failure as fatal: a server
    /// cannot usefully proceed without its listening socket.
    pub fn new(
        lp: Arc<EventLoop>,
        addr: SocketAddrV4,
        backlog: i32,
        reuse_addr: bool,
        reuse_port: bool,
    ) -> Result<Rc<Self>> {
        let sock = Socket::bind_listen(addr, backlog, reuse_addr, reuse_port)?;
        Ok(Rc::new(Self {
            lp,
            sock: RefCell::new(sock),
            idle_fd: Cell::new(open_idle_fd()),
            on_accept: RefCell::new(None),
            listening: Cell::new(false),
        }))
    }

    /// Bound address (reads back the ephemeral port after binding 0).
    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        self.sock.borrow().local_addr()
    }

    pub fn set_on_accept(&self, cb: impl FnMut(RawFd, SocketAddrV4) + Send + 'static) {
        *self.on_accept.borrow_mut() = Some(Box::new(cb));
    }

    /// Register with the owning loop and start accepting. Idempotent.
    pub fn listen(self: &Rc<Self>) {
        self.lp.assert_in_loop_thread("Acceptor::listen");
        if self.listening.replace(true) {
            return;
        }
        let fd = self.sock.borrow().fd();
        self.lp.register_sink(fd, self.clone() as Rc<dyn EventSink>);
        self.lp
            .with_poller(|p| self.sock.borrow_mut().enable_read(p))
            .unwrap_or_else(|e| {
                panic!("gev-acceptor: registering listening socket failed: {}", e)
            });
        match self.local_addr() {
            Ok(addr) => ginfo!("gev-acceptor: listening on {}", addr),
            Err(_) => ginfo!("gev-acceptor: listening"),
        }
    }

    /// Accept until the call would block.
    fn handle_readable(&self) {
        loop {
            let listen_fd = self.sock.borrow().fd();
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let fd = unsafe {
                libc::accept4(
                    listen_fd,
                    &mut sin as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd >= 0 {
                let peer = from_sockaddr_in(&sin, len)
                    .unwrap_or_else(|_| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
                gdebug!("gev-acceptor: accepted fd {} from {}", fd, peer);
                let mut cb = self.on_accept.borrow_mut();
                match cb.as_mut() {
                    Some(cb) => cb(fd, peer),
                    None => unsafe {
                        libc::close(fd);
                    },
                }
                continue;
            }
            let errno = last_errno();
            match errno {
                // Transient: retried silently, never surfaced.
                libc::EINTR | libc::ECONNABORTED => continue,
                libc::EAGAIN => break,
                libc::EMFILE | libc::ENFILE => {
                    self.shed_connection();
                    continue;
                }
                _ => {
                    gerror!("gev-acceptor: accept failed: errno {}", errno);
                    break;
                }
            }
        }
    }

    /// Out of descriptors: free the reserve, accept the pending
    /// connection, close it immediately, take the reserve back.
    fn shed_connection(&self) {
        let idle = self.idle_fd.get();
        if idle >= 0 {
            unsafe {
                libc::close(idle);
            }
            self.idle_fd.set(-1);
        }
        let listen_fd = self.sock.borrow().fd();
        let fd = unsafe {
            libc::accept4(
                listen_fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        };
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
            gwarn!("gev-acceptor: out of descriptors, shed one pending connection");
        }
        self.idle_fd.set(open_idle_fd());
    }
}

impl EventSink for Acceptor {
    fn on_event(self: Rc<Self>, event: SocketEvent) {
        match event {
            SocketEvent::Readable => self.handle_readable(),
            // A listening socket only reports read-readiness; anything
            // else is noise worth logging.
            other => gwarn!("gev-acceptor: unexpected event {:?}", other),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let idle = self.idle_fd.get();
        if idle >= 0 {
            unsafe {
                libc::close(idle);
            }
        }
    }
}

fn open_idle_fd() -> RawFd {
    unsafe {
        libc::open(
            b"/dev/null\0".as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    }
}
