//! Service configuration
//!
//! Explicit configuration passed into constructors; nothing in gev
//! reads global dispatch tables or hidden singletons, so lifetime and
//! ownership stay visible at the call site.

use gev_core::env::env_get;

use std::net::{Ipv4Addr, SocketAddrV4};

/// Configuration for a `Service`.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// IPv4 address to bind.
    pub ip: Ipv4Addr,

    /// Port to bind (0 picks an ephemeral port).
    pub port: u16,

    /// Listen backlog.
    pub backlog: i32,

    /// SO_REUSEADDR on the listening socket.
    pub reuse_addr: bool,

    /// SO_REUSEPORT on the listening socket.
    pub reuse_port: bool,

    /// TCP_NODELAY on accepted sockets.
    pub nodelay: bool,

    /// SO_KEEPALIVE on accepted sockets.
    pub keepalive: bool,
}

impl ServiceConfig {
    /// Configuration with defaults for everything but the bind address.
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            ip,
            port,
            backlog: 4096,
            reuse_addr: true,
            reuse_port: false,
            nodelay: true,
            keepalive: false,
        }
    }

    /// Set the listen backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    /// Toggle SO_REUSEADDR.
    pub fn reuse_addr(mut self, on: bool) -> Self {
        self.reuse_addr = on;
        self
    }

    /// Toggle SO_REUSEPORT.
    pub fn reuse_port(mut self, on: bool) -> Self {
        self.reuse_port = on;
        self
    }

    /// Toggle TCP_NODELAY on accepted sockets.
    pub fn nodelay(mut self, on: bool) -> Self {
        self.nodelay = on;
        self
    }

    /// Toggle SO_KEEPALIVE on accepted sockets.
    pub fn keepalive(mut self, on: bool) -> Self {
        self.keepalive = on;
        self
    }

    /// The configured bind address.
    pub fn bind_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }

    /// Worker count for `Service::start`: `GEV_WORKERS` if set,
    /// otherwise the CPU count.
    pub fn default_workers() -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        env_get("GEV_WORKERS", cpus)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, 0)
    }
}
