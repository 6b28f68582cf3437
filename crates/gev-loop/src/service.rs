//! Connection-accept and distribution service
//!
//! A `Service` turns one listening socket into a pool of loop-owning
//! worker threads. The workers start first, each constructing and
//! running its own `EventLoop`; then the acceptor registers on the base
//! loop and every accepted descriptor hops to the next worker in
//! round-robin order through `safe_call`. `Connection` construction and
//! multiplexer registration therefore always execute on the owning
//! loop's own thread, and all subsequent I/O for that connection stays
//! there.
//!
//! With zero workers the base loop itself serves the connections.

use crate::acceptor::Acceptor;
use crate::config::ServiceConfig;
use crate::connection::{ConnState, Connection};
use crate::event_loop::EventLoop;
use crate::socket::Socket;
use gev_core::{gdebug, ginfo, gwarn};

use std::cell::{Cell, RefCell};
use std::net::SocketAddrV4;
use std::rc::Rc;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Invoked on the owning loop's thread for every established
/// connection. Shared across worker threads, hence `Send + Sync`.
pub type ConnectCallback = Arc<dyn Fn(&Rc<Connection>) + Send + Sync>;

struct Worker {
    lp: Arc<EventLoop>,
    handle: JoinHandle<()>,
}

pub struct Service {
    base: Arc<EventLoop>,
    config: ServiceConfig,
    acceptor: Rc<Acceptor>,
    workers: RefCell<Vec<Worker>>,
    on_connect: RefCell<Option<ConnectCallback>>,
    /// Round-robin cursor. Mutated from the accepting thread only, but
    /// read from others during shutdown.
    next_loop: Arc<Mutex<usize>>,
    /// Live connections per target loop, in worker start order (one
    /// entry for the base loop when there are no workers).
    live: Arc<Mutex<Vec<usize>>>,
    started: Cell<bool>,
}

impl Service {
    /// Bind and listen per `config`. A server cannot usefully proceed
    /// without its listening socket, so failure here is fatal.
    pub fn new(base: Arc<EventLoop>, config: ServiceConfig) -> Rc<Self> {
        let acceptor = Acceptor::new(
            base.clone(),
            config.bind_addr(),
            config.backlog,
            config.reuse_addr,
            config.reuse_port,
        )
        .unwrap_or_else(|e| {
            panic!(
                "gev-service: bind/listen on {} failed: {}",
                config.bind_addr(),
                e
            )
        });
        Rc::new(Self {
            base,
            config,
            acceptor,
            workers: RefCell::new(Vec::new()),
            on_connect: RefCell::new(None),
            next_loop: Arc::new(Mutex::new(0)),
            live: Arc::new(Mutex::new(Vec::new())),
            started: Cell::new(false),
        })
    }

    /// Bound address (reads back the ephemeral port after binding 0).
    pub fn local_addr(&self) -> crate::error::Result<SocketAddrV4> {
        self.acceptor.local_addr()
    }

    /// Install the new-connection callback. Must be installed before
    /// `start`; the dispatch path captures it once at startup.
    pub fn on_connect(&self, cb: impl Fn(&Rc<Connection>) + Send + Sync + 'static) {
        *self.on_connect.borrow_mut() = Some(Arc::new(cb));
    }

    /// Start `worker_count` loop-owning threads, then begin accepting.
    /// Base-loop thread only; idempotent.
    pub fn start(&self, worker_count: usize) {
        self.base.assert_in_loop_thread("Service::start");
        if self.started.replace(true) {
            return;
        }

        let mut loops: Vec<Arc<EventLoop>> = Vec::with_capacity(worker_count.max(1));
        {
            let mut workers = self.workers.borrow_mut();
            for i in 0..worker_count {
                let (tx, rx) = mpsc::channel();
                let handle = thread::Builder::new()
                    .name(format!("gev-worker-{}", i))
                    .spawn(move || {
                        let lp = EventLoop::new();
                        // The handle must reach the dispatcher before
                        // this loop parks in its first wait.
                        let _ = tx.send(lp.clone());
                        lp.run();
                    })
                    .unwrap_or_else(|e| {
                        panic!("gev-service: spawning worker {} failed: {}", i, e)
                    });
                let lp = rx
                    .recv()
                    .unwrap_or_else(|_| panic!("gev-service: worker {} died during startup", i));
                loops.push(lp.clone());
                workers.push(Worker { lp, handle });
            }
        }
        if loops.is_empty() {
            loops.push(self.base.clone());
        }
        *self.live.lock().unwrap() = vec![0; loops.len()];

        let on_connect = self.on_connect.borrow().clone();
        let next_loop = self.next_loop.clone();
        let live = self.live.clone();
        let nodelay = self.config.nodelay;
        let keepalive = self.config.keepalive;

        self.acceptor.set_on_accept(move |fd, peer| {
            let idx = {
                let mut cursor = next_loop.lock().unwrap();
                let idx = *cursor;
                *cursor = (*cursor + 1) % loops.len();
                idx
            };
            let lp = loops[idx].clone();
            let target = lp.clone();
            let on_connect = on_connect.clone();
            let live = live.clone();
            lp.safe_call(move || {
                let sock = Socket::from_fd(fd);
                if nodelay {
                    if let Err(e) = sock.set_nodelay(true) {
                        gwarn!("gev-service: nodelay on fd {}: {}", fd, e);
                    }
                }
                if keepalive {
                    if let Err(e) = sock.set_keepalive(true) {
                        gwarn!("gev-service: keepalive on fd {}: {}", fd, e);
                    }
                }
                let conn = Connection::new(target, sock, peer);
                live.lock().unwrap()[idx] += 1;
                {
                    let live = live.clone();
                    conn.set_cleanup(move |_| {
                        live.lock().unwrap()[idx] -= 1;
                    });
                }
                conn.established();
                // Registration failure closes the connection before the
                // user ever hears about it.
                if conn.state() != ConnState::Connected {
                    return;
                }
                if let Some(cb) = &on_connect {
                    cb(&conn);
                }
            });
        });
        self.acceptor.listen();
        ginfo!(
            "gev-service: accepting with {} worker loop(s)",
            self.workers.borrow().len().max(1)
        );
    }

    /// Quit every worker loop and join its thread. Base-loop thread
    /// only; idempotent.
    pub fn stop(&self) {
        let mut workers = self.workers.borrow_mut();
        if workers.is_empty() {
            return;
        }
        gdebug!("gev-service: stopping {} workers", workers.len());
        for w in workers.iter() {
            w.lp.quit();
        }
        for w in workers.drain(..) {
            let _ = w.handle.join();
        }
    }

    /// Number of started worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.borrow().len()
    }

    /// Live connections per target loop, in worker start order.
    pub fn live_counts(&self) -> Vec<usize> {
        self.live.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn localhost_service(lp: &Arc<EventLoop>) -> Rc<Service> {
        Service::new(lp.clone(), ServiceConfig::new(Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn test_echo_through_worker_pool() {
        let lp = EventLoop::new();
        let service = localhost_service(&lp);
        service.on_connect(|conn| {
            conn.on_read(|conn, buf| {
                let bytes = buf.drain_all();
                conn.send(&bytes);
            });
        });
        service.start(2);
        assert_eq!(service.worker_count(), 2);
        let addr = service.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        let lp2 = lp.clone();
        lp.run_after(Duration::from_millis(500), move || lp2.quit());
        lp.run();

        assert_eq!(&client.join().unwrap(), b"ping");
        service.stop();
    }

    #[test]
    fn test_round_robin_distribution() {
        let lp = EventLoop::new();
        let service = localhost_service(&lp);
        service.start(3);
        let addr = service.local_addr().unwrap();

        // Twelve connections held open while the counts are read.
        let clients = thread::spawn(move || {
            let streams: Vec<_> = (0..12)
                .map(|_| TcpStream::connect(addr).unwrap())
                .collect();
            thread::sleep(Duration::from_millis(400));
            streams
        });

        let lp2 = lp.clone();
        lp.run_after(Duration::from_millis(600), move || lp2.quit());
        lp.run();
        let streams = clients.join().unwrap();

        let counts = service.live_counts();
        assert_eq!(counts.len(), 3);
        assert_eq!(counts.iter().sum::<usize>(), 12);
        // Strict round-robin puts each within one of 12/3.
        for &c in &counts {
            assert!((3..=5).contains(&c), "uneven distribution: {:?}", counts);
        }
        drop(streams);
        service.stop();
    }

    #[test]
    fn test_zero_workers_serves_on_base_loop() {
        let lp = EventLoop::new();
        let service = localhost_service(&lp);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        service.on_connect(move |conn| {
            h.fetch_add(1, Ordering::SeqCst);
            conn.send(b"hi");
        });
        service.start(0);
        assert_eq!(service.worker_count(), 0);
        let addr = service.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut buf = [0u8; 2];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        let lp2 = lp.clone();
        lp.run_after(Duration::from_millis(400), move || lp2.quit());
        lp.run();

        assert_eq!(&client.join().unwrap(), b"hi");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_large_send_survives_partial_writes() {
        let lp = EventLoop::new();
        let service = localhost_service(&lp);
        // Far past any kernel send buffer, forcing several
        // write-readiness resumptions before the close completes.
        let payload: Vec<u8> = (0..2_000_000u32).map(|i| (i % 251) as u8).collect();
        let expect = payload.clone();
        service.on_connect(move |conn| {
            conn.send(&payload);
            conn.close();
        });
        service.start(1);
        let addr = service.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            let mut all = Vec::new();
            stream.read_to_end(&mut all).unwrap();
            all
        });

        let lp2 = lp.clone();
        lp.run_after(Duration::from_secs(3), move || lp2.quit());
        lp.run();

        let got = client.join().unwrap();
        assert_eq!(got.len(), expect.len());
        assert_eq!(got, expect);
        service.stop();
    }

    #[test]
    fn test_live_counts_drop_after_disconnect() {
        let lp = EventLoop::new();
        let service = localhost_service(&lp);
        service.start(1);
        let addr = service.local_addr().unwrap();

        let client = thread::spawn(move || {
            let stream = TcpStream::connect(addr).unwrap();
            thread::sleep(Duration::from_millis(200));
            drop(stream);
            // Leave time for the worker to observe the close.
            thread::sleep(Duration::from_millis(300));
        });

        let lp2 = lp.clone();
        lp.run_after(Duration::from_millis(700), move || lp2.quit());
        lp.run();
        client.join().unwrap();

        assert_eq!(service.live_counts(), vec![0]);
        service.stop();
    }
}
