//! gev TCP echo server
//!
//! Accepts on the base loop and distributes connections round-robin
//! across a pool of worker loops; every connection echoes its bytes
//! back in arrival order.
//!
//! Usage:
//!     ./target/release/gev-echo [--port 7000] [--workers N]
//!
//! Benchmark:
//!     tcpkali -c 100 -T 10s -m 'ping' 127.0.0.1:7000
//!     GEV_LOG_LEVEL=debug ./target/release/gev-echo --workers 1

use gev::{EventLoop, Service, ServiceConfig};

use std::env;
use std::net::Ipv4Addr;

fn main() {
    let mut port: u16 = 7000;
    let mut workers = ServiceConfig::default_workers();

    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                port = args[i + 1].parse().expect("bad --port value");
                i += 2;
            }
            "--workers" if i + 1 < args.len() => {
                workers = args[i + 1].parse().expect("bad --workers value");
                i += 2;
            }
            other => {
                eprintln!("unknown argument: {}", other);
                eprintln!("usage: gev-echo [--port PORT] [--workers N]");
                std::process::exit(2);
            }
        }
    }

    let lp = EventLoop::new();
    let service = Service::new(lp.clone(), ServiceConfig::new(Ipv4Addr::UNSPECIFIED, port));

    service.on_connect(|conn| {
        conn.on_read(|conn, buf| {
            let bytes = buf.drain_all();
            conn.send(&bytes);
        });
    });

    service.start(workers);
    println!("gev-echo: listening on 0.0.0.0:{} with {} workers", port, workers);
    lp.run();
}
