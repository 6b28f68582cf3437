//! gev static file streamer
//!
//! Every client that connects receives the configured file's bytes,
//! then the connection closes once the transfer has fully left the
//! socket. Exercises the chunked, resumable file-transfer path: the
//! file is pumped by write-readiness in fixed-size chunks, never read
//! into memory whole.
//!
//! Usage:
//!     ./target/release/gev-fileserv --file payload.bin [--port 7001] [--workers N]
//!
//! Pull a copy:
//!     nc 127.0.0.1 7001 > copy.bin && cmp payload.bin copy.bin

use gev::{EventLoop, Service, ServiceConfig};

use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;

fn main() {
    let mut port: u16 = 7001;
    let mut workers = ServiceConfig::default_workers();
    let mut file: Option<PathBuf> = None;

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
            "--file" if i + 1 < args.len() => {
                file = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            other => {
                eprintln!("unknown argument: {}", other);
                eprintln!("usage: gev-fileserv --file PATH [--port PORT] [--workers N]");
                std::process::exit(2);
            }
        }
    }

    let Some(file) = file else {
        eprintln!("usage: gev-fileserv --file PATH [--port PORT] [--workers N]");
        std::process::exit(2);
    };
    if !file.is_file() {
        eprintln!("gev-fileserv: not a file: {}", file.display());
        std::process::exit(2);
    }

    let lp = EventLoop::new();
    let service = Service::new(lp.clone(), ServiceConfig::new(Ipv4Addr::UNSPECIFIED, port));

    let path = file.clone();
    service.on_connect(move |conn| {
        if let Err(e) = conn.send_file(&path) {
            eprintln!("gev-fileserv: {}: {}", path.display(), e);
        }
        // Graceful: queued bytes flush before the descriptor closes.
        conn.close();
    });

    service.start(workers);
    println!(
        "gev-fileserv: serving {} on 0.0.0.0:{} with {} workers",
        file.display(),
        port,
        workers
    );
    lp.run();
}
