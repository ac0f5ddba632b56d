//! paio echo server
//!
//! TCP echo server driven entirely by the paio watcher: one accept
//! thread, one completion pump, all I/O proactor-style with the
//! internal swap buffer (no per-connection read buffers).
//!
//! Usage:
//!     cargo run --release -p paio-echo [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999

use std::net::TcpListener;
use std::sync::Arc;

use paio::{OpKind, Watcher};

fn main() {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or(9999);

    let listener = TcpListener::bind(("0.0.0.0", port)).expect("bind failed");
    let watcher = Arc::new(Watcher::new().expect("failed to open watcher"));
    eprintln!("paio-echo: listening on port {}", port);

    // Completion pump: echo each read back as a write, rearm the read
    // once the write lands. In-flight requests keep the handle alive;
    // on EOF or error we stop resubmitting and free the fd.
    let pump = {
        let watcher = watcher.clone();
        std::thread::Builder::new()
            .name("echo-pump".into())
            .spawn(move || loop {
                let mut batch = match watcher.wait_io() {
                    Ok(b) => b,
                    Err(_) => break, // watcher closed
                };
                for res in batch.iter_mut() {
                    let conn = match res.conn() {
                        Some(c) => c.clone(),
                        None => continue,
                    };
                    if res.error().is_some() {
                        let _ = watcher.free(&conn);
                        continue;
                    }
                    match res.op() {
                        OpKind::Read => {
                            let _ = watcher.write(None, &conn, res.data().to_vec());
                        }
                        OpKind::Write => {
                            let _ = watcher.read(None, &conn, None);
                        }
                        _ => {}
                    }
                }
            })
            .expect("failed to spawn echo pump")
    };

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                eprintln!("paio-echo: accept: {}", e);
                continue;
            }
        };
        let conn = match watcher.watch(stream) {
            Ok(c) => c,
            Err(_) => break,
        };
        if watcher.read(None, &conn, None).is_err() {
            break;
        }
    }

    watcher.close();
    let _ = pump.join();
}
