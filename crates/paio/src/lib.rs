//! # paio — proactor-style async I/O for POSIX stream sockets
//!
//! Applications submit read and write requests against already-connected
//! byte streams; a dedicated event-loop thread waits on the kernel's
//! readiness notifier (epoll / kqueue, edge-triggered), performs the
//! nonblocking syscalls on the caller's behalf, and delivers completion
//! records in batches.
//!
//! ## Model
//!
//! ```text
//!  submitter threads          loop thread              waiter thread
//!  ─────────────────          ───────────              ─────────────
//!  read()/write() ──intake──▶ drain intake             wait_io()
//!                             try syscall / enqueue    ◀──batch── results
//!        poller thread ─────▶ drain per-fd waitlists
//!        (epoll/kqueue wait)  expire deadlines
//!                             release reclaimed fds
//! ```
//!
//! Per (fd, direction) completions arrive strictly in submission order.
//! Reads may omit a buffer to borrow the watcher's internal swap buffer;
//! such results are readable only while the delivering [`Batch`] lives.
//!
//! ## Example
//!
//! ```ignore
//! let w = paio::Watcher::new()?;
//! let conn = w.watch(stream)?;
//! w.read(None, &conn, None)?;            // internal buffer
//! let mut batch = w.wait_io()?;
//! for res in batch.iter_mut() {
//!     println!("{:?}: {} bytes", res.op(), res.size());
//! }
//! ```

mod config;
mod conn;
mod desc;
mod error;
pub mod kprint;
mod poller;
mod reactor;
mod request;
mod results;
mod swap;
mod timeouts;
mod watcher;

pub use config::WatcherConfig;
pub use conn::Conn;
pub use error::{Error, Result};
pub use request::OpKind;
pub use results::{Batch, OpResult};
pub use watcher::{Context, Watcher};
