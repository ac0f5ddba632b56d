//! # Watcher — the public surface
//!
//! Callers submit read/write requests from any thread; a dedicated loop
//! thread performs the nonblocking syscalls and batches completions; any
//! thread collects them with `wait_io`. See the crate docs for the model.

use std::any::Any;
use std::mem;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::config::WatcherConfig;
use crate::conn::{Conn, ReclaimQueue};
use crate::error::{Error, Result};
use crate::pinfo;
use crate::poller::{self, Poller};
use crate::reactor::Reactor;
use crate::request::{Aiocb, OpKind};
use crate::results::{Batch, ResultSet};

/// Opaque caller context carried through a request unchanged.
pub type Context = Box<dyn Any + Send>;

/// Submission intake: a double buffer under one lock. Submitters append
/// to the create side and never block on the loop; the loop swaps the
/// sides and drains its half without holding the lock.
pub(crate) struct PendingQueue {
    create: Mutex<Vec<Aiocb>>,
    notify: Sender<()>,
}

impl PendingQueue {
    fn new(notify: Sender<()>) -> Self {
        Self {
            create: Mutex::new(Vec::new()),
            notify,
        }
    }

    fn push(&self, cb: Aiocb) {
        self.create.lock().unwrap().push(cb);
        // single-slot, drop-if-full: wakeups coalesce, the loop drains
        // everything it finds
        let _ = self.notify.try_send(());
    }

    /// Swap the create buffer against the (drained, empty) processing
    /// buffer. Called only by the loop.
    pub(crate) fn swap_into(&self, processing: &mut Vec<Aiocb>) {
        debug_assert!(processing.is_empty());
        mem::swap(&mut *self.create.lock().unwrap(), processing);
    }
}

/// Proactor for already-connected byte streams.
///
/// The watcher duplicates each stream's fd on first submission, performs
/// nonblocking reads and writes on the caller's behalf, and delivers
/// completion records in batches through [`wait_io`](Self::wait_io).
/// Per (fd, direction) completions arrive in submission order; across
/// fds there is no ordering.
///
/// Share it across threads behind an `Arc`. Dropping it closes it.
pub struct Watcher {
    pending: Arc<PendingQueue>,
    results: Arc<ResultSet>,
    reclaim: Arc<ReclaimQueue>,
    poller: Arc<Poller>,
    closed: AtomicBool,
    next_ident: AtomicU64,
    die_tx: Mutex<Option<Sender<()>>>,
    die_rx: Receiver<()>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Watcher {
    /// Open a watcher with default configuration (64 KiB swap slabs).
    pub fn new() -> Result<Self> {
        Self::with_config(WatcherConfig::from_env())
    }

    /// Open a watcher with explicit tunables.
    pub fn with_config(config: WatcherConfig) -> Result<Self> {
        let poller = Arc::new(Poller::new(config.max_events)?);

        let (pending_tx, pending_rx) = bounded(1);
        let (reclaim_tx, reclaim_rx) = bounded(1);
        // rendezvous: the waiter thread hands batches straight to the loop
        let (events_tx, events_rx) = bounded(0);
        let (die_tx, die_rx) = bounded::<()>(0);

        let pending = Arc::new(PendingQueue::new(pending_tx));
        let results = Arc::new(ResultSet::new());
        let reclaim = Arc::new(ReclaimQueue::new(reclaim_tx));

        let waiter = poller::spawn_waiter(poller.clone(), events_tx);
        let reactor = Reactor::new(
            config.swap_capacity,
            poller.clone(),
            pending.clone(),
            results.clone(),
            reclaim.clone(),
            pending_rx,
            events_rx,
            reclaim_rx,
            die_rx.clone(),
        );
        let looper = thread::Builder::new()
            .name("paio-loop".into())
            .spawn(move || reactor.run())
            .expect("failed to spawn loop thread");

        pinfo!("watcher open, swap {} x2, max events {}", config.swap_capacity, config.max_events);
        Ok(Self {
            pending,
            results,
            reclaim,
            poller,
            closed: AtomicBool::new(false),
            next_ident: AtomicU64::new(1),
            die_tx: Mutex::new(Some(die_tx)),
            die_rx,
            threads: Mutex::new(vec![looper, waiter]),
        })
    }

    /// Wrap a connected stream into a watchable handle.
    ///
    /// The watcher takes over the fd on first submission (it duplicates
    /// it and closes the original), so the stream must not be used
    /// directly afterwards. Clones of the handle share identity; once
    /// every clone is dropped the fd is released automatically, as if
    /// [`free`](Self::free) had been called.
    pub fn watch(&self, stream: impl Into<OwnedFd>) -> Result<Conn> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::WatcherClosed);
        }
        let ident = self.next_ident.fetch_add(1, Ordering::Relaxed);
        Ok(Conn::new(ident, stream.into(), self.reclaim.clone()))
    }

    /// Submit a read. With `buf: None` (or empty) the bytes are returned
    /// in the watcher's internal swap buffer, readable only while the
    /// delivering [`Batch`] is alive. Completes on the first successful
    /// read, end of stream, or error.
    pub fn read(&self, ctx: Option<Context>, conn: &Conn, buf: Option<Vec<u8>>) -> Result<()> {
        self.submit(Aiocb::new(OpKind::Read, ctx, conn, normalize(buf), None, false))
    }

    /// [`read`](Self::read) with a completion deadline.
    pub fn read_deadline(
        &self,
        ctx: Option<Context>,
        conn: &Conn,
        buf: Option<Vec<u8>>,
        deadline: Instant,
    ) -> Result<()> {
        self.submit(Aiocb::new(
            OpKind::Read,
            ctx,
            conn,
            normalize(buf),
            Some(deadline),
            false,
        ))
    }

    /// Read until `buf` is completely filled or `deadline` passes.
    /// A deadline completion reports the bytes gathered so far.
    pub fn read_full(
        &self,
        ctx: Option<Context>,
        conn: &Conn,
        buf: Vec<u8>,
        deadline: Instant,
    ) -> Result<()> {
        if buf.is_empty() {
            return Err(Error::EmptyBuffer);
        }
        self.submit(Aiocb::new(
            OpKind::Read,
            ctx,
            conn,
            Some(buf),
            Some(deadline),
            true,
        ))
    }

    /// Submit a write of the whole buffer. Partial progress re-queues
    /// transparently; the completion reports the full size on success.
    pub fn write(&self, ctx: Option<Context>, conn: &Conn, buf: Vec<u8>) -> Result<()> {
        if buf.is_empty() {
            return Err(Error::EmptyBuffer);
        }
        self.submit(Aiocb::new(OpKind::Write, ctx, conn, Some(buf), None, false))
    }

    /// [`write`](Self::write) with a completion deadline.
    pub fn write_deadline(
        &self,
        ctx: Option<Context>,
        conn: &Conn,
        buf: Vec<u8>,
        deadline: Instant,
    ) -> Result<()> {
        if buf.is_empty() {
            return Err(Error::EmptyBuffer);
        }
        self.submit(Aiocb::new(
            OpKind::Write,
            ctx,
            conn,
            Some(buf),
            Some(deadline),
            false,
        ))
    }

    /// Release the handle's fd immediately. Requests still queued on it
    /// are dropped without completions; free only when done with them.
    pub fn free(&self, conn: &Conn) -> Result<()> {
        self.submit(Aiocb::new(OpKind::Free, None, conn, None, None, false))
    }

    fn submit(&self, cb: Aiocb) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::WatcherClosed);
        }
        self.pending.push(cb);
        Ok(())
    }

    /// Block until at least one completion is available and take the
    /// whole batch. Returns [`Error::WatcherClosed`] once the watcher is
    /// closed and drained.
    ///
    /// Swap-buffer results borrow the watcher's internal slabs; the loop
    /// will not reuse an exhausted slab until the batch is dropped, so
    /// consume batches promptly.
    pub fn wait_io(&self) -> Result<Batch> {
        loop {
            if let Some(batch) = ResultSet::try_take(&self.results) {
                return Ok(batch);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::WatcherClosed);
            }
            select! {
                recv(self.results.notify_rx) -> _ => {}
                recv(self.die_rx) -> _ => return Err(Error::WatcherClosed),
            }
        }
    }

    /// Shut the watcher down: wake every waiter with
    /// [`Error::WatcherClosed`], release all registered fds, and join
    /// the worker threads. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        pinfo!("watcher closing");
        // dropping the sender disconnects the loop, parked deliveries,
        // and blocked waiters all at once
        self.die_tx.lock().unwrap().take();
        self.poller.shutdown();
        let threads = mem::take(&mut *self.threads.lock().unwrap());
        for t in threads {
            let _ = t.join();
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn normalize(buf: Option<Vec<u8>>) -> Option<Vec<u8>> {
    buf.filter(|b| !b.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::OpKind;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpListener, TcpStream};
    use std::time::Duration;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    /// Everything a test needs out of a result, copied so the batch can
    /// drop (and release any swap slab) before assertions.
    struct Done {
        op: OpKind,
        size: usize,
        err: Option<Error>,
        data: Vec<u8>,
        ctx: Option<Context>,
        is_swap: bool,
    }

    fn collect(w: &Watcher, n: usize) -> Vec<Done> {
        let mut out = Vec::new();
        while out.len() < n {
            let mut batch = w.wait_io().unwrap();
            for r in batch.iter_mut() {
                out.push(Done {
                    op: r.op(),
                    size: r.size(),
                    err: r.error().cloned(),
                    data: r.data().to_vec(),
                    ctx: r.take_context(),
                    is_swap: r.is_swap_buffer(),
                });
            }
        }
        out
    }

    fn tag(d: &Done) -> u8 {
        *d.ctx.as_ref().unwrap().downcast_ref::<u8>().unwrap()
    }

    #[test]
    fn test_echo_round_trip() {
        let w = Watcher::new().unwrap();
        let (mut client, server) = tcp_pair();
        let conn = w.watch(server).unwrap();

        w.read(None, &conn, Some(vec![0u8; 128])).unwrap();
        client.write_all(b"hello world").unwrap();

        let done = collect(&w, 1);
        assert_eq!(done[0].op, OpKind::Read);
        assert_eq!(done[0].size, 11);
        assert!(done[0].err.is_none());
        assert_eq!(done[0].data, b"hello world");

        w.write(None, &conn, done[0].data.clone()).unwrap();
        let done = collect(&w, 1);
        assert_eq!(done[0].op, OpKind::Write);
        assert_eq!(done[0].size, 11);
        assert!(done[0].err.is_none());

        let mut rx = [0u8; 11];
        client.read_exact(&mut rx).unwrap();
        assert_eq!(&rx, b"hello world");
    }

    #[test]
    fn test_read_full_deadline_partial() {
        let w = Watcher::new().unwrap();
        let (mut client, server) = tcp_pair();
        let conn = w.watch(server).unwrap();

        let start = Instant::now();
        w.read_full(None, &conn, vec![0u8; 4], Instant::now() + Duration::from_millis(50))
            .unwrap();
        client.write_all(&[1, 2]).unwrap();

        let done = collect(&w, 1);
        assert_eq!(done[0].err, Some(Error::Deadline));
        assert_eq!(done[0].size, 2);
        assert_eq!(done[0].data, [1, 2]);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_read_full_success_fills_buffer() {
        let w = Watcher::new().unwrap();
        let (mut client, server) = tcp_pair();
        let conn = w.watch(server).unwrap();

        w.read_full(None, &conn, vec![0u8; 5], Instant::now() + Duration::from_secs(5))
            .unwrap();
        client.write_all(b"he").unwrap();
        client.write_all(b"llo").unwrap();

        let done = collect(&w, 1);
        assert!(done[0].err.is_none());
        assert_eq!(done[0].size, 5);
        assert_eq!(done[0].data, b"hello");
    }

    #[test]
    fn test_swap_buffer_rotation() {
        // capacity 16, eight 4-byte reads: two full rotations
        let w = Watcher::with_config(WatcherConfig::from_env().swap_capacity(16)).unwrap();
        let mut clients = Vec::new();
        let mut conns = Vec::new();
        for i in 0..8u8 {
            let (client, server) = tcp_pair();
            let conn = w.watch(server).unwrap();
            w.read(Some(Box::new(i)), &conn, None).unwrap();
            clients.push(client);
            conns.push(conn);
        }
        for (i, c) in clients.iter_mut().enumerate() {
            c.write_all(&[i as u8; 4]).unwrap();
        }

        let done = collect(&w, 8);
        assert_eq!(done.len(), 8);
        for d in &done {
            assert!(d.is_swap);
            assert!(d.err.is_none());
            assert_eq!(d.size, 4);
            assert_eq!(d.data, [tag(d); 4]);
        }
    }

    #[test]
    fn test_free_drops_pending_reads() {
        let w = Watcher::new().unwrap();
        let (mut c1, s1) = tcp_pair();
        let (mut c2, s2) = tcp_pair();
        let conn1 = w.watch(s1).unwrap();
        let conn2 = w.watch(s2).unwrap();

        w.read(Some(Box::new(1u8)), &conn1, Some(vec![0u8; 8])).unwrap();
        w.free(&conn1).unwrap();

        // the freed fd closes, so its peer sees EOF
        c1.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut probe = [0u8; 1];
        assert_eq!(c1.read(&mut probe).unwrap(), 0);

        // other fds are unaffected; the purged read never surfaces
        w.read(Some(Box::new(2u8)), &conn2, Some(vec![0u8; 8])).unwrap();
        c2.write_all(b"ok").unwrap();
        let done = collect(&w, 1);
        assert_eq!(tag(&done[0]), 2);
        assert_eq!(done[0].data, b"ok");
    }

    #[test]
    fn test_dropping_all_handles_releases_fd() {
        let w = Watcher::new().unwrap();
        let (mut client, server) = tcp_pair();
        let conn = w.watch(server).unwrap();

        w.read(None, &conn, Some(vec![0u8; 8])).unwrap();
        client.write_all(b"hi").unwrap();
        let done = collect(&w, 1);
        assert_eq!(done[0].size, 2);

        // no free(): reclamation alone must release the fd
        drop(conn);

        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut probe = [0u8; 1];
        assert_eq!(client.read(&mut probe).unwrap(), 0);
    }

    #[test]
    fn test_eof_after_partial_read_full() {
        let w = Watcher::new().unwrap();
        let (mut client, server) = tcp_pair();
        let conn = w.watch(server).unwrap();

        w.read_full(None, &conn, vec![0u8; 10], Instant::now() + Duration::from_secs(5))
            .unwrap();
        client.write_all(&[7u8; 5]).unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let done = collect(&w, 1);
        assert_eq!(done[0].err, Some(Error::Eof));
        assert_eq!(done[0].size, 5);
        assert_eq!(done[0].data, [7u8; 5]);
    }

    #[test]
    fn test_eof_on_clean_close() {
        let w = Watcher::new().unwrap();
        let (client, server) = tcp_pair();
        let conn = w.watch(server).unwrap();

        drop(client);
        w.read(None, &conn, Some(vec![0u8; 8])).unwrap();

        let done = collect(&w, 1);
        assert_eq!(done[0].err, Some(Error::Eof));
        assert_eq!(done[0].size, 0);
    }

    #[test]
    fn test_fifo_per_direction() {
        let w = Watcher::new().unwrap();
        let (mut client, server) = tcp_pair();
        let conn = w.watch(server).unwrap();

        // reads complete in submission order even when the bytes arrive
        // in one burst
        for i in 0..3u8 {
            w.read(Some(Box::new(i)), &conn, Some(vec![0u8; 1])).unwrap();
        }
        client.write_all(b"abc").unwrap();
        let done = collect(&w, 3);
        let order: Vec<u8> = done.iter().map(tag).collect();
        assert_eq!(order, [0, 1, 2]);
        let bytes: Vec<u8> = done.iter().map(|d| d.data[0]).collect();
        assert_eq!(bytes, b"abc");

        // writes likewise
        for i in 0..3u8 {
            w.write(Some(Box::new(i)), &conn, vec![b'x' + i]).unwrap();
        }
        let done = collect(&w, 3);
        let order: Vec<u8> = done.iter().map(tag).collect();
        assert_eq!(order, [0, 1, 2]);

        let mut rx = [0u8; 3];
        client.read_exact(&mut rx).unwrap();
        assert_eq!(&rx, b"xyz");
    }

    #[test]
    fn test_unsupported_after_free() {
        let w = Watcher::new().unwrap();
        let (mut client, server) = tcp_pair();
        let conn = w.watch(server).unwrap();

        w.read(None, &conn, Some(vec![0u8; 4])).unwrap();
        client.write_all(b"a").unwrap();
        collect(&w, 1);

        w.free(&conn).unwrap();

        // the handle's fd was consumed at first sight; resubmission has
        // nothing left to duplicate
        w.read(None, &conn, Some(vec![0u8; 4])).unwrap();
        let done = collect(&w, 1);
        assert_eq!(done[0].err, Some(Error::Unsupported));
        assert_eq!(done[0].size, 0);
    }

    #[test]
    fn test_empty_buffer_rejected() {
        let w = Watcher::new().unwrap();
        let (_client, server) = tcp_pair();
        let conn = w.watch(server).unwrap();

        assert_eq!(w.write(None, &conn, Vec::new()), Err(Error::EmptyBuffer));
        assert_eq!(
            w.read_full(None, &conn, Vec::new(), Instant::now()),
            Err(Error::EmptyBuffer)
        );
    }

    #[test]
    fn test_closed_watcher_errors() {
        let w = Watcher::new().unwrap();
        let (_client, server) = tcp_pair();
        let conn = w.watch(server).unwrap();

        w.close();
        w.close(); // idempotent

        assert_eq!(w.read(None, &conn, None), Err(Error::WatcherClosed));
        assert_eq!(w.write(None, &conn, vec![1]), Err(Error::WatcherClosed));
        assert!(matches!(w.wait_io(), Err(Error::WatcherClosed)));
        assert!(w.watch(tcp_pair().1).is_err());
    }

    #[test]
    fn test_close_unblocks_waiter() {
        let w = Arc::new(Watcher::new().unwrap());
        let waiter = {
            let w = w.clone();
            thread::spawn(move || w.wait_io())
        };
        thread::sleep(Duration::from_millis(50));
        w.close();
        assert!(matches!(waiter.join().unwrap(), Err(Error::WatcherClosed)));
    }

    #[test]
    fn test_write_then_read_echo_law() {
        // write b then read: the concatenation read back equals b
        let w = Watcher::new().unwrap();
        let (mut client, server) = tcp_pair();
        let conn = w.watch(server).unwrap();

        let payload: Vec<u8> = (0..200u8).collect();
        w.write(None, &conn, payload.clone()).unwrap();
        let done = collect(&w, 1);
        assert_eq!(done[0].size, payload.len());

        let mut rx = vec![0u8; payload.len()];
        client.read_exact(&mut rx).unwrap();
        client.write_all(&rx).unwrap();

        w.read_full(None, &conn, vec![0u8; 200], Instant::now() + Duration::from_secs(5))
            .unwrap();
        let done = collect(&w, 1);
        assert!(done[0].err.is_none());
        assert_eq!(done[0].data, payload);
    }
}
