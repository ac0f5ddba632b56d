//! # The event loop
//!
//! A single thread owns the descriptor table, the arena, the timeout
//! heap, and the swap buffers; nothing else ever touches them. The loop
//! multiplexes four signal sources plus shutdown:
//!
//! 1. Submission intake (double buffer swapped under the intake lock)
//! 2. Poller readiness batches (forwarded by the waiter thread)
//! 3. Timer expiry (armed for the heap's head deadline)
//! 4. Handle reclamation (identities whose last clone was dropped)
//!
//! The poller is edge-triggered, which shapes two rules here. First, a
//! request landing on an empty waitlist gets one opportunistic syscall
//! attempt immediately; the registration edge may already have fired, so
//! waiting for another would starve. Second, a readiness drain keeps
//! re-attempting the head request while it makes progress; stopping on a
//! partial full-read would drop the tail of a coalesced data+FIN event.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{after, never, select, Receiver};

use crate::conn::ReclaimQueue;
use crate::desc::{Dir, FdDesc};
use crate::error::Error;
use crate::poller::{Poller, PollerEvent};
use crate::request::{Aiocb, CbArena, OpKind};
use crate::results::{Buf, OpResult, ResultSet};
use crate::swap::SwapBuffers;
use crate::timeouts::TimedHeap;
use crate::watcher::PendingQueue;
use crate::{pdebug, pwarn};

/// Outcome of one progress attempt on a request.
enum Progress {
    /// Would block; the request keeps its place at the head.
    Blocked,
    /// Moved some bytes but is not finished (partial full-read).
    Partial,
    /// Finished, successfully or with a terminal error.
    Done,
}

pub(crate) struct Reactor {
    arena: CbArena,
    descs: HashMap<RawFd, FdDesc>,
    /// Identity to duplicated-fd index. Holds no handle references.
    idents: HashMap<u64, RawFd>,
    timeouts: TimedHeap,
    swap: SwapBuffers,
    /// Loop-side half of the intake double buffer.
    processing: Vec<Aiocb>,

    poller: Arc<Poller>,
    pending: Arc<PendingQueue>,
    results: Arc<ResultSet>,
    reclaim: Arc<ReclaimQueue>,

    pending_rx: Receiver<()>,
    events_rx: Receiver<Vec<PollerEvent>>,
    reclaim_rx: Receiver<()>,
    die_rx: Receiver<()>,
}

impl Reactor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        swap_capacity: usize,
        poller: Arc<Poller>,
        pending: Arc<PendingQueue>,
        results: Arc<ResultSet>,
        reclaim: Arc<ReclaimQueue>,
        pending_rx: Receiver<()>,
        events_rx: Receiver<Vec<PollerEvent>>,
        reclaim_rx: Receiver<()>,
        die_rx: Receiver<()>,
    ) -> Self {
        Self {
            arena: CbArena::new(),
            descs: HashMap::new(),
            idents: HashMap::new(),
            timeouts: TimedHeap::new(),
            swap: SwapBuffers::new(swap_capacity),
            processing: Vec::new(),
            poller,
            pending,
            results,
            reclaim,
            pending_rx,
            events_rx,
            reclaim_rx,
            die_rx,
        }
    }

    pub fn run(mut self) {
        let pending_rx = self.pending_rx.clone();
        let events_rx = self.events_rx.clone();
        let reclaim_rx = self.reclaim_rx.clone();
        let die_rx = self.die_rx.clone();

        loop {
            let timer = match self.timeouts.peek_deadline(&self.arena) {
                Some(deadline) => after(deadline.saturating_duration_since(Instant::now())),
                None => never(),
            };
            select! {
                recv(pending_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    self.handle_pending();
                }
                recv(events_rx) -> msg => match msg {
                    Ok(events) => self.handle_events(events),
                    Err(_) => break,
                },
                recv(timer) -> _ => self.handle_timeouts(),
                recv(reclaim_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    self.handle_reclaim();
                }
                recv(die_rx) -> _ => break,
            }
        }

        // shutdown: release every registered fd; still-queued requests
        // are dropped without completions
        let fds: Vec<RawFd> = self.descs.keys().copied().collect();
        for fd in fds {
            self.release_fd(fd);
        }
    }

    // ── Submission intake ────────────────────────────────────────────

    fn handle_pending(&mut self) {
        self.pending.swap_into(&mut self.processing);
        let mut batch = std::mem::take(&mut self.processing);
        for cb in batch.drain(..) {
            self.process_request(cb);
        }
        self.processing = batch;
    }

    fn process_request(&mut self, mut cb: Aiocb) {
        let known = self.idents.get(&cb.ident).copied();

        if cb.op == OpKind::Free {
            // pending requests on the fd are dropped, not errored;
            // callers free only once they are done with it
            if let Some(fd) = known {
                self.release_fd(fd);
            }
            return;
        }

        let fd = match known {
            Some(fd) => fd,
            None => match self.first_sight(&cb) {
                Ok(fd) => fd,
                Err(err) => {
                    cb.err = Some(err);
                    self.deliver(cb);
                    return;
                }
            },
        };
        cb.fd = fd;

        let dir = if cb.op == OpKind::Read { Dir::Read } else { Dir::Write };
        if self.descs[&fd].list(dir).is_empty() {
            // opportunistic first attempt; see module doc
            loop {
                let progress = match dir {
                    Dir::Read => try_read(&mut self.swap, fd, &mut cb),
                    Dir::Write => try_write(fd, &mut cb),
                };
                match progress {
                    Progress::Done => {
                        self.deliver(cb);
                        return;
                    }
                    Progress::Partial => continue,
                    Progress::Blocked => break,
                }
            }
        }
        self.enqueue(fd, dir, cb);
    }

    fn enqueue(&mut self, fd: RawFd, dir: Dir, cb: Aiocb) {
        let has_deadline = cb.deadline.is_some();
        let idx = self.arena.insert(cb);
        let desc = self.descs.get_mut(&fd).expect("descriptor disappeared");
        desc.list_mut(dir).push_back(&mut self.arena, idx);
        if has_deadline {
            // the select rearms for the new heap head on the next turn
            self.timeouts.push(&mut self.arena, idx);
        }
    }

    /// First submission against this identity: take the caller's fd,
    /// duplicate it, register the duplicate, and close the original. The
    /// duplicate decouples the loop from caller-side closes, so no
    /// syscall can ever land on a recycled fd number.
    fn first_sight(&mut self, cb: &Aiocb) -> Result<RawFd, Error> {
        let conn = cb.conn.as_ref().ok_or(Error::Unsupported)?;
        let orig = conn.take_fd().ok_or(Error::Unsupported)?;

        let dup = unsafe { libc::fcntl(orig.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            let err = Error::last_os();
            conn.restore_fd(orig);
            return Err(err);
        }
        // Safety: dup is a fresh descriptor we own exclusively.
        let dup = unsafe { OwnedFd::from_raw_fd(dup) };

        if let Err(err) = set_nonblocking(dup.as_raw_fd()) {
            conn.restore_fd(orig);
            return Err(err);
        }

        // the loop owns the duplicate from here on
        drop(orig);

        #[cfg(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "dragonfly"
        ))]
        {
            // best effort: a dead peer should surface as EPIPE, not SIGPIPE
            let one: libc::c_int = 1;
            unsafe {
                libc::setsockopt(
                    dup.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_NOSIGPIPE,
                    &one as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
        }

        if let Err(err) = self.poller.register(dup.as_raw_fd()) {
            pwarn!("poller register failed for ident {}: {}", cb.ident, err);
            return Err(err); // dup closes on drop
        }

        let fd = dup.into_raw_fd();
        self.descs.insert(fd, FdDesc::new(cb.ident));
        self.idents.insert(cb.ident, fd);
        pdebug!("ident {} bound to fd {}", cb.ident, fd);
        Ok(fd)
    }

    // ── Readiness ────────────────────────────────────────────────────

    fn handle_events(&mut self, events: Vec<PollerEvent>) {
        for e in events {
            if !self.descs.contains_key(&e.fd) {
                continue;
            }
            if e.readable {
                self.drain(e.fd, Dir::Read);
            }
            if e.writable {
                self.drain(e.fd, Dir::Write);
            }
        }
    }

    /// Drive the waitlist head-first until the first would-block, so
    /// completion order within a direction equals submission order.
    fn drain(&mut self, fd: RawFd, dir: Dir) {
        loop {
            let head = match self.descs.get(&fd) {
                Some(desc) => desc.list(dir).head(),
                None => return,
            };
            let Some(idx) = head else { return };

            let progress = {
                let cb = self.arena.get_mut(idx);
                match dir {
                    Dir::Read => try_read(&mut self.swap, fd, cb),
                    Dir::Write => try_write(fd, cb),
                }
            };
            match progress {
                Progress::Blocked => return,
                Progress::Partial => continue,
                Progress::Done => {
                    let desc = self.descs.get_mut(&fd).expect("descriptor disappeared");
                    desc.list_mut(dir).unlink(&mut self.arena, idx);
                    self.timeouts.remove(&mut self.arena, idx);
                    let cb = self.arena.remove(idx);
                    self.deliver(cb);
                }
            }
        }
    }

    // ── Timers ───────────────────────────────────────────────────────

    fn handle_timeouts(&mut self) {
        let now = Instant::now();
        while let Some(idx) = self.timeouts.peek() {
            let deadline = self
                .arena
                .get(idx)
                .deadline
                .expect("request in heap without deadline");
            if deadline > now {
                break;
            }
            self.timeouts.pop(&mut self.arena);

            // a heap member is always waitlisted; unlink it there too
            let (fd, dir) = {
                let cb = self.arena.get(idx);
                let dir = if cb.op == OpKind::Read { Dir::Read } else { Dir::Write };
                (cb.fd, dir)
            };
            let desc = self.descs.get_mut(&fd).expect("timed-out request not waitlisted");
            desc.list_mut(dir).unlink(&mut self.arena, idx);

            let mut cb = self.arena.remove(idx);
            cb.err = Some(Error::Deadline);
            self.deliver(cb);
        }
    }

    // ── Reclamation ──────────────────────────────────────────────────

    fn handle_reclaim(&mut self) {
        for ident in self.reclaim.drain() {
            if let Some(fd) = self.idents.get(&ident).copied() {
                pdebug!("ident {} reclaimed, releasing fd {}", ident, fd);
                self.release_fd(fd);
            }
        }
    }

    fn release_fd(&mut self, fd: RawFd) {
        let Some(mut desc) = self.descs.remove(&fd) else { return };
        while let Some(idx) = desc.readers.pop_front(&mut self.arena) {
            self.timeouts.remove(&mut self.arena, idx);
            self.arena.remove(idx);
        }
        while let Some(idx) = desc.writers.pop_front(&mut self.arena) {
            self.timeouts.remove(&mut self.arena, idx);
            self.arena.remove(idx);
        }
        self.idents.remove(&desc.ident);
        // no poller unregister: the kernel forgets closed fds silently
        unsafe { libc::close(fd) };
        pdebug!("fd {} released", fd);
    }

    // ── Delivery ─────────────────────────────────────────────────────

    fn deliver(&mut self, mut cb: Aiocb) {
        let buf = if let Some(view) = cb.swap_view.take() {
            Buf::Slab(view)
        } else if let Some(v) = cb.buf.take() {
            Buf::Owned(v)
        } else {
            Buf::None
        };
        let res = OpResult {
            op: cb.op,
            conn: cb.conn.take(),
            is_swap: cb.use_swap,
            buf,
            size: cb.size,
            err: cb.err.take(),
            ctx: cb.ctx.take(),
        };
        // may park on a hangup if this completion exhausted a slab
        self.results.deliver(res, cb.notify_caller, &self.die_rx);
    }
}

// ── Nonblocking syscall mechanics ────────────────────────────────────

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(Error::last_os());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::last_os());
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn nb_write(fd: RawFd, buf: &[u8]) -> isize {
    // MSG_NOSIGNAL turns a dead peer into EPIPE instead of SIGPIPE;
    // non-socket fds fall back to plain write
    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n < 0 && last_errno() == libc::ENOTSOCK {
        return unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    }
    n
}

#[cfg(not(target_os = "linux"))]
fn nb_write(fd: RawFd, buf: &[u8]) -> isize {
    unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) }
}

/// One read attempt (EINTR retried). Reads land in the caller's buffer
/// at offset `size`, or at the current swap slab's append offset when
/// the request brought no buffer.
fn try_read(swap: &mut SwapBuffers, fd: RawFd, cb: &mut Aiocb) -> Progress {
    let use_swap = cb.buf.is_none();
    loop {
        let dst: &mut [u8] = match cb.buf.as_mut() {
            Some(buf) => &mut buf[cb.size..],
            None => swap.dst(cb.size),
        };
        let n = unsafe { libc::read(fd, dst.as_mut_ptr() as *mut libc::c_void, dst.len()) };
        if n < 0 {
            let errno = last_errno();
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                return Progress::Blocked;
            }
            if errno == libc::EINTR {
                continue;
            }
            cb.err = Some(Error::Os(errno));
        } else if n == 0 {
            cb.err = Some(Error::Eof);
        } else {
            cb.size += n as usize;
        }
        break;
    }

    let buf_len = cb.buf.as_ref().map_or(0, |b| b.len());
    let completed = cb.err.is_some() || (!use_swap && cb.size == buf_len) || !cb.read_full;
    if !completed {
        return Progress::Partial;
    }

    if use_swap && cb.err.is_none() {
        let (view, rotated) = swap.commit(cb.size);
        cb.swap_view = Some(view);
        cb.use_swap = true;
        // exhausting the slab obliges the waiter to acknowledge the
        // batch before the loop may reuse it
        cb.notify_caller = rotated;
    }
    Progress::Done
}

/// Write at offset `size` until done, terminal error, or would-block.
/// Partial writes keep their place and resume at the updated offset.
fn try_write(fd: RawFd, cb: &mut Aiocb) -> Progress {
    let buf = cb.buf.as_ref().expect("write request without buffer");
    while cb.size < buf.len() {
        let n = nb_write(fd, &buf[cb.size..]);
        if n < 0 {
            let errno = last_errno();
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                return Progress::Blocked;
            }
            if errno == libc::EINTR {
                continue;
            }
            cb.err = Some(Error::Os(errno));
            break;
        }
        if n == 0 {
            return Progress::Blocked;
        }
        cb.size += n as usize;
    }
    Progress::Done
}
