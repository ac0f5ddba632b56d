//! Stream handles and the reclamation path.
//!
//! A [`Conn`] wraps the caller's stream fd behind a cheaply cloneable
//! handle with a stable identity. The watcher's tables never hold a
//! `Conn`; they key on the identity alone, so dropping every clone is
//! observable. The drop of the last clone is the reclamation observer:
//! it pushes the identity onto the reclaim queue and nudges the loop,
//! which then releases the duplicated fd.
//!
//! Identities are drawn from a per-watcher counter rather than the
//! allocation address. An address can be recycled by the allocator the
//! moment the old handle is gone, which would let a stale reclamation
//! release a freshly watched fd; a monotone counter cannot collide.

use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;

/// Queue of identities whose last handle clone was dropped.
pub(crate) struct ReclaimQueue {
    queue: Mutex<Vec<u64>>,
    notify: Sender<()>,
}

impl ReclaimQueue {
    pub fn new(notify: Sender<()>) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            notify,
        }
    }

    pub fn enqueue(&self, ident: u64) {
        self.queue.lock().unwrap().push(ident);
        // single-slot, drop-if-full; the loop drains the whole queue
        let _ = self.notify.try_send(());
    }

    pub fn drain(&self) -> Vec<u64> {
        std::mem::take(&mut *self.queue.lock().unwrap())
    }
}

struct ConnInner {
    ident: u64,
    /// Present until the loop duplicates it on first sight.
    fd: Mutex<Option<OwnedFd>>,
    reclaim: Arc<ReclaimQueue>,
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        // Runs once, when the last Conn clone goes away. Any fd still
        // inside (never submitted) closes with it.
        self.reclaim.enqueue(self.ident);
    }
}

/// Handle to a watched stream. Clones share identity; the watcher
/// releases the stream's fd once every clone is dropped or
/// [`free`](crate::Watcher::free) is called.
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl Conn {
    pub(crate) fn new(ident: u64, fd: OwnedFd, reclaim: Arc<ReclaimQueue>) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                ident,
                fd: Mutex::new(Some(fd)),
                reclaim,
            }),
        }
    }

    pub(crate) fn ident(&self) -> u64 {
        self.inner.ident
    }

    /// Take the underlying fd out of the handle (first sight in the loop).
    pub(crate) fn take_fd(&self) -> Option<OwnedFd> {
        self.inner.fd.lock().unwrap().take()
    }

    /// Put the fd back after a failed duplication so the caller's stream
    /// stays usable.
    pub(crate) fn restore_fd(&self, fd: OwnedFd) {
        *self.inner.fd.lock().unwrap() = Some(fd);
    }
}

impl Clone for Conn {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn").field("ident", &self.inner.ident).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::os::unix::net::UnixStream;

    fn queue() -> (Arc<ReclaimQueue>, crossbeam_channel::Receiver<()>) {
        let (tx, rx) = bounded(1);
        (Arc::new(ReclaimQueue::new(tx)), rx)
    }

    #[test]
    fn test_drop_last_clone_enqueues_ident() {
        let (q, rx) = queue();
        let (a, _b) = UnixStream::pair().unwrap();
        let conn = Conn::new(7, a.into(), q.clone());
        let clone = conn.clone();

        drop(conn);
        assert!(q.drain().is_empty(), "live clone must inhibit reclamation");

        drop(clone);
        assert_eq!(q.drain(), vec![7]);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_take_fd_once() {
        let (q, _rx) = queue();
        let (a, _b) = UnixStream::pair().unwrap();
        let conn = Conn::new(1, a.into(), q);
        assert!(conn.take_fd().is_some());
        assert!(conn.take_fd().is_none());
    }

    #[test]
    fn test_restore_fd() {
        let (q, _rx) = queue();
        let (a, _b) = UnixStream::pair().unwrap();
        let conn = Conn::new(1, a.into(), q);
        let fd = conn.take_fd().unwrap();
        conn.restore_fd(fd);
        assert!(conn.take_fd().is_some());
    }
}
