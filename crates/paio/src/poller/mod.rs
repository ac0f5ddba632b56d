//! Kernel readiness notifier and its dedicated waiter thread.
//!
//! One backend per platform (`epoll` on Linux, `kqueue` on the BSDs and
//! macOS), both edge-triggered. The contract the loop relies on:
//!
//! - `register(fd)` adds read+write interest once; there is no
//!   unregister, the kernel forgets closed fds on its own
//! - `wait()` blocks until a batch of readiness events is available,
//!   returning `None` once the poller is shut down
//! - registration from the loop thread is safe while the waiter thread
//!   is blocked in `wait()`
//!
//! Because interest is edge-triggered, a request submitted against an
//! already-readable fd would starve if the loop waited for an event; the
//! loop's opportunistic first syscall attempt covers that window.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub(crate) use epoll::Poller;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) use kqueue::Poller;

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollerEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// Run the blocking kernel wait on its own thread, forwarding each batch
/// to the loop over a rendezvous channel. Exits when the poller shuts
/// down or the loop goes away.
pub(crate) fn spawn_waiter(
    poller: Arc<Poller>,
    tx: Sender<Vec<PollerEvent>>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("paio-poll".into())
        .spawn(move || loop {
            match poller.wait() {
                Some(events) => {
                    if events.is_empty() {
                        continue;
                    }
                    if tx.send(events).is_err() {
                        break;
                    }
                }
                None => break,
            }
        })
        .expect("failed to spawn poller thread")
}
