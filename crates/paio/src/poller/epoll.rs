//! Linux epoll backend.

use std::cell::UnsafeCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::poller::PollerEvent;

// A hung-up or errored fd must drain its waitlists, so both directions
// treat HUP/ERR as ready.
const READ_FLAGS: u32 =
    (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;
const WRITE_FLAGS: u32 = (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32;

/// Edge-triggered epoll instance plus an eventfd that unblocks
/// `epoll_wait` for shutdown.
///
/// # Safety
///
/// `events` is the reusable kernel-event buffer. It is touched only by
/// `wait()`, which only the waiter thread calls, so the `UnsafeCell`
/// never sees concurrent access.
pub(crate) struct Poller {
    epfd: RawFd,
    wakefd: RawFd,
    shutdown: AtomicBool,
    events: UnsafeCell<Vec<libc::epoll_event>>,
}

unsafe impl Send for Poller {}
unsafe impl Sync for Poller {}

impl Poller {
    pub fn new(max_events: usize) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::last_os());
        }
        let wakefd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakefd < 0 {
            let err = Error::last_os();
            unsafe { libc::close(epfd) };
            return Err(err);
        }
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wakefd as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wakefd, &mut ev) } != 0 {
            let err = Error::last_os();
            unsafe {
                libc::close(wakefd);
                libc::close(epfd);
            }
            return Err(err);
        }
        Ok(Self {
            epfd,
            wakefd,
            shutdown: AtomicBool::new(false),
            events: UnsafeCell::new(Vec::with_capacity(max_events.max(1))),
        })
    }

    /// Register read+write interest, edge-triggered. Done once per fd;
    /// closing the fd is the only removal.
    pub fn register(&self, fd: RawFd) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLET) as u32,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) } != 0 {
            return Err(Error::last_os());
        }
        Ok(())
    }

    /// Block for the next event batch. `None` means the poller was shut
    /// down. Called only from the waiter thread.
    pub fn wait(&self) -> Option<Vec<PollerEvent>> {
        // Safety: sole caller is the waiter thread, see struct doc.
        let buf = unsafe { &mut *self.events.get() };
        let n = loop {
            let n = unsafe {
                libc::epoll_wait(self.epfd, buf.as_mut_ptr(), buf.capacity() as i32, -1)
            };
            if n >= 0 {
                break n as usize;
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EINTR {
                return None;
            }
        };
        // Safety: the kernel initialized the first n entries.
        unsafe { buf.set_len(n) };

        if self.shutdown.load(Ordering::Acquire) {
            return None;
        }

        let mut out = Vec::with_capacity(n);
        for e in buf.iter() {
            let fd = e.u64 as RawFd;
            if fd == self.wakefd {
                self.drain_wake();
                continue;
            }
            out.push(PollerEvent {
                fd,
                readable: e.events & READ_FLAGS != 0,
                writable: e.events & WRITE_FLAGS != 0,
            });
        }
        Some(out)
    }

    /// Flag shutdown and kick the waiter out of `epoll_wait`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake();
    }

    fn wake(&self) {
        let one: u64 = 1;
        // EAGAIN means the counter is saturated: a wakeup is already
        // pending, nothing to do.
        unsafe {
            libc::write(self.wakefd, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    fn drain_wake(&self) {
        let mut buf: u64 = 0;
        unsafe {
            libc::read(self.wakefd, &mut buf as *mut u64 as *mut libc::c_void, 8);
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakefd);
            libc::close(self.epfd);
        }
    }
}
