//! kqueue backend for macOS and the BSDs.

use std::cell::UnsafeCell;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::poller::PollerEvent;

/// Edge-triggered kqueue instance plus a self-pipe that unblocks
/// `kevent` for shutdown.
///
/// # Safety
///
/// `events` is the reusable kernel-event buffer. It is touched only by
/// `wait()`, which only the waiter thread calls, so the `UnsafeCell`
/// never sees concurrent access.
pub(crate) struct Poller {
    kq: RawFd,
    wake_r: RawFd,
    wake_w: RawFd,
    shutdown: AtomicBool,
    events: UnsafeCell<Vec<libc::kevent>>,
}

unsafe impl Send for Poller {}
unsafe impl Sync for Poller {}

fn set_nonblock_cloexec(fd: RawFd) -> Result<()> {
    unsafe {
        if libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) < 0 {
            return Err(Error::last_os());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(Error::last_os());
        }
    }
    Ok(())
}

impl Poller {
    pub fn new(max_events: usize) -> Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(Error::last_os());
        }
        let mut pipefds = [0 as RawFd; 2];
        if unsafe { libc::pipe(pipefds.as_mut_ptr()) } != 0 {
            let err = Error::last_os();
            unsafe { libc::close(kq) };
            return Err(err);
        }
        let (wake_r, wake_w) = (pipefds[0], pipefds[1]);
        let close_all = || unsafe {
            libc::close(wake_r);
            libc::close(wake_w);
            libc::close(kq);
        };
        if let Err(e) = set_nonblock_cloexec(wake_r).and_then(|_| set_nonblock_cloexec(wake_w)) {
            close_all();
            return Err(e);
        }

        let change = libc::kevent {
            ident: wake_r as libc::uintptr_t,
            filter: libc::EVFILT_READ,
            flags: libc::EV_ADD,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        if unsafe { libc::kevent(kq, &change, 1, ptr::null_mut(), 0, ptr::null()) } < 0 {
            let err = Error::last_os();
            close_all();
            return Err(err);
        }

        Ok(Self {
            kq,
            wake_r,
            wake_w,
            shutdown: AtomicBool::new(false),
            events: UnsafeCell::new(Vec::with_capacity(max_events.max(1))),
        })
    }

    /// Register read+write interest, edge-triggered (`EV_CLEAR`). Done
    /// once per fd; closing the fd is the only removal.
    pub fn register(&self, fd: RawFd) -> Result<()> {
        let changes = [
            libc::kevent {
                ident: fd as libc::uintptr_t,
                filter: libc::EVFILT_READ,
                flags: libc::EV_ADD | libc::EV_CLEAR,
                fflags: 0,
                data: 0,
                udata: ptr::null_mut(),
            },
            libc::kevent {
                ident: fd as libc::uintptr_t,
                filter: libc::EVFILT_WRITE,
                flags: libc::EV_ADD | libc::EV_CLEAR,
                fflags: 0,
                data: 0,
                udata: ptr::null_mut(),
            },
        ];
        if unsafe { libc::kevent(self.kq, changes.as_ptr(), 2, ptr::null_mut(), 0, ptr::null()) }
            < 0
        {
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
                libc::kevent(
                    self.kq,
                    ptr::null(),
                    0,
                    buf.as_mut_ptr(),
                    buf.capacity() as libc::c_int,
                    ptr::null(),
                )
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
            let fd = e.ident as RawFd;
            if fd == self.wake_r {
                self.drain_wake();
                continue;
            }
            // EV_EOF arrives on the same filters; the drain loop observes
            // it as a zero-byte read or an errored write.
            out.push(PollerEvent {
                fd,
                readable: e.filter == libc::EVFILT_READ,
                writable: e.filter == libc::EVFILT_WRITE,
            });
        }
        Some(out)
    }

    /// Flag shutdown and kick the waiter out of `kevent`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let one = [1u8];
        unsafe {
            libc::write(self.wake_w, one.as_ptr() as *const libc::c_void, 1);
        }
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 64];
        unsafe {
            libc::read(self.wake_r, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_r);
            libc::close(self.wake_w);
            libc::close(self.kq);
        }
    }
}
