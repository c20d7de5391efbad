//! eventfd wake channel (Linux)
//!
//! Every `wake` adds 1 to the eventfd counter; a dispatcher that sees the
//! fd readable consumes the whole counter with one read. All dispatchers
//! poll the same fd. After `wake_all` nobody reads any more, so the fd
//! stays readable and every later wait returns at once.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use svcio_core::error::{SvcError, SvcResult};
use svcio_core::kwarn;

use super::{poll_timeout_ms, WakeChannel};

pub struct EventFdWake {
    fd: RawFd,
    closed: AtomicBool,
}

impl EventFdWake {
    pub fn new() -> SvcResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(SvcError::Os(Errno::last() as i32));
        }
        Ok(Self {
            fd,
            closed: AtomicBool::new(false),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    fn signal(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN: counter saturated, a wake is already pending
        if ret < 0 && Errno::last() != Errno::EAGAIN {
            kwarn!("eventfd write failed: {}", Errno::last());
        }
    }

    fn consume(&self) -> bool {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        ret == std::mem::size_of::<u64>() as isize
    }
}

impl WakeChannel for EventFdWake {
    fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, poll_timeout_ms(timeout)) };
        if n <= 0 || self.closed.load(Ordering::Acquire) {
            // timeout, EINTR, or stopping: leave the counter for the others
            return false;
        }
        self.consume()
    }

    fn wake(&self) {
        self.signal();
    }

    fn wake_all(&self) {
        self.closed.store(true, Ordering::Release);
        self.signal();
    }
}

impl Drop for EventFdWake {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}
