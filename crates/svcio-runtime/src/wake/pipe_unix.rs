//! Self-pipe wake channel (unix without eventfd)
//!
//! One byte per wake on a non-blocking pipe; a woken dispatcher drains
//! whatever is buffered.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use svcio_core::error::{SvcError, SvcResult};
use svcio_core::kwarn;

use super::{poll_timeout_ms, WakeChannel};

pub struct PipeWake {
    reader: OwnedFd,
    writer: OwnedFd,
    closed: AtomicBool,
}

impl PipeWake {
    pub fn new() -> SvcResult<Self> {
        let (reader, writer) = nix::unistd::pipe().map_err(|e| SvcError::Os(e as i32))?;
        for fd in [reader.as_raw_fd(), writer.as_raw_fd()] {
            fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(|e| SvcError::Os(e as i32))?;
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| SvcError::Os(e as i32))?;
        }
        Ok(Self {
            reader,
            writer,
            closed: AtomicBool::new(false),
        })
    }

    fn signal(&self) {
        let byte = 1u8;
        let ret = unsafe {
            libc::write(
                self.writer.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
        // EAGAIN: pipe full, readers have plenty to wake on
        if ret < 0 && Errno::last() != Errno::EAGAIN {
            kwarn!("wake pipe write failed: {}", Errno::last());
        }
    }

    fn drain(&self) -> bool {
        let mut buf = [0u8; 64];
        let mut consumed = false;
        loop {
            let n = unsafe {
                libc::read(
                    self.reader.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                return consumed;
            }
            consumed = true;
        }
    }
}

impl WakeChannel for PipeWake {
    fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut pfd = libc::pollfd {
            fd: self.reader.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, poll_timeout_ms(timeout)) };
        if n <= 0 || self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.drain()
    }

    fn wake(&self) {
        self.signal();
    }

    fn wake_all(&self) {
        self.closed.store(true, Ordering::Release);
        self.signal();
    }
}
