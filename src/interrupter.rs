//! Kernel-visible wakeup for blocked multiplexer calls.
//!
//! A non-blocking self-pipe: the read side is registered with the poller, and
//! `signal()` makes it readable from any thread. Used to break a worker out
//! of the kernel when new work, an earlier timer deadline, or a stop request
//! arrives.

use std::io;
use std::os::unix::io::RawFd;

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

pub(crate) struct Interrupter {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Interrupter {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: plain pipe2 call writing into a two-element fd array.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// Makes the read side ready. Idempotent, never blocks, safe from any
    /// thread. A full pipe already guarantees a pending wakeup, so the write
    /// result is ignored.
    pub(crate) fn signal(&self) {
        let byte = [1u8];
        // SAFETY: writes one byte from a live stack buffer to our own fd.
        unsafe {
            let _ = libc::write(self.write_fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    /// Drains pending wakeup bytes. Returns whether any wakeup was pending.
    pub(crate) fn reset(&self) -> bool {
        let mut drained = false;
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: reads into a live stack buffer from our own fd.
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n > 0 {
                drained = true;
                continue;
            }
            // 0 (never happens on an open pipe) or EAGAIN both mean empty.
            return drained;
        }
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub(crate) fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut SourceFd(&self.read_fd), token, Interest::READABLE)
    }
}

impl Drop for Interrupter {
    fn drop(&mut self) {
        // SAFETY: both fds were created by us and are closed exactly once.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_then_reset_reports_pending() {
        let intr = Interrupter::new().unwrap();
        assert!(!intr.reset(), "fresh pipe has nothing pending");
        intr.signal();
        intr.signal();
        assert!(intr.reset());
        assert!(!intr.reset(), "reset drains everything");
    }
}
