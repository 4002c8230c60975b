//! Connected byte-stream sockets.

use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::RawFd;

use socket2::Socket;

use crate::context::IoContext;
use crate::engine::{EngineKind, EngineOp};
use crate::error::{last_errno, Error, Result};
use crate::op::Direction;
use crate::socket::ops::{ConnectOp, RecvOp, SendOp};
use crate::socket::{
    sync_io, IoControl, Protocol, SocketBase, SocketOption, SocketOptionName, SEND_FLAGS,
};

/// A stream socket bound to an io context.
///
/// Every operation exists in a synchronous form returning a [`Result`] and an
/// asynchronous form delivering the result to a handler on a `run()` worker.
/// Asynchronous transfers take an owned buffer and hand it back to the
/// handler together with the byte count.
pub struct StreamSocket {
    base: SocketBase,
}

impl StreamSocket {
    /// A closed socket; `open` or `connect` gives it a descriptor.
    pub fn new(ctx: &IoContext) -> Self {
        Self {
            base: SocketBase::new(ctx),
        }
    }

    pub(crate) fn from_parts(ctx: &IoContext, socket: Socket) -> Self {
        Self {
            base: SocketBase::adopt(ctx, socket),
        }
    }

    pub fn open(&self, protocol: Protocol) -> Result<()> {
        self.base.open(protocol)
    }

    /// Cancels outstanding operations with operation-aborted and releases the
    /// descriptor.
    pub fn close(&self) -> Result<()> {
        self.base.close()
    }

    pub fn is_open(&self) -> bool {
        self.base.is_open()
    }

    pub fn bind(&self, endpoint: SocketAddr) -> Result<()> {
        self.base.bind(endpoint)
    }

    /// Connects to `endpoint`, opening the socket for the matching family
    /// first if needed. Blocks until the connection resolves.
    pub fn connect(&self, endpoint: SocketAddr) -> Result<()> {
        if !self.base.is_open() {
            self.base.open(Protocol::tcp_for(endpoint))?;
        } else if self.base.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        let (fd, _) = self.base.handle()?;
        let (storage, len) = super::addr::to_storage(endpoint);
        // SAFETY: the address storage lives on this frame; connect copies it.
        let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc == 0 {
            return Ok(());
        }
        match last_errno() {
            // Interrupted or in progress: the connection continues in the
            // background; wait for writability and read the deferred error.
            libc::EINTR | libc::EINPROGRESS | libc::EALREADY => {
                super::poll_wait(fd, Direction::Write)?;
                super::take_so_error(fd)
            }
            libc::EISCONN => Ok(()),
            errno => Err(Error::from_errno(errno)),
        }
    }

    /// Starts an asynchronous connect. The handler observes ok once the
    /// connection is established, or the deferred connect error.
    pub fn async_connect(
        &self,
        endpoint: SocketAddr,
        handler: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        if !self.base.is_open() {
            if let Err(err) = self.base.open(Protocol::tcp_for(endpoint)) {
                self.base.ctx().post(move || handler(Err(err)));
                return;
            }
        } else if self.base.is_connected() {
            self.base
                .ctx()
                .post(move || handler(Err(Error::AlreadyConnected)));
            return;
        }
        let (fd, token) = match self.base.handle() {
            Ok(h) => h,
            Err(err) => {
                self.base.ctx().post(move || handler(Err(err)));
                return;
            }
        };

        #[cfg(target_os = "linux")]
        if self.base.ctx().engine_kind() == EngineKind::Completion {
            let op = super::ops::proactor_connect(fd, endpoint, token, handler);
            self.base.start_io(fd, Direction::Write, EngineOp::Completion(op));
            return;
        }
        let _ = token;

        // Issue the non-blocking connect here; the engine then waits for the
        // descriptor to report writable and reads the deferred error.
        let (storage, len) = super::addr::to_storage(endpoint);
        // SAFETY: the address storage lives on this frame; connect copies it.
        let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc == 0 {
            self.base.ctx().post(move || handler(Ok(())));
            return;
        }
        match last_errno() {
            libc::EINPROGRESS | libc::EINTR => {
                let op = ConnectOp::new(fd, handler);
                self.base.start_io(fd, Direction::Write, EngineOp::Readiness(op));
            }
            errno => {
                let err = Error::from_errno(errno);
                self.base.ctx().post(move || handler(Err(err)));
            }
        }
    }

    /// Sends from `buf`, blocking until at least one byte is accepted.
    pub fn send(&self, buf: &[u8], flags: i32) -> Result<usize> {
        let (fd, _) = self.base.handle()?;
        sync_io(fd, Direction::Write, || {
            // SAFETY: the caller's buffer outlives the call.
            unsafe {
                libc::send(
                    fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    flags | SEND_FLAGS,
                )
            }
        })
    }

    /// Receives into `buf`, blocking until data, end of stream, or an error.
    /// A clean shutdown by the peer reads as zero bytes with [`Error::Eof`].
    pub fn receive(&self, buf: &mut [u8], flags: i32) -> Result<usize> {
        let (fd, _) = self.base.handle()?;
        let n = sync_io(fd, Direction::Read, || {
            // SAFETY: the caller's buffer outlives the call.
            unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags) }
        })?;
        if n == 0 && !buf.is_empty() {
            return Err(Error::Eof);
        }
        Ok(n)
    }

    /// Starts an asynchronous send of `buf`. The handler receives the result
    /// and the buffer back.
    pub fn async_send(
        &self,
        buf: Vec<u8>,
        flags: i32,
        handler: impl FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    ) {
        let (fd, token) = match self.base.handle() {
            Ok(h) => h,
            Err(err) => {
                self.base.ctx().post(move || handler(Err(err), buf));
                return;
            }
        };
        #[cfg(target_os = "linux")]
        if self.base.ctx().engine_kind() == EngineKind::Completion {
            let op = super::ops::proactor_send(fd, buf, flags, token, handler);
            self.base.start_io(fd, Direction::Write, EngineOp::Completion(op));
            return;
        }
        let _ = token;
        let op = SendOp::new(fd, buf, flags, handler);
        self.base.start_io(fd, Direction::Write, EngineOp::Readiness(op));
    }

    /// Starts an asynchronous receive into `buf` (up to its length). The
    /// handler receives the result and the buffer back; a clean shutdown by
    /// the peer reads as [`Error::Eof`]. `MSG_OOB` waits on the exceptional
    /// condition instead of plain readability.
    pub fn async_receive(
        &self,
        buf: Vec<u8>,
        flags: i32,
        handler: impl FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    ) {
        let (fd, token) = match self.base.handle() {
            Ok(h) => h,
            Err(err) => {
                self.base.ctx().post(move || handler(Err(err), buf));
                return;
            }
        };
        #[cfg(target_os = "linux")]
        if self.base.ctx().engine_kind() == EngineKind::Completion {
            let op = super::ops::proactor_recv(fd, buf, flags, true, token, handler);
            self.base.start_io(fd, Direction::Read, EngineOp::Completion(op));
            return;
        }
        let _ = token;
        let dir = if flags & libc::MSG_OOB != 0 {
            Direction::Except
        } else {
            Direction::Read
        };
        let op = RecvOp::new(fd, buf, flags, true, handler);
        self.base.start_io(fd, dir, EngineOp::Readiness(op));
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.base.shutdown(how)
    }

    pub fn local_endpoint(&self) -> Result<SocketAddr> {
        self.base.local_endpoint()
    }

    pub fn remote_endpoint(&self) -> Result<SocketAddr> {
        self.base.remote_endpoint()
    }

    pub fn set_option(&self, option: SocketOption) -> Result<()> {
        self.base.set_option(option)
    }

    pub fn get_option(&self, name: SocketOptionName) -> Result<SocketOption> {
        self.base.get_option(name)
    }

    pub fn io_control(&self, cmd: IoControl) -> Result<usize> {
        self.base.io_control(cmd)
    }

    pub fn native_handle(&self) -> Result<RawFd> {
        self.base.native_handle()
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        let _ = self.base.close();
    }
}
