//! Accepting sockets.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::context::IoContext;
use crate::engine::{EngineKind, EngineOp};
use crate::error::Result;
use crate::op::Direction;
use crate::socket::ops::AcceptOp;
use crate::socket::stream::StreamSocket;
use crate::socket::{IoControl, Protocol, SocketBase, SocketOption, SocketOptionName};

/// A listening socket that accepts stream peers on its io context.
pub struct SocketListener {
    base: SocketBase,
}

impl SocketListener {
    pub fn new(ctx: &IoContext) -> Self {
        Self {
            base: SocketBase::new(ctx),
        }
    }

    pub fn open(&self, protocol: Protocol) -> Result<()> {
        self.base.open(protocol)
    }

    pub fn close(&self) -> Result<()> {
        self.base.close()
    }

    pub fn is_open(&self) -> bool {
        self.base.is_open()
    }

    pub fn bind(&self, endpoint: SocketAddr) -> Result<()> {
        self.base.bind(endpoint)
    }

    /// Starts listening. A backlog of zero selects the OS default.
    pub fn listen(&self, backlog: u32) -> Result<()> {
        self.base.listen(backlog)
    }

    /// Accepts one connection, blocking until a peer arrives. The peer socket
    /// joins the same io context.
    pub fn accept(&self) -> Result<(StreamSocket, SocketAddr)> {
        let (fd, _) = self.base.handle()?;
        loop {
            match self.base.with_socket(|s| s.accept().map_err(crate::Error::from)) {
                Ok((peer, peer_addr)) => {
                    if self.base.ctx().engine_kind() == EngineKind::Readiness {
                        peer.set_nonblocking(true)?;
                    }
                    let endpoint = peer_addr.as_socket().ok_or(crate::Error::InvalidArgument)?;
                    return Ok((StreamSocket::from_parts(self.base.ctx(), peer), endpoint));
                }
                Err(crate::Error::Sys(ref err))
                    if err.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    super::poll_wait(fd, Direction::Read)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Starts an asynchronous accept. The handler receives the peer socket
    /// and its endpoint.
    pub fn async_accept(
        &self,
        handler: impl FnOnce(Result<(StreamSocket, SocketAddr)>) + Send + 'static,
    ) {
        let (fd, token) = match self.base.handle() {
            Ok(h) => h,
            Err(err) => {
                self.base.ctx().post(move || handler(Err(err)));
                return;
            }
        };
        #[cfg(target_os = "linux")]
        if self.base.ctx().engine_kind() == EngineKind::Completion {
            let op = super::ops::proactor_accept(fd, self.base.ctx().clone(), token, handler);
            self.base.start_io(fd, Direction::Read, EngineOp::Completion(op));
            return;
        }
        let _ = token;
        let op = AcceptOp::new(fd, self.base.ctx().clone(), handler);
        self.base.start_io(fd, Direction::Read, EngineOp::Readiness(op));
    }

    pub fn local_endpoint(&self) -> Result<SocketAddr> {
        self.base.local_endpoint()
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

impl Drop for SocketListener {
    fn drop(&mut self) {
        let _ = self.base.close();
    }
}
