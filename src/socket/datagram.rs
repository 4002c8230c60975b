//! Message-oriented sockets.

use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::RawFd;

use crate::context::IoContext;
use crate::engine::{EngineKind, EngineOp};
use crate::error::{Error, Result};
use crate::op::Direction;
use crate::socket::ops::{RecvFromOp, RecvOp, SendOp, SendToOp};
use crate::socket::{
    sync_io, IoControl, Protocol, SocketBase, SocketOption, SocketOptionName, SEND_FLAGS,
};

/// A datagram socket bound to an io context.
///
/// `send`/`receive` work on a connected socket; `send_to`/`receive_from`
/// address each datagram individually.
pub struct DatagramSocket {
    base: SocketBase,
}

impl DatagramSocket {
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

    /// Fixes the remote endpoint for `send`/`receive`.
    pub fn connect(&self, endpoint: SocketAddr) -> Result<()> {
        if !self.base.is_open() {
            self.base.open(Protocol::udp_for(endpoint))?;
        }
        self.base
            .with_socket(|s| s.connect(&socket2::SockAddr::from(endpoint)).map_err(Error::from))
    }

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

    pub fn receive(&self, buf: &mut [u8], flags: i32) -> Result<usize> {
        let (fd, _) = self.base.handle()?;
        sync_io(fd, Direction::Read, || {
            // SAFETY: the caller's buffer outlives the call.
            unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags) }
        })
    }

    pub fn send_to(&self, buf: &[u8], dest: SocketAddr, flags: i32) -> Result<usize> {
        let (fd, _) = self.base.handle()?;
        let (storage, len) = super::addr::to_storage(dest);
        sync_io(fd, Direction::Write, || {
            // SAFETY: buffer and address storage outlive the call.
            unsafe {
                libc::sendto(
                    fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    flags | SEND_FLAGS,
                    &storage as *const _ as *const libc::sockaddr,
                    len,
                )
            }
        })
    }

    pub fn receive_from(&self, buf: &mut [u8], flags: i32) -> Result<(usize, SocketAddr)> {
        let (fd, _) = self.base.handle()?;
        // SAFETY: sockaddr_storage is plain old data; all-zero is valid.
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut addr_len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = sync_io(fd, Direction::Read, || {
            // SAFETY: buffer and storage outlive the call.
            unsafe {
                libc::recvfrom(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    flags,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut addr_len,
                )
            }
        })?;
        let peer = super::addr::from_storage(&storage, addr_len)?;
        Ok((n, peer))
    }

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
            let op = super::ops::proactor_recv(fd, buf, flags, false, token, handler);
            self.base.start_io(fd, Direction::Read, EngineOp::Completion(op));
            return;
        }
        let _ = token;
        let op = RecvOp::new(fd, buf, flags, false, handler);
        self.base.start_io(fd, Direction::Read, EngineOp::Readiness(op));
    }

    pub fn async_send_to(
        &self,
        buf: Vec<u8>,
        dest: SocketAddr,
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
            let op = super::ops::proactor_send_to(fd, buf, dest, flags, token, handler);
            self.base.start_io(fd, Direction::Write, EngineOp::Completion(op));
            return;
        }
        let _ = token;
        let op = SendToOp::new(fd, buf, dest, flags, handler);
        self.base.start_io(fd, Direction::Write, EngineOp::Readiness(op));
    }

    pub fn async_receive_from(
        &self,
        buf: Vec<u8>,
        flags: i32,
        handler: impl FnOnce(Result<(usize, SocketAddr)>, Vec<u8>) + Send + 'static,
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
            let op = super::ops::proactor_recv_from(fd, buf, flags, token, handler);
            self.base.start_io(fd, Direction::Read, EngineOp::Completion(op));
            return;
        }
        let _ = token;
        let op = RecvFromOp::new(fd, buf, flags, handler);
        self.base.start_io(fd, Direction::Read, EngineOp::Readiness(op));
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

impl Drop for DatagramSocket {
    fn drop(&mut self) {
        let _ = self.base.close();
    }
}
