//! Per-operation records for socket I/O.
//!
//! The readiness records run one non-blocking syscall per perform attempt and
//! keep their result in a slot until completion. The completion builders
//! describe the same operations for the kernel and interpret the raw result
//! when it comes back.

use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::Weak;

use socket2::Socket;

use crate::context::IoContext;
use crate::error::{is_would_block, last_errno, Error, Result};
use crate::op::{Outcome, ReactorOp};
use crate::socket::stream::StreamSocket;
use crate::socket::{addr, take_so_error, CancelToken, SEND_FLAGS};

#[cfg(target_os = "linux")]
use crate::proactor::{MsgStorage, OpKind, ProactorOp, SockAddrStorage};

/// Builds the peer socket for a freshly accepted descriptor.
fn adopt_stream(ctx: &IoContext, fd: RawFd) -> StreamSocket {
    // SAFETY: ownership of the descriptor transfers to the new socket.
    let socket = unsafe { Socket::from_raw_fd(fd) };
    StreamSocket::from_parts(ctx, socket)
}

pub(crate) struct RecvOp {
    fd: RawFd,
    buf: Vec<u8>,
    flags: i32,
    stream: bool,
    result: Option<Result<usize>>,
    handler: Box<dyn FnOnce(Result<usize>, Vec<u8>) + Send>,
}

impl RecvOp {
    pub(crate) fn new(
        fd: RawFd,
        buf: Vec<u8>,
        flags: i32,
        stream: bool,
        handler: impl FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    ) -> Box<Self> {
        Box::new(Self {
            fd,
            buf,
            flags,
            stream,
            result: None,
            handler: Box::new(handler),
        })
    }
}

impl ReactorOp for RecvOp {
    fn perform(&mut self) -> Outcome {
        loop {
            // SAFETY: the buffer is owned by this record and outlives the call.
            let n = unsafe {
                libc::recv(
                    self.fd,
                    self.buf.as_mut_ptr() as *mut libc::c_void,
                    self.buf.len(),
                    self.flags,
                )
            };
            if n >= 0 {
                let n = n as usize;
                self.result = Some(if n == 0 && self.stream && !self.buf.is_empty() {
                    Err(Error::Eof)
                } else {
                    Ok(n)
                });
                return Outcome::Complete;
            }
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            if is_would_block(errno) {
                return Outcome::Retry;
            }
            self.result = Some(Err(Error::from_errno(errno)));
            return Outcome::Complete;
        }
    }

    fn fail(&mut self, err: Error) {
        self.result = Some(Err(err));
    }

    fn complete(self: Box<Self>) {
        let this = *self;
        let result = this.result.unwrap_or(Err(Error::Aborted));
        (this.handler)(result, this.buf)
    }
}

pub(crate) struct SendOp {
    fd: RawFd,
    buf: Vec<u8>,
    flags: i32,
    result: Option<Result<usize>>,
    handler: Box<dyn FnOnce(Result<usize>, Vec<u8>) + Send>,
}

impl SendOp {
    pub(crate) fn new(
        fd: RawFd,
        buf: Vec<u8>,
        flags: i32,
        handler: impl FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    ) -> Box<Self> {
        Box::new(Self {
            fd,
            buf,
            flags: flags | SEND_FLAGS,
            result: None,
            handler: Box::new(handler),
        })
    }
}

impl ReactorOp for SendOp {
    fn perform(&mut self) -> Outcome {
        loop {
            // SAFETY: the buffer is owned by this record and outlives the call.
            let n = unsafe {
                libc::send(
                    self.fd,
                    self.buf.as_ptr() as *const libc::c_void,
                    self.buf.len(),
                    self.flags,
                )
            };
            if n >= 0 {
                self.result = Some(Ok(n as usize));
                return Outcome::Complete;
            }
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            if is_would_block(errno) {
                return Outcome::Retry;
            }
            self.result = Some(Err(Error::from_errno(errno)));
            return Outcome::Complete;
        }
    }

    fn fail(&mut self, err: Error) {
        self.result = Some(Err(err));
    }

    fn complete(self: Box<Self>) {
        let this = *self;
        let result = this.result.unwrap_or(Err(Error::Aborted));
        (this.handler)(result, this.buf)
    }
}

pub(crate) struct RecvFromOp {
    fd: RawFd,
    buf: Vec<u8>,
    flags: i32,
    result: Option<Result<(usize, SocketAddr)>>,
    handler: Box<dyn FnOnce(Result<(usize, SocketAddr)>, Vec<u8>) + Send>,
}

impl RecvFromOp {
    pub(crate) fn new(
        fd: RawFd,
        buf: Vec<u8>,
        flags: i32,
        handler: impl FnOnce(Result<(usize, SocketAddr)>, Vec<u8>) + Send + 'static,
    ) -> Box<Self> {
        Box::new(Self {
            fd,
            buf,
            flags,
            result: None,
            handler: Box::new(handler),
        })
    }
}

impl ReactorOp for RecvFromOp {
    fn perform(&mut self) -> Outcome {
        loop {
            // SAFETY: sockaddr_storage is plain old data; all-zero is valid.
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            // SAFETY: buffer and storage are owned by this frame or record.
            let n = unsafe {
                libc::recvfrom(
                    self.fd,
                    self.buf.as_mut_ptr() as *mut libc::c_void,
                    self.buf.len(),
                    self.flags,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if n >= 0 {
                self.result = Some(
                    addr::from_storage(&storage, len).map(|peer| (n as usize, peer)),
                );
                return Outcome::Complete;
            }
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            if is_would_block(errno) {
                return Outcome::Retry;
            }
            self.result = Some(Err(Error::from_errno(errno)));
            return Outcome::Complete;
        }
    }

    fn fail(&mut self, err: Error) {
        self.result = Some(Err(err));
    }

    fn complete(self: Box<Self>) {
        let this = *self;
        let result = this.result.unwrap_or(Err(Error::Aborted));
        (this.handler)(result, this.buf)
    }
}

pub(crate) struct SendToOp {
    fd: RawFd,
    buf: Vec<u8>,
    flags: i32,
    storage: libc::sockaddr_storage,
    storage_len: libc::socklen_t,
    result: Option<Result<usize>>,
    handler: Box<dyn FnOnce(Result<usize>, Vec<u8>) + Send>,
}

impl SendToOp {
    pub(crate) fn new(
        fd: RawFd,
        buf: Vec<u8>,
        dest: SocketAddr,
        flags: i32,
        handler: impl FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
    ) -> Box<Self> {
        let (storage, storage_len) = addr::to_storage(dest);
        Box::new(Self {
            fd,
            buf,
            flags: flags | SEND_FLAGS,
            storage,
            storage_len,
            result: None,
            handler: Box::new(handler),
        })
    }
}

impl ReactorOp for SendToOp {
    fn perform(&mut self) -> Outcome {
        loop {
            // SAFETY: buffer and address storage are owned by this record.
            let n = unsafe {
                libc::sendto(
                    self.fd,
                    self.buf.as_ptr() as *const libc::c_void,
                    self.buf.len(),
                    self.flags,
                    &self.storage as *const _ as *const libc::sockaddr,
                    self.storage_len,
                )
            };
            if n >= 0 {
                self.result = Some(Ok(n as usize));
                return Outcome::Complete;
            }
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            if is_would_block(errno) {
                return Outcome::Retry;
            }
            self.result = Some(Err(Error::from_errno(errno)));
            return Outcome::Complete;
        }
    }

    fn fail(&mut self, err: Error) {
        self.result = Some(Err(err));
    }

    fn complete(self: Box<Self>) {
        let this = *self;
        let result = this.result.unwrap_or(Err(Error::Aborted));
        (this.handler)(result, this.buf)
    }
}

pub(crate) struct AcceptOp {
    fd: RawFd,
    ctx: IoContext,
    result: Option<Result<(RawFd, SocketAddr)>>,
    handler: Box<dyn FnOnce(Result<(StreamSocket, SocketAddr)>) + Send>,
}

impl AcceptOp {
    pub(crate) fn new(
        fd: RawFd,
        ctx: IoContext,
        handler: impl FnOnce(Result<(StreamSocket, SocketAddr)>) + Send + 'static,
    ) -> Box<Self> {
        Box::new(Self {
            fd,
            ctx,
            result: None,
            handler: Box::new(handler),
        })
    }
}

impl ReactorOp for AcceptOp {
    fn perform(&mut self) -> Outcome {
        loop {
            // SAFETY: sockaddr_storage is plain old data; all-zero is valid.
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            // SAFETY: accept4 fills the storage we own; the new descriptor is
            // adopted exactly once at completion.
            let fd = unsafe {
                libc::accept4(
                    self.fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd >= 0 {
                self.result = Some(match addr::from_storage(&storage, len) {
                    Ok(peer) => Ok((fd, peer)),
                    Err(err) => {
                        // SAFETY: the descriptor is ours until adopted.
                        unsafe { libc::close(fd) };
                        Err(err)
                    }
                });
                return Outcome::Complete;
            }
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            if is_would_block(errno) {
                return Outcome::Retry;
            }
            self.result = Some(Err(Error::from_errno(errno)));
            return Outcome::Complete;
        }
    }

    fn fail(&mut self, err: Error) {
        if let Some(Ok((fd, _))) = self.result.take() {
            // SAFETY: an unadopted descriptor must not leak on cancellation.
            unsafe { libc::close(fd) };
        }
        self.result = Some(Err(err));
    }

    fn complete(self: Box<Self>) {
        let this = *self;
        let result = this
            .result
            .unwrap_or(Err(Error::Aborted))
            .map(|(fd, peer)| (adopt_stream(&this.ctx, fd), peer));
        (this.handler)(result)
    }
}

/// Finishes a non-blocking connect once the descriptor reports writable (or
/// an exceptional condition): the deferred error decides the outcome.
pub(crate) struct ConnectOp {
    fd: RawFd,
    result: Option<Result<()>>,
    handler: Box<dyn FnOnce(Result<()>) + Send>,
}

impl ConnectOp {
    pub(crate) fn new(
        fd: RawFd,
        handler: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Box<Self> {
        Box::new(Self {
            fd,
            result: None,
            handler: Box::new(handler),
        })
    }
}

impl ReactorOp for ConnectOp {
    fn perform(&mut self) -> Outcome {
        self.result = Some(take_so_error(self.fd));
        Outcome::Complete
    }

    fn speculative(&self) -> bool {
        false
    }

    fn fail(&mut self, err: Error) {
        self.result = Some(Err(err));
    }

    fn complete(self: Box<Self>) {
        let this = *self;
        let result = this.result.unwrap_or(Err(Error::Aborted));
        (this.handler)(result)
    }
}

/// Maps a completion-engine errno, consulting the socket's cancellation token
/// for codes the kernel cannot attribute. A token still alive means the
/// socket was not closed locally, so the teardown came from the peer.
#[cfg(target_os = "linux")]
pub(crate) fn map_completion_errno(errno: i32, token: &Weak<CancelToken>) -> Error {
    if errno == libc::ECANCELED {
        if token.strong_count() > 0 {
            Error::ConnectionReset
        } else {
            Error::Aborted
        }
    } else {
        Error::from_errno(errno)
    }
}

#[cfg(target_os = "linux")]
pub(crate) fn proactor_recv(
    fd: RawFd,
    buf: Vec<u8>,
    flags: i32,
    stream: bool,
    token: Weak<CancelToken>,
    handler: impl FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
) -> Box<ProactorOp> {
    ProactorOp::new(fd, OpKind::Recv { buf, flags, stream }, move |res, kind| {
        let OpKind::Recv { buf, stream, .. } = kind else {
            unreachable!()
        };
        let result = if res >= 0 {
            let n = res as usize;
            if n == 0 && stream && !buf.is_empty() {
                Err(Error::Eof)
            } else {
                Ok(n)
            }
        } else {
            Err(map_completion_errno(-res, &token))
        };
        handler(result, buf)
    })
}

#[cfg(target_os = "linux")]
pub(crate) fn proactor_send(
    fd: RawFd,
    buf: Vec<u8>,
    flags: i32,
    token: Weak<CancelToken>,
    handler: impl FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
) -> Box<ProactorOp> {
    let flags = flags | SEND_FLAGS;
    ProactorOp::new(fd, OpKind::Send { buf, flags }, move |res, kind| {
        let OpKind::Send { buf, .. } = kind else {
            unreachable!()
        };
        let result = if res >= 0 {
            Ok(res as usize)
        } else {
            Err(map_completion_errno(-res, &token))
        };
        handler(result, buf)
    })
}

#[cfg(target_os = "linux")]
pub(crate) fn proactor_recv_from(
    fd: RawFd,
    buf: Vec<u8>,
    flags: i32,
    token: Weak<CancelToken>,
    handler: impl FnOnce(Result<(usize, SocketAddr)>, Vec<u8>) + Send + 'static,
) -> Box<ProactorOp> {
    let msg = MsgStorage::empty();
    ProactorOp::new(fd, OpKind::RecvFrom { buf, flags, msg }, move |res, kind| {
        let OpKind::RecvFrom { buf, msg, .. } = kind else {
            unreachable!()
        };
        let result = if res >= 0 {
            addr::from_storage(&msg.addr, msg.hdr.msg_namelen).map(|peer| (res as usize, peer))
        } else {
            Err(map_completion_errno(-res, &token))
        };
        handler(result, buf)
    })
}

#[cfg(target_os = "linux")]
pub(crate) fn proactor_send_to(
    fd: RawFd,
    buf: Vec<u8>,
    dest: SocketAddr,
    flags: i32,
    token: Weak<CancelToken>,
    handler: impl FnOnce(Result<usize>, Vec<u8>) + Send + 'static,
) -> Box<ProactorOp> {
    let flags = flags | SEND_FLAGS;
    let msg = MsgStorage::for_dest(dest);
    ProactorOp::new(fd, OpKind::SendTo { buf, flags, msg }, move |res, kind| {
        let OpKind::SendTo { buf, .. } = kind else {
            unreachable!()
        };
        let result = if res >= 0 {
            Ok(res as usize)
        } else {
            Err(map_completion_errno(-res, &token))
        };
        handler(result, buf)
    })
}

#[cfg(target_os = "linux")]
pub(crate) fn proactor_accept(
    fd: RawFd,
    ctx: IoContext,
    token: Weak<CancelToken>,
    handler: impl FnOnce(Result<(StreamSocket, SocketAddr)>) + Send + 'static,
) -> Box<ProactorOp> {
    let storage = SockAddrStorage::empty();
    ProactorOp::new(fd, OpKind::Accept { addr: storage }, move |res, kind| {
        let OpKind::Accept { addr } = kind else {
            unreachable!()
        };
        let result = if res >= 0 {
            addr::from_storage(&addr.storage, addr.len)
                .map(|peer| (adopt_stream(&ctx, res as RawFd), peer))
        } else {
            Err(map_completion_errno(-res, &token))
        };
        handler(result)
    })
}

#[cfg(target_os = "linux")]
pub(crate) fn proactor_connect(
    fd: RawFd,
    dest: SocketAddr,
    token: Weak<CancelToken>,
    handler: impl FnOnce(Result<()>) + Send + 'static,
) -> Box<ProactorOp> {
    let storage = SockAddrStorage::from_addr(dest);
    ProactorOp::new(fd, OpKind::Connect { addr: storage }, move |res, _kind| {
        let result = if res >= 0 {
            Ok(())
        } else {
            Err(map_completion_errno(-res, &token))
        };
        handler(result)
    })
}
