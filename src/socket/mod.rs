//! The socket service: per-socket state and the translation of socket
//! operations into engine operations.
//!
//! Three public socket types share one base: [`StreamSocket`] for connected
//! byte streams, [`SocketListener`] for accepting peers, and
//! [`DatagramSocket`] for message endpoints. The base owns the descriptor,
//! the open/close bookkeeping, and the cancellation token whose lifetime
//! tells in-flight completion operations whether the socket still exists.

pub(crate) mod addr;
mod datagram;
mod listener;
mod ops;
mod stream;

pub use datagram::DatagramSocket;
pub use listener::SocketListener;
pub use stream::StreamSocket;

use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use socket2::{Domain, Protocol as Transport, SockAddr, Socket, Type};

use crate::context::IoContext;
use crate::engine::{EngineKind, EngineOp};
use crate::error::{is_would_block, last_errno, Error, Result};
use crate::op::Direction;

/// `send()` must not raise SIGPIPE on a dead peer.
#[cfg(target_os = "linux")]
pub(crate) const SEND_FLAGS: i32 = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
pub(crate) const SEND_FLAGS: i32 = 0;

/// Address family and transport for `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol {
    pub(crate) domain: Domain,
    pub(crate) ty: Type,
    pub(crate) transport: Option<Transport>,
}

impl Protocol {
    pub fn tcp_v4() -> Self {
        Self {
            domain: Domain::IPV4,
            ty: Type::STREAM,
            transport: Some(Transport::TCP),
        }
    }

    pub fn tcp_v6() -> Self {
        Self {
            domain: Domain::IPV6,
            ty: Type::STREAM,
            transport: Some(Transport::TCP),
        }
    }

    pub fn udp_v4() -> Self {
        Self {
            domain: Domain::IPV4,
            ty: Type::DGRAM,
            transport: Some(Transport::UDP),
        }
    }

    pub fn udp_v6() -> Self {
        Self {
            domain: Domain::IPV6,
            ty: Type::DGRAM,
            transport: Some(Transport::UDP),
        }
    }

    /// Protocol matching an endpoint's family, stream transport.
    pub fn tcp_for(endpoint: SocketAddr) -> Self {
        if endpoint.is_ipv4() {
            Self::tcp_v4()
        } else {
            Self::tcp_v6()
        }
    }

    /// Protocol matching an endpoint's family, datagram transport.
    pub fn udp_for(endpoint: SocketAddr) -> Self {
        if endpoint.is_ipv4() {
            Self::udp_v4()
        } else {
            Self::udp_v6()
        }
    }
}

/// Socket option values for `set_option` / `get_option`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    ReuseAddress(bool),
    KeepAlive(bool),
    Broadcast(bool),
    TcpNoDelay(bool),
    RecvBufferSize(usize),
    SendBufferSize(usize),
    Linger(Option<Duration>),
}

/// Option selectors for `get_option`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOptionName {
    ReuseAddress,
    KeepAlive,
    Broadcast,
    TcpNoDelay,
    RecvBufferSize,
    SendBufferSize,
    Linger,
}

/// Descriptor control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoControl {
    /// Bytes readable without blocking (FIONREAD).
    BytesReadable,
}

/// Liveness marker for an open socket. In-flight completion operations hold a
/// weak reference; whether it upgrades at completion time disambiguates a
/// local close from a peer reset.
pub(crate) struct CancelToken;

struct Core {
    socket: Option<Socket>,
    token: Option<Arc<CancelToken>>,
}

/// State shared by the three socket types.
pub(crate) struct SocketBase {
    ctx: IoContext,
    core: Mutex<Core>,
}

impl SocketBase {
    pub(crate) fn new(ctx: &IoContext) -> Self {
        Self {
            ctx: ctx.clone(),
            core: Mutex::new(Core {
                socket: None,
                token: None,
            }),
        }
    }

    pub(crate) fn ctx(&self) -> &IoContext {
        &self.ctx
    }

    pub(crate) fn open(&self, protocol: Protocol) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if core.socket.is_some() {
            return Err(Error::AlreadyOpen);
        }
        let socket = Socket::new(protocol.domain, protocol.ty, protocol.transport)?;
        if self.ctx.engine_kind() == EngineKind::Readiness {
            socket.set_nonblocking(true)?;
        }
        core.socket = Some(socket);
        core.token = Some(Arc::new(CancelToken));
        Ok(())
    }

    /// Adopts an accepted descriptor.
    pub(crate) fn adopt(ctx: &IoContext, socket: Socket) -> Self {
        Self {
            ctx: ctx.clone(),
            core: Mutex::new(Core {
                socket: Some(socket),
                token: Some(Arc::new(CancelToken)),
            }),
        }
    }

    /// Cancels every outstanding operation with operation-aborted, releases
    /// the descriptor, and expires the cancellation token. Idempotent.
    pub(crate) fn close(&self) -> Result<()> {
        let (socket, token) = {
            let mut core = self.core.lock().unwrap();
            (core.socket.take(), core.token.take())
        };
        let Some(socket) = socket else {
            return Ok(());
        };
        // Expire the token first so late kernel completions observe the close.
        drop(token);
        let fd = socket.as_raw_fd();
        let inner = self.ctx.inner();
        inner.engine().cancel_ops(inner, fd);
        drop(socket);
        Ok(())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.core.lock().unwrap().socket.is_some()
    }

    /// Descriptor plus cancellation token for an async submission.
    pub(crate) fn handle(&self) -> Result<(RawFd, Weak<CancelToken>)> {
        let core = self.core.lock().unwrap();
        match (&core.socket, &core.token) {
            (Some(socket), Some(token)) => Ok((socket.as_raw_fd(), Arc::downgrade(token))),
            _ => Err(Error::BadDescriptor),
        }
    }

    pub(crate) fn with_socket<R>(&self, f: impl FnOnce(&Socket) -> Result<R>) -> Result<R> {
        let core = self.core.lock().unwrap();
        match &core.socket {
            Some(socket) => f(socket),
            None => Err(Error::BadDescriptor),
        }
    }

    pub(crate) fn start_io(&self, fd: RawFd, dir: Direction, op: EngineOp) {
        let inner = self.ctx.inner();
        inner.work_started();
        inner.engine().start_op(inner, fd, dir, op);
    }

    pub(crate) fn bind(&self, endpoint: SocketAddr) -> Result<()> {
        self.with_socket(|s| s.bind(&SockAddr::from(endpoint)).map_err(Error::from))
    }

    pub(crate) fn listen(&self, backlog: u32) -> Result<()> {
        let backlog = if backlog == 0 {
            libc::SOMAXCONN
        } else {
            backlog.min(i32::MAX as u32) as i32
        };
        self.with_socket(|s| s.listen(backlog).map_err(Error::from))
    }

    pub(crate) fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.with_socket(|s| s.shutdown(how).map_err(Error::from))
    }

    pub(crate) fn local_endpoint(&self) -> Result<SocketAddr> {
        self.with_socket(|s| {
            s.local_addr()?
                .as_socket()
                .ok_or(Error::InvalidArgument)
        })
    }

    pub(crate) fn remote_endpoint(&self) -> Result<SocketAddr> {
        self.with_socket(|s| {
            s.peer_addr()?
                .as_socket()
                .ok_or(Error::InvalidArgument)
        })
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.remote_endpoint().is_ok()
    }

    pub(crate) fn native_handle(&self) -> Result<RawFd> {
        self.with_socket(|s| Ok(s.as_raw_fd()))
    }

    pub(crate) fn set_option(&self, option: SocketOption) -> Result<()> {
        self.with_socket(|s| {
            match option {
                SocketOption::ReuseAddress(v) => s.set_reuse_address(v)?,
                SocketOption::KeepAlive(v) => s.set_keepalive(v)?,
                SocketOption::Broadcast(v) => s.set_broadcast(v)?,
                SocketOption::TcpNoDelay(v) => {
                    set_int_option(s.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, v as i32)?
                }
                SocketOption::RecvBufferSize(v) => s.set_recv_buffer_size(v)?,
                SocketOption::SendBufferSize(v) => s.set_send_buffer_size(v)?,
                SocketOption::Linger(v) => s.set_linger(v)?,
            }
            Ok(())
        })
    }

    pub(crate) fn get_option(&self, name: SocketOptionName) -> Result<SocketOption> {
        self.with_socket(|s| {
            Ok(match name {
                SocketOptionName::ReuseAddress => SocketOption::ReuseAddress(s.reuse_address()?),
                SocketOptionName::KeepAlive => SocketOption::KeepAlive(s.keepalive()?),
                SocketOptionName::Broadcast => SocketOption::Broadcast(s.broadcast()?),
                SocketOptionName::TcpNoDelay => SocketOption::TcpNoDelay(
                    get_int_option(s.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY)? != 0,
                ),
                SocketOptionName::RecvBufferSize => {
                    SocketOption::RecvBufferSize(s.recv_buffer_size()?)
                }
                SocketOptionName::SendBufferSize => {
                    SocketOption::SendBufferSize(s.send_buffer_size()?)
                }
                SocketOptionName::Linger => SocketOption::Linger(s.linger()?),
            })
        })
    }

    pub(crate) fn io_control(&self, cmd: IoControl) -> Result<usize> {
        self.with_socket(|s| match cmd {
            IoControl::BytesReadable => {
                let mut avail: libc::c_int = 0;
                // SAFETY: FIONREAD writes a c_int for a valid descriptor.
                let rc = unsafe { libc::ioctl(s.as_raw_fd(), libc::FIONREAD, &mut avail) };
                if rc < 0 {
                    return Err(Error::last_os());
                }
                Ok(avail.max(0) as usize)
            }
        })
    }
}

/// Blocks the calling thread until `fd` is ready for `dir`, retrying on
/// signal interruption. Serves the synchronous operation forms on
/// non-blocking descriptors.
pub(crate) fn poll_wait(fd: RawFd, dir: Direction) -> Result<()> {
    let events = match dir {
        Direction::Read => libc::POLLIN,
        Direction::Write => libc::POLLOUT,
        Direction::Except => libc::POLLPRI,
    };
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    loop {
        // SAFETY: polls one valid pollfd with no timeout.
        let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
        if rc >= 0 {
            return Ok(());
        }
        let errno = last_errno();
        if errno == libc::EINTR {
            continue;
        }
        return Err(Error::from_errno(errno));
    }
}

/// Retries `syscall` through transient interruption and readiness waits
/// until it produces a definite result.
pub(crate) fn sync_io(fd: RawFd, dir: Direction, mut syscall: impl FnMut() -> isize) -> Result<usize> {
    loop {
        let n = syscall();
        if n >= 0 {
            return Ok(n as usize);
        }
        let errno = last_errno();
        if errno == libc::EINTR {
            continue;
        }
        if is_would_block(errno) {
            poll_wait(fd, dir)?;
            continue;
        }
        return Err(Error::from_errno(errno));
    }
}

fn set_int_option(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> Result<()> {
    // SAFETY: writes a c_int option on a valid descriptor.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::last_os());
    }
    Ok(())
}

fn get_int_option(fd: RawFd, level: libc::c_int, name: libc::c_int) -> Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: reads a c_int option on a valid descriptor.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(Error::last_os());
    }
    Ok(value)
}

/// Reads the deferred error of a non-blocking connect.
pub(crate) fn take_so_error(fd: RawFd) -> Result<()> {
    let err = get_int_option(fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
    if err == 0 {
        Ok(())
    } else {
        Err(Error::from_errno(err))
    }
}
