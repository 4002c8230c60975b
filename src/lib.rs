//! An asynchronous event-dispatch engine for sockets and timers.
//!
//! Many concurrent operations share a small pool of worker threads without
//! blocking per operation: workers call [`IoContext::run`] and take turns
//! driving a demultiplexer while the rest execute completion handlers. Two
//! demultiplexers are available behind one seam, fixed when the context is
//! built:
//!
//! - `context`: the io context, its run loop, and work accounting
//! - `reactor`: readiness engine over the system poller
//! - `proactor`: completion engine over io_uring (Linux)
//! - `socket`: stream, listener and datagram sockets with synchronous and
//!   asynchronous operation forms
//! - `timer`: deadline timers with cancellation
//! - `strand`: serialized handler execution
//!
//! Every asynchronous operation invokes its completion handler exactly once,
//! on a thread inside `run()`; closing a socket completes its outstanding
//! operations with [`Error::Aborted`].

mod clock;
mod context;
mod engine;
mod error;
mod interrupter;
mod op;
mod reactor;
mod socket;
mod strand;
mod timer;

#[cfg(target_os = "linux")]
mod proactor;

pub use context::{DISPATCH_DEPTH_LIMIT, IoContext, IoContextBuilder, WorkGuard};
pub use engine::EngineKind;
pub use error::{Error, Result};
pub use socket::{
    DatagramSocket, IoControl, Protocol, SocketListener, SocketOption, SocketOptionName,
    StreamSocket,
};
pub use strand::Strand;
pub use timer::DeadlineTimer;
