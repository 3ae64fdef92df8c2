//! Completion based I/O multiplexing.
//!
//! A [`Multiplexer`](multiplexer::Multiplexer) drives asynchronous operations on handles
//! attached to it: files, stream sockets, listening sockets and auto-reset events. Two kernel
//! backends are provided, io_uring on Linux and I/O completion ports on Windows, plus a blocking
//! multiplexer that runs every operation on the calling thread and works everywhere.
//!
//! Operations are started through a [`Sender`](sender::Sender), either connected to a
//! [`Receiver`](sender::Receiver) or turned into a future. Nothing happens until the
//! multiplexer is pumped: [`pump`](multiplexer::Multiplexer::pump) hands recorded requests to
//! the kernel, reaps completions and runs the receivers of concluded operations.
//!
//! ```no_run
//! use std::rc::Rc;
//! use iomux::handle::{EventHandle, Handle};
//! use iomux::multiplexer::AnyMultiplexer;
//! use iomux::Deadline;
//!
//! let multiplexer = Rc::new(AnyMultiplexer::create()?);
//! let mut event = EventHandle::new()?;
//! event.attach(multiplexer)?;
//! event.signal()?;
//! event.wait(Deadline::Never)?;
//! # Ok::<(), iomux::Error>(())
//! ```
#![warn(rust_2018_idioms)]

mod deadline;
pub use deadline::Deadline;

mod error;
pub use error::{Error, Result};

pub mod handle;
pub mod multiplexer;
pub mod operation;
pub mod sender;

mod sys;

#[cfg(target_os = "linux")]
pub use sys::linux as io_uring;

#[cfg(windows)]
pub use sys::windows as iocp;
