//! The I/O completion port backend.
//!
//! Reads and writes go through `NtReadFile`/`NtWriteFile` with a status block from the slot
//! pool, and event waits through wait completion packets, so that every completion arrives on
//! the same port.
mod multiplexer;
pub use multiplexer::{Connector, IocpMultiplexer, IocpOptions};

pub(crate) mod ntapi;
mod operations;
