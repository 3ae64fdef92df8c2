//! The io_uring backend.
//!
//! The submission and completion rings are mapped into the process and driven directly through
//! the `io_uring_setup`, `io_uring_enter` and `io_uring_register` system calls.
mod abi;
pub use abi::Sqe;

mod files;
pub use files::Connector;

mod multiplexer;
pub use multiplexer::{is_supported, IoUringMultiplexer, IoUringOptions};

mod operations;

mod record;
pub use record::RecordContext;

mod ring;
mod user_data;
