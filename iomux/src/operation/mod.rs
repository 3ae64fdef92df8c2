//! Operation state shared by all multiplexers.
//!
//! An operation lives in storage provided by the caller. The multiplexer only borrows it between
//! submission and conclusion; see [`Status`] for the lifecycle and [`Listener`] for how the
//! owner learns about transitions.
mod core;
pub use self::core::{Listener, OperationCore, Status};
pub(crate) use self::core::{complete, erase_listener, flush, notify_submitted};

mod defer;
pub(crate) use defer::DeferList;

mod storage;
pub use storage::{OperationStorage, StoragePtr, StorageRequirements, INLINE_STORAGE_SIZE};

pub mod composite;
