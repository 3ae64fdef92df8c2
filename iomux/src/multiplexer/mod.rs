//! The generic multiplexer interface.
//!
//! A multiplexer drives operations on attached handles. Backends implement the four required
//! methods of [`Multiplexer`] plus [`AsyncOperationImpl`] for every operation they support
//! natively; everything else is provided here on top of the type erased
//! [`OperationDescriptor`] tables.
use std::any::Any;
use std::ops::{AddAssign, BitOr};
use std::ptr::NonNull;

use log::error;

use crate::deadline::Deadline;
use crate::handle::{Connector, Handle, HandleType, NativeHandle};
use crate::operation::{notify_submitted, Listener, OperationStorage, Status, StoragePtr};
use crate::{Error, Result};

mod any;
pub use any::AnyMultiplexer;

mod blocking;
pub use blocking::BlockingMultiplexer;

mod descriptor;
pub use descriptor::{
    AsyncOperation, AsyncOperationImpl, BlockingState, OperationDescriptor, OperationPtr,
    PostSynchronousCompletion,
};

mod relation;
pub use relation::{HandleRelation, RelationBuilder, RelationTable};

pub(crate) mod slot_pool;

/// Selects the work done by one call to [`Multiplexer::pump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpMode(u8);

impl PumpMode {
    /// Hand recorded requests to the kernel.
    pub const SUBMIT: PumpMode = PumpMode(1 << 0);
    /// Reap kernel completions, waiting up to the deadline for the first one.
    pub const COMPLETE: PumpMode = PumpMode(1 << 1);
    /// Run the listener callbacks of completed operations.
    pub const FLUSH: PumpMode = PumpMode(1 << 2);
    pub const ALL: PumpMode = PumpMode(0b111);

    #[inline]
    pub fn contains(self, other: PumpMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PumpMode {
    type Output = PumpMode;

    fn bitor(self, rhs: PumpMode) -> PumpMode {
        PumpMode(self.0 | rhs.0)
    }
}

impl Default for PumpMode {
    fn default() -> Self {
        PumpMode::ALL
    }
}

/// Work done by one or more pumps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStatistics {
    /// Requests handed to the kernel.
    pub submitted: usize,
    /// Kernel completions reaped.
    pub completed: usize,
    /// Operations concluded.
    pub concluded: usize,
}

impl PumpStatistics {
    pub fn made_progress(&self) -> bool {
        self.submitted + self.completed + self.concluded > 0
    }
}

impl AddAssign for PumpStatistics {
    fn add_assign(&mut self, other: PumpStatistics) {
        self.submitted += other.submitted;
        self.completed += other.completed;
        self.concluded += other.concluded;
    }
}

/// Attach and detach handles of type `H`.
pub trait Connect<H: Handle>: Multiplexer + Sized {
    fn attach(&self, native: &NativeHandle) -> Result<Connector>;

    fn detach(&self, native: &NativeHandle, connector: &Connector) -> Result<()>;
}

pub trait Multiplexer: 'static {
    fn name(&self) -> &'static str;

    /// The concrete multiplexer, for descriptor functions to downcast.
    fn as_any(&self) -> &dyn Any;

    fn find_handle_relation(&self, handle: HandleType) -> Result<&'static HandleRelation>;

    /// Make progress: submit, reap and conclude, waiting at most until `deadline` for a
    /// completion. Interrupted waits and expired deadlines are not errors.
    fn pump(&self, mode: PumpMode, deadline: Deadline) -> Result<PumpStatistics>;

    /// Construct an operation in `storage` from `args`. Nothing is submitted.
    ///
    /// # Safety
    /// `storage` must stay valid and unmoved until the returned pointer is dropped, and the
    /// listener, if any, must outlive the operation.
    unsafe fn construct(
        &self,
        descriptor: &OperationDescriptor,
        storage: StoragePtr,
        args: &mut dyn Any,
        listener: Option<NonNull<dyn Listener>>,
    ) -> Result<OperationPtr> {
        let core = (descriptor.construct)(storage, args, listener)?;
        Ok(OperationPtr::new(core, descriptor.destroy))
    }

    /// Submit a constructed operation.
    ///
    /// On [`Error::TooManyConcurrentAsyncOperations`] the operation is left initialized and
    /// can be started again once other operations completed.
    ///
    /// # Safety
    /// The operation must not be moved or dropped until it concluded.
    unsafe fn start(&self, descriptor: &OperationDescriptor, operation: &OperationPtr) -> Result<()> {
        (descriptor.start)(self.as_any(), operation.as_ptr())?;
        notify_submitted(operation.as_ptr());
        Ok(())
    }

    /// # Safety
    /// See [`Multiplexer::construct`] and [`Multiplexer::start`].
    unsafe fn construct_and_start(
        &self,
        descriptor: &OperationDescriptor,
        storage: StoragePtr,
        args: &mut dyn Any,
        listener: Option<NonNull<dyn Listener>>,
    ) -> Result<OperationPtr> {
        let operation = self.construct(descriptor, storage, args, listener)?;
        self.start(descriptor, &operation)?;
        Ok(operation)
    }

    /// Request cancellation. The operation still concludes through the usual path, with
    /// [`Error::OperationCanceled`] if the cancellation won the race. Cancelling an operation
    /// that already completed does nothing.
    fn cancel(&self, descriptor: &OperationDescriptor, operation: &OperationPtr) -> Result<()> {
        match operation.core().status() {
            Status::Submitted => unsafe { (descriptor.cancel)(self.as_any(), operation.as_ptr()) },
            _ => Ok(()),
        }
    }

    /// Run one operation to conclusion on the calling thread, pumping as needed.
    fn block(&self, descriptor: &OperationDescriptor, args: &mut dyn Any) -> Result<()> {
        if let Some(block) = descriptor.block {
            return block(args);
        }

        let mut storage = OperationStorage::new();
        let ptr = storage.reserve(descriptor.requirements())?;
        let operation = unsafe { self.construct(descriptor, ptr, args, None)? };

        loop {
            match unsafe { self.start(descriptor, &operation) } {
                Ok(()) => break,
                Err(Error::TooManyConcurrentAsyncOperations) => {
                    self.pump(PumpMode::ALL, Deadline::Never)?;
                }
                Err(err) => return Err(err),
            }
        }

        while !operation.core().is_concluded() {
            if let Err(err) = self.pump(PumpMode::ALL, Deadline::Never) {
                // The operation is still owned by the kernel; dropping it aborts.
                error!("pump failed while blocking on {}: {}", descriptor.name(), err);
                return Err(err);
            }
        }

        operation.core().result()?;
        unsafe { (descriptor.take_output)(operation.as_ptr(), args) };
        Ok(())
    }
}
