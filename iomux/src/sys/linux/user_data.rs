//! Tagged `user_data` values.
//!
//! The kernel copies `user_data` from a submission into its completion without looking at it.
//! Every value is either an address of 0, for requests whose completion is ignored, or the
//! address of an [`IoHandler`] or [`IoSlot`] with tags in the spare bits. Both types are aligned
//! to 8 bytes so the low three bits of their addresses are always clear, and user space
//! addresses never have the top bit set.
//!
//! | bit | meaning                                                                     |
//! |-----|-----------------------------------------------------------------------------|
//! | 0   | the address is an [`IoSlot`] rather than an [`IoHandler`]                   |
//! | 63  | recorded with `IOSQE_CQE_SKIP_SUCCESS`, the completion holds no budget      |
use std::cell::Cell;
use std::ptr::NonNull;

use super::multiplexer::IoUringMultiplexer;
use crate::operation::OperationCore;

pub(crate) const TAG_IO_SLOT: u64 = 1 << 0;
pub(crate) const TAG_UNBUDGETED: u64 = 1 << 63;
const TAG_MASK: u64 = 0b111 | TAG_UNBUDGETED;

/// Whether the completion of a request with this `user_data` was paid for with completion budget.
#[inline]
pub(crate) fn is_budgeted(user_data: u64) -> bool {
    user_data & TAG_UNBUDGETED == 0
}

/// Called with the operation, the index of the slot that completed (0 for direct completions)
/// and the raw kernel result.
pub(crate) type CompletionFn = unsafe fn(&IoUringMultiplexer, NonNull<OperationCore>, usize, i32);

/// Routes completions to an operation. Embedded in the backend state of the operation.
#[repr(C, align(8))]
pub(crate) struct IoHandler {
    operation: Cell<Option<NonNull<OperationCore>>>,
    on_completion: CompletionFn,
}

impl IoHandler {
    pub(crate) fn new(on_completion: CompletionFn) -> IoHandler {
        IoHandler {
            operation: Cell::new(None),
            on_completion,
        }
    }

    /// Bind to the operation owning this handler. The operation address is only known once it
    /// has been written into its storage.
    pub(crate) fn bind(&self, operation: NonNull<OperationCore>) {
        self.operation.set(Some(operation));
    }

    /// `user_data` delivering completions straight to the handler.
    pub(crate) fn user_data(&self) -> u64 {
        self as *const IoHandler as u64
    }
}

/// One of several outstanding requests of a single operation.
#[repr(C, align(8))]
pub(crate) struct IoSlot {
    handler: Cell<Option<NonNull<IoHandler>>>,
    index: usize,
}

impl IoSlot {
    pub(crate) fn new(index: usize) -> IoSlot {
        IoSlot {
            handler: Cell::new(None),
            index,
        }
    }

    pub(crate) fn bind(&self, handler: &IoHandler) {
        self.handler.set(Some(NonNull::from(handler)));
    }

    pub(crate) fn user_data(&self) -> u64 {
        self as *const IoSlot as u64 | TAG_IO_SLOT
    }
}

/// Resolve a completion to its handler.
///
/// # Safety
/// `user_data` must have a zero address or be a value produced by this module whose target is
/// still live.
pub(crate) unsafe fn dispatch(multiplexer: &IoUringMultiplexer, user_data: u64, res: i32) -> bool {
    let address = user_data & !TAG_MASK;
    if address == 0 {
        return false;
    }
    let (handler, index) = if user_data & TAG_IO_SLOT != 0 {
        let slot = &*(address as *const IoSlot);
        match slot.handler.get() {
            Some(handler) => (&*handler.as_ptr(), slot.index),
            None => return false,
        }
    } else {
        (&*(address as *const IoHandler), 0)
    };
    match handler.operation.get() {
        Some(operation) => {
            (handler.on_completion)(multiplexer, operation, index, res);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn never(_: &IoUringMultiplexer, _: NonNull<OperationCore>, _: usize, _: i32) {
        unreachable!()
    }

    #[test]
    fn test_tags_fit_alignment() {
        assert!(std::mem::align_of::<IoHandler>() as u64 > 0b111);
        assert!(std::mem::align_of::<IoSlot>() as u64 > 0b111);

        let handler = IoHandler::new(never);
        assert_eq!(0, handler.user_data() & TAG_MASK);
        let slot = IoSlot::new(3);
        slot.bind(&handler);
        assert_eq!(TAG_IO_SLOT, slot.user_data() & TAG_MASK);
        assert_eq!(slot.user_data() & !TAG_MASK, &slot as *const IoSlot as u64);
        assert!(is_budgeted(slot.user_data()));
        assert!(!is_budgeted(slot.user_data() | TAG_UNBUDGETED));
    }
}
