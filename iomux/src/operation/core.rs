use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomPinned;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

use intrusive_collections::LinkedListLink;

use crate::operation::DeferList;
use crate::{Error, Result};

/// Lifecycle of an operation. Transitions are strictly monotonic.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    /// Constructed but not yet handed to a multiplexer.
    Initialized = 0,
    /// Handed to the kernel, or to the synchronous completion list.
    Submitted = 1,
    /// A result is known.
    Completed = 2,
    /// The multiplexer relinquished all claims on the operation storage.
    Concluded = 3,
}

impl Status {
    fn from_u8(value: u8) -> Status {
        match value {
            0 => Status::Initialized,
            1 => Status::Submitted,
            2 => Status::Completed,
            _ => Status::Concluded,
        }
    }
}

/// Notified when an operation changes status.
///
/// Completion and conclusion callbacks are deferred until the multiplexer leaves its reaping
/// loop, so a listener may freely start new operations. After `concluded` returns the
/// multiplexer never touches the operation again; the listener is allowed to destroy it, which is
/// why `concluded` receives the result by value instead of a reference to the operation.
pub trait Listener {
    fn submitted(&self, _operation: &OperationCore) {}
    fn completed(&self, _operation: &OperationCore) {}
    fn concluded(&self, _result: Result<()>) {}
}

/// State shared by every asynchronous operation regardless of backend.
///
/// Always the first field of the operation state so that backends can pass a pointer to it
/// through the kernel and recover the full state on completion.
pub struct OperationCore {
    status: AtomicU8,
    result: Cell<Option<Error>>,
    listener: Option<NonNull<dyn Listener>>,
    pub(crate) link: LinkedListLink,
    _p: PhantomPinned,
}

impl OperationCore {
    pub(crate) fn new(listener: Option<NonNull<dyn Listener>>) -> OperationCore {
        OperationCore {
            status: AtomicU8::new(Status::Initialized as u8),
            result: Cell::new(None),
            listener,
            link: LinkedListLink::new(),
            _p: PhantomPinned,
        }
    }

    #[inline]
    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_concluded(&self) -> bool {
        self.status() == Status::Concluded
    }

    /// The result of the operation. Meaningless before [`Status::Completed`].
    pub fn result(&self) -> Result<()> {
        match self.result.get() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    fn transition(&self, next: Status) {
        let previous = self.status.swap(next as u8, Ordering::AcqRel);
        debug_assert_eq!(
            previous + 1,
            next as u8,
            "operation status moved from {:?} to {:?}",
            Status::from_u8(previous),
            next
        );
    }

    /// Mark the operation as handed to the kernel. Must happen before any completion can be observed.
    pub(crate) fn set_submitted(&self) {
        self.transition(Status::Submitted);
    }

    pub(crate) fn set_completed(&self, result: Result<()>) {
        self.result.set(result.err());
        self.transition(Status::Completed);
    }

    pub(crate) fn set_concluded(&self) {
        self.transition(Status::Concluded);
    }
}

impl fmt::Debug for OperationCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationCore")
            .field("status", &self.status())
            .field("result", &self.result.get())
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

/// Fire the submitted callback. Called by the multiplexer after it released any recording state.
///
/// # Safety
/// `operation` must point to a live operation.
pub(crate) unsafe fn notify_submitted(operation: NonNull<OperationCore>) {
    let core = operation.as_ref();
    if core.status() == Status::Initialized {
        return;
    }
    if let Some(listener) = core.listener {
        listener.as_ref().submitted(core);
    }
}

/// Record the result of an operation.
///
/// Operations with a listener are queued on `deferred` and concluded when the list is flushed.
/// Operations without one are concluded right away; whoever owns them polls the status.
/// Returns true if the operation was concluded.
///
/// # Safety
/// `operation` must point to a live, submitted operation that is not linked into any list.
pub(crate) unsafe fn complete(
    operation: NonNull<OperationCore>,
    result: Result<()>,
    deferred: &RefCell<DeferList>,
) -> bool {
    let core = operation.as_ref();
    core.set_completed(result);
    if core.has_listener() {
        deferred.borrow_mut().push(operation);
        false
    } else {
        core.set_concluded();
        true
    }
}

/// Conclude every deferred operation, invoking listener callbacks with no borrow held.
/// Returns the number of operations concluded.
///
/// # Safety
/// Every operation on the list must still be live.
pub(crate) unsafe fn flush(deferred: &RefCell<DeferList>) -> usize {
    let mut concluded = 0;
    loop {
        // Pop one at a time: callbacks may push new entries.
        let next = deferred.borrow_mut().pop();
        let operation = match next {
            Some(operation) => operation,
            None => break,
        };
        let core = operation.as_ref();
        let listener = core.listener;
        let result = core.result();
        if let Some(listener) = listener {
            listener.as_ref().completed(core);
        }
        core.set_concluded();
        concluded += 1;
        // The listener may destroy the operation from here on.
        if let Some(listener) = listener {
            listener.as_ref().concluded(result);
        }
    }
    concluded
}

/// Erase the lifetime of a listener so that it can be stored in an [`OperationCore`].
///
/// # Safety
/// The listener must outlive every operation it is attached to.
pub(crate) unsafe fn erase_listener<'a>(listener: &'a (dyn Listener + 'a)) -> NonNull<dyn Listener> {
    let ptr: NonNull<dyn Listener + 'a> = NonNull::from(listener);
    std::mem::transmute::<NonNull<dyn Listener + 'a>, NonNull<dyn Listener + 'static>>(ptr)
}
