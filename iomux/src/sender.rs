//! Sender/receiver adapter over single operations.
//!
//! A [`Sender`] describes one operation on a handle. Connecting it to a [`Receiver`] yields a
//! [`SenderOperation`] that owns the operation storage; once started it must stay pinned until
//! the receiver was signaled. Whoever pumps the multiplexer drives it to completion.
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::future::Future;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use log::error;
use pin_project_lite::pin_project;

use crate::deadline::Deadline;
use crate::handle::{IoOperation, OperationArgs, PlatformHandle};
use crate::multiplexer::{Multiplexer, OperationDescriptor, OperationPtr, PumpMode};
use crate::operation::{erase_listener, Listener, OperationStorage, Status};
use crate::{Error, Result};

/// Consumer of the outcome of an operation. Exactly one method is called, exactly once.
pub trait Receiver<T> {
    fn set_value(self, value: T);
    fn set_error(self, error: Error);
    /// The operation was cancelled.
    fn set_stopped(self);
}

/// An operation descriptor that is looked up lazily, on start.
#[derive(Clone, Copy)]
enum DescriptorRef {
    Unresolved(usize),
    Resolved(&'static OperationDescriptor),
}

pub struct Sender<'h, O: IoOperation> {
    handle: &'h PlatformHandle,
    params: O::Params,
}

impl<'h, O: IoOperation> Sender<'h, O> {
    pub(crate) fn new(handle: &'h PlatformHandle, params: O::Params) -> Sender<'h, O> {
        Sender { handle, params }
    }

    pub fn connect<R>(self, receiver: R) -> SenderOperation<'h, O, R>
    where
        R: Receiver<O::Output>,
    {
        SenderOperation {
            handle: self.handle,
            descriptor: Cell::new(DescriptorRef::Unresolved(O::INDEX)),
            params: Cell::new(Some(self.params)),
            args: RefCell::new(None),
            receiver: Cell::new(Some(receiver)),
            multiplexer: RefCell::new(None),
            operation: RefCell::new(None),
            storage: UnsafeCell::new(OperationStorage::new()),
            _pin: PhantomPinned,
        }
    }

    pub fn into_future(self) -> OperationFuture<'h, O> {
        let state = Rc::new(FutureState {
            result: RefCell::new(None),
            waker: RefCell::new(None),
        });
        OperationFuture {
            operation: self.connect(FutureReceiver {
                state: state.clone(),
            }),
            state,
            started: false,
        }
    }
}

impl<'h, O: IoOperation> fmt::Debug for Sender<'h, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("operation", &O::NAME)
            .field("handle", self.handle)
            .finish()
    }
}

pub struct SenderOperation<'h, O: IoOperation, R> {
    handle: &'h PlatformHandle,
    descriptor: Cell<DescriptorRef>,
    params: Cell<Option<O::Params>>,
    args: RefCell<Option<OperationArgs<O>>>,
    receiver: Cell<Option<R>>,
    multiplexer: RefCell<Option<Rc<dyn Multiplexer>>>,
    operation: RefCell<Option<OperationPtr>>,
    storage: UnsafeCell<OperationStorage>,
    _pin: PhantomPinned,
}

impl<'h, O, R> SenderOperation<'h, O, R>
where
    O: IoOperation,
    R: Receiver<O::Output>,
{
    /// Start the operation. The receiver is signaled from a later pump, or right away if the
    /// operation could not be started.
    pub fn start(self: Pin<&mut Self>) {
        let this = self.into_ref().get_ref();
        if let Err(err) = this.try_start() {
            this.signal(Err(err));
        }
    }

    fn try_start(&self) -> Result<()> {
        let params = self.params.take().ok_or(Error::InvalidArgument)?;
        let attachment = self
            .handle
            .attachment()
            .ok_or(Error::HandleIsNotMultiplexable)?;

        let descriptor = match self.descriptor.get() {
            DescriptorRef::Resolved(descriptor) => descriptor,
            DescriptorRef::Unresolved(index) => {
                let descriptor = attachment.relation.operation(index)?;
                self.descriptor.set(DescriptorRef::Resolved(descriptor));
                descriptor
            }
        };

        let storage = unsafe { &mut *self.storage.get() };
        let ptr = storage.reserve(descriptor.requirements())?;
        let listener = unsafe { erase_listener(self as &dyn Listener) };

        let mut args = self.args.borrow_mut();
        let args = args.get_or_insert(OperationArgs::new(self.handle.view(), params));
        let operation = unsafe {
            attachment
                .multiplexer
                .construct_and_start(descriptor, ptr, args, Some(listener))?
        };
        *self.operation.borrow_mut() = Some(operation);
        *self.multiplexer.borrow_mut() = Some(attachment.multiplexer.clone());
        Ok(())
    }

    /// Request cancellation. The receiver is still signaled through the usual path.
    pub fn cancel(&self) -> Result<()> {
        let multiplexer = self.multiplexer.borrow();
        let operation = self.operation.borrow();
        match (multiplexer.as_ref(), operation.as_ref(), self.descriptor.get()) {
            (Some(multiplexer), Some(operation), DescriptorRef::Resolved(descriptor)) => {
                multiplexer.cancel(descriptor, operation)
            }
            _ => Ok(()),
        }
    }

    pub fn is_pending(&self) -> bool {
        match self.operation.borrow().as_ref() {
            Some(operation) => operation.core().status() != Status::Concluded,
            None => false,
        }
    }

    /// Take the receiver and signal it. Nothing may touch `self` afterwards.
    fn signal(&self, result: Result<O::Output>) {
        let receiver = match self.receiver.take() {
            Some(receiver) => receiver,
            None => return,
        };
        match result {
            Ok(value) => receiver.set_value(value),
            Err(err) if err.is_cancellation() => receiver.set_stopped(),
            Err(err) => receiver.set_error(err),
        }
    }
}

impl<'h, O, R> Listener for SenderOperation<'h, O, R>
where
    O: IoOperation,
    R: Receiver<O::Output>,
{
    fn concluded(&self, result: Result<()>) {
        let operation = self.operation.borrow_mut().take();
        let output = match (operation, self.descriptor.get()) {
            (Some(operation), DescriptorRef::Resolved(descriptor)) => {
                let mut args = self.args.borrow_mut();
                let output = match (result, args.as_mut()) {
                    (Ok(()), Some(args)) => {
                        unsafe { (descriptor.take_output)(operation.as_ptr(), args) };
                        args.take_output().ok_or(Error::InvalidArgument)
                    }
                    (Ok(()), None) => Err(Error::InvalidArgument),
                    (Err(err), _) => Err(err),
                };
                // Destroy the backend state before the receiver may destroy us.
                drop(operation);
                output
            }
            _ => result.and(Err(Error::InvalidArgument)),
        };
        self.signal(output);
    }
}

impl<'h, O: IoOperation, R> Drop for SenderOperation<'h, O, R> {
    fn drop(&mut self) {
        let multiplexer = match self.multiplexer.borrow().clone() {
            Some(multiplexer) => multiplexer,
            None => return,
        };
        if let (Some(operation), DescriptorRef::Resolved(descriptor)) =
            (self.operation.borrow().as_ref(), self.descriptor.get())
        {
            if let Err(err) = multiplexer.cancel(descriptor, operation) {
                error!("failed to cancel {} on drop: {}", descriptor.name(), err);
            }
        }
        // Conclusion clears `operation` through the listener.
        while self.operation.borrow().is_some() {
            if let Err(err) = multiplexer.pump(PumpMode::ALL, Deadline::Never) {
                error!("pump failed while dropping an operation: {}", err);
                std::process::abort();
            }
        }
    }
}

pub(crate) struct FutureState<T> {
    result: RefCell<Option<Result<T>>>,
    waker: RefCell<Option<Waker>>,
}

impl<T> FutureState<T> {
    fn set(&self, result: Result<T>) {
        *self.result.borrow_mut() = Some(result);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

pub(crate) struct FutureReceiver<T> {
    state: Rc<FutureState<T>>,
}

impl<T> Receiver<T> for FutureReceiver<T> {
    fn set_value(self, value: T) {
        self.state.set(Ok(value));
    }

    fn set_error(self, error: Error) {
        self.state.set(Err(error));
    }

    fn set_stopped(self) {
        self.state.set(Err(Error::OperationCanceled));
    }
}

pin_project! {
    /// Resolves once a pumping thread concluded the operation.
    pub struct OperationFuture<'h, O>
    where
        O: IoOperation,
    {
        #[pin]
        operation: SenderOperation<'h, O, FutureReceiver<O::Output>>,
        state: Rc<FutureState<O::Output>>,
        started: bool,
    }
}

impl<'h, O: IoOperation> OperationFuture<'h, O> {
    pub fn cancel(&self) -> Result<()> {
        self.operation.cancel()
    }
}

impl<'h, O: IoOperation> Future for OperationFuture<'h, O> {
    type Output = Result<O::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        *this.state.waker.borrow_mut() = Some(cx.waker().clone());
        if !*this.started {
            *this.started = true;
            this.operation.start();
        }
        match this.state.result.borrow_mut().take() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{EventHandle, Handle};
    use crate::multiplexer::BlockingMultiplexer;
    use futures_lite::pin;
    use futures_test::task::{new_count_waker, noop_context};

    #[derive(Debug, PartialEq)]
    enum Signaled {
        Value,
        Error(Error),
        Stopped,
    }

    struct Record(Rc<RefCell<Vec<Signaled>>>);

    impl Receiver<()> for Record {
        fn set_value(self, _: ()) {
            self.0.borrow_mut().push(Signaled::Value);
        }
        fn set_error(self, error: Error) {
            self.0.borrow_mut().push(Signaled::Error(error));
        }
        fn set_stopped(self) {
            self.0.borrow_mut().push(Signaled::Stopped);
        }
    }

    #[test]
    fn test_not_multiplexable() {
        let event = EventHandle::new().unwrap();
        let record = Rc::new(RefCell::new(Vec::new()));
        let operation = event.wait_async(Deadline::Instant).connect(Record(record.clone()));
        pin!(operation);
        operation.as_mut().start();
        assert_eq!(
            vec![Signaled::Error(Error::HandleIsNotMultiplexable)],
            *record.borrow()
        );
    }

    #[test]
    fn test_value_after_pump() {
        let multiplexer = Rc::new(BlockingMultiplexer::new());
        let mut event = EventHandle::new().unwrap();
        event.attach(multiplexer.clone()).unwrap();
        event.signal().unwrap();

        let record = Rc::new(RefCell::new(Vec::new()));
        let operation = event.wait_async(Deadline::Never).connect(Record(record.clone()));
        pin!(operation);
        operation.as_mut().start();
        assert!(operation.is_pending());
        assert!(record.borrow().is_empty());

        multiplexer.pump(PumpMode::ALL, Deadline::Instant).unwrap();
        assert!(!operation.is_pending());
        assert_eq!(vec![Signaled::Value], *record.borrow());
    }

    #[test]
    fn test_timeout_is_an_error() {
        let multiplexer = Rc::new(BlockingMultiplexer::new());
        let mut event = EventHandle::new().unwrap();
        event.attach(multiplexer.clone()).unwrap();

        let record = Rc::new(RefCell::new(Vec::new()));
        let operation = event.wait_async(Deadline::Instant).connect(Record(record.clone()));
        pin!(operation);
        operation.as_mut().start();
        multiplexer.pump(PumpMode::ALL, Deadline::Instant).unwrap();
        assert_eq!(vec![Signaled::Error(Error::TimedOut)], *record.borrow());
    }

    #[test]
    fn test_future() {
        let multiplexer = Rc::new(BlockingMultiplexer::new());
        let mut event = EventHandle::new().unwrap();
        event.attach(multiplexer.clone()).unwrap();
        event.signal().unwrap();

        let (waker, count) = new_count_waker();
        let mut cx = Context::from_waker(&waker);
        let future = event.wait_async(Deadline::Never).into_future();
        pin!(future);
        assert!(future.as_mut().poll(&mut cx).is_pending());
        assert_eq!(0, count.get());

        multiplexer.pump(PumpMode::ALL, Deadline::Instant).unwrap();
        assert_eq!(1, count.get());
        match future.as_mut().poll(&mut noop_context()) {
            Poll::Ready(result) => result.unwrap(),
            Poll::Pending => panic!("operation did not conclude"),
        }
    }

    #[test]
    fn test_drop_in_flight() {
        let multiplexer = Rc::new(BlockingMultiplexer::new());
        let mut event = EventHandle::new().unwrap();
        event.attach(multiplexer.clone()).unwrap();
        event.signal().unwrap();

        let record = Rc::new(RefCell::new(Vec::new()));
        {
            let operation = event.wait_async(Deadline::Never).connect(Record(record.clone()));
            pin!(operation);
            operation.as_mut().start();
        }
        // Dropping pumped the operation to conclusion.
        assert_eq!(vec![Signaled::Value], *record.borrow());
    }
}
