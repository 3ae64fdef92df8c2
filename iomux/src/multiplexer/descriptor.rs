//! Type erased operation descriptors.
//!
//! A descriptor is a table of functions generated once per (multiplexer, operation) pairing. It
//! hides the concrete backend state behind [`OperationCore`] so that the generic layer, the
//! sender adapter and [`AnyMultiplexer`](crate::multiplexer::AnyMultiplexer) can drive any
//! backend through the same calls.
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use log::error;

use crate::handle::{HandleView, IoOperation, OperationArgs};
use crate::multiplexer::Multiplexer;
use crate::operation::{Listener, OperationCore, Status, StoragePtr, StorageRequirements};
use crate::{Error, Result};

/// Operation state as laid out in caller storage.
///
/// `core` comes first so that a pointer to the core is a pointer to the whole operation.
#[repr(C)]
pub struct AsyncOperation<S> {
    core: OperationCore,
    handle: HandleView,
    state: S,
}

impl<S> AsyncOperation<S> {
    pub fn core(&self) -> &OperationCore {
        &self.core
    }

    pub fn handle(&self) -> &HandleView {
        &self.handle
    }

    #[inline]
    pub(crate) fn core_ptr(operation: NonNull<Self>) -> NonNull<OperationCore> {
        operation.cast()
    }

    /// # Safety
    /// `core` must be the core of an `AsyncOperation<S>`.
    #[inline]
    pub(crate) unsafe fn from_core(core: NonNull<OperationCore>) -> NonNull<Self> {
        core.cast()
    }

    /// Split the operation into its shared core, its handle and its mutable backend state.
    ///
    /// # Safety
    /// The operation must be live and no other reference to its state may exist.
    pub(crate) unsafe fn parts<'a>(
        operation: NonNull<Self>,
    ) -> (&'a OperationCore, &'a HandleView, &'a mut S) {
        let raw = operation.as_ptr();
        (
            &*ptr::addr_of!((*raw).core),
            &*ptr::addr_of!((*raw).handle),
            &mut *ptr::addr_of_mut!((*raw).state),
        )
    }
}

/// Asynchronous implementation of operation `O` on a multiplexer.
pub trait AsyncOperationImpl<O: IoOperation>: Multiplexer + Sized {
    type State: 'static;

    /// Build the backend state from the operation parameters. No kernel interaction.
    fn construct(handle: &HandleView, params: O::Params) -> Result<Self::State>;

    /// Hand the operation to the kernel.
    ///
    /// Must mark the core submitted before any completion can be observed. May fail with
    /// [`Error::TooManyConcurrentAsyncOperations`], in which case the operation is untouched
    /// and can be started again later.
    ///
    /// # Safety
    /// The operation must stay alive and pinned until it concludes.
    unsafe fn submit(&self, operation: NonNull<AsyncOperation<Self::State>>) -> Result<()>;

    /// Request cancellation of a submitted operation. Best effort.
    ///
    /// # Safety
    /// The operation must be live and submitted.
    unsafe fn cancel_io(&self, operation: NonNull<AsyncOperation<Self::State>>) -> Result<()>;

    fn take_output(state: &mut Self::State) -> Option<O::Output>;
}

/// Backends able to complete an operation without a round trip through the kernel.
pub trait PostSynchronousCompletion: Multiplexer {
    /// Complete a submitted operation. Listener callbacks run during the next pump.
    ///
    /// # Safety
    /// The operation must be live, submitted and stay alive until it concludes.
    unsafe fn post_synchronous_completion(&self, operation: NonNull<OperationCore>, result: Result<()>);
}

type ConstructFn =
    unsafe fn(StoragePtr, &mut dyn Any, Option<NonNull<dyn Listener>>) -> Result<NonNull<OperationCore>>;
type StartFn = unsafe fn(&dyn Any, NonNull<OperationCore>) -> Result<()>;
type BlockFn = fn(&mut dyn Any) -> Result<()>;
type TakeOutputFn = unsafe fn(NonNull<OperationCore>, &mut dyn Any);
type DestroyFn = unsafe fn(NonNull<OperationCore>);

pub struct OperationDescriptor {
    name: &'static str,
    requirements: StorageRequirements,
    pub(crate) construct: ConstructFn,
    pub(crate) start: StartFn,
    pub(crate) cancel: StartFn,
    /// Direct blocking implementation for bounded observer operations.
    pub(crate) block: Option<BlockFn>,
    pub(crate) take_output: TakeOutputFn,
    pub(crate) destroy: DestroyFn,
}

impl OperationDescriptor {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn requirements(&self) -> StorageRequirements {
        self.requirements
    }

    /// Descriptor for an operation implemented asynchronously by `M`.
    pub fn asynchronous<M, O>() -> OperationDescriptor
    where
        M: AsyncOperationImpl<O>,
        O: IoOperation,
    {
        OperationDescriptor {
            name: O::NAME,
            requirements: StorageRequirements::of::<AsyncOperation<M::State>>(),
            construct: construct_async::<M, O>,
            start: start_async::<M, O>,
            cancel: cancel_async::<M, O>,
            block: if O::BOUNDED { Some(block_direct::<O>) } else { None },
            take_output: take_output_async::<M, O>,
            destroy: destroy::<M::State>,
        }
    }

    /// Descriptor for an operation `M` does not implement: it runs blocking at submission time
    /// and posts a synchronous completion.
    pub fn fallback<M, O>() -> OperationDescriptor
    where
        M: PostSynchronousCompletion,
        O: IoOperation,
    {
        OperationDescriptor {
            name: O::NAME,
            requirements: StorageRequirements::of::<AsyncOperation<BlockingState<O>>>(),
            construct: construct_blocking::<O>,
            start: start_blocking::<M, O>,
            cancel: cancel_blocking,
            block: if O::BOUNDED { Some(block_direct::<O>) } else { None },
            take_output: take_output_blocking::<O>,
            destroy: destroy::<BlockingState<O>>,
        }
    }
}

impl fmt::Debug for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("name", &self.name)
            .field("requirements", &self.requirements)
            .finish()
    }
}

/// Owner of a constructed operation. Destroys the state through its descriptor on drop.
pub struct OperationPtr {
    core: NonNull<OperationCore>,
    destroy: DestroyFn,
}

impl OperationPtr {
    pub(crate) fn new(core: NonNull<OperationCore>, destroy: DestroyFn) -> OperationPtr {
        OperationPtr { core, destroy }
    }

    pub fn core(&self) -> &OperationCore {
        unsafe { self.core.as_ref() }
    }

    pub fn as_ptr(&self) -> NonNull<OperationCore> {
        self.core
    }
}

impl fmt::Debug for OperationPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OperationPtr").field(self.core()).finish()
    }
}

impl Drop for OperationPtr {
    fn drop(&mut self) {
        match self.core().status() {
            Status::Initialized | Status::Concluded => unsafe { (self.destroy)(self.core) },
            status => {
                // The kernel may still write into this memory.
                error!("operation destroyed while {:?}, aborting", status);
                std::process::abort();
            }
        }
    }
}

fn downcast_args<O: IoOperation>(args: &mut dyn Any) -> Result<&mut OperationArgs<O>> {
    args.downcast_mut::<OperationArgs<O>>()
        .ok_or(Error::InvalidArgument)
}

fn downcast_multiplexer<M: Multiplexer>(multiplexer: &dyn Any) -> Result<&M> {
    multiplexer.downcast_ref::<M>().ok_or(Error::InvalidArgument)
}

unsafe fn construct_async<M, O>(
    storage: StoragePtr,
    args: &mut dyn Any,
    listener: Option<NonNull<dyn Listener>>,
) -> Result<NonNull<OperationCore>>
where
    M: AsyncOperationImpl<O>,
    O: IoOperation,
{
    if !storage.fits(StorageRequirements::of::<AsyncOperation<M::State>>()) {
        return Err(Error::InvalidArgument);
    }
    let args = downcast_args::<O>(args)?;
    let params = args.params.take().ok_or(Error::InvalidArgument)?;
    let state = <M as AsyncOperationImpl<O>>::construct(&args.handle, params)?;
    let operation = storage.write(AsyncOperation {
        core: OperationCore::new(listener),
        handle: args.handle,
        state,
    })?;
    Ok(AsyncOperation::core_ptr(operation))
}

unsafe fn start_async<M, O>(multiplexer: &dyn Any, core: NonNull<OperationCore>) -> Result<()>
where
    M: AsyncOperationImpl<O>,
    O: IoOperation,
{
    let multiplexer = downcast_multiplexer::<M>(multiplexer)?;
    AsyncOperationImpl::<O>::submit(multiplexer, AsyncOperation::<M::State>::from_core(core))
}

unsafe fn cancel_async<M, O>(multiplexer: &dyn Any, core: NonNull<OperationCore>) -> Result<()>
where
    M: AsyncOperationImpl<O>,
    O: IoOperation,
{
    let multiplexer = downcast_multiplexer::<M>(multiplexer)?;
    AsyncOperationImpl::<O>::cancel_io(multiplexer, AsyncOperation::<M::State>::from_core(core))
}

unsafe fn take_output_async<M, O>(core: NonNull<OperationCore>, args: &mut dyn Any)
where
    M: AsyncOperationImpl<O>,
    O: IoOperation,
{
    if let Ok(args) = downcast_args::<O>(args) {
        let (_, _, state) = AsyncOperation::<M::State>::parts(AsyncOperation::from_core(core));
        args.output = M::take_output(state);
    }
}

unsafe fn destroy<S>(core: NonNull<OperationCore>) {
    ptr::drop_in_place(AsyncOperation::<S>::from_core(core).as_ptr());
}

fn block_direct<O: IoOperation>(args: &mut dyn Any) -> Result<()> {
    let args = downcast_args::<O>(args)?;
    let params = args.params.take().ok_or(Error::InvalidArgument)?;
    args.output = Some(O::block(&args.handle, params)?);
    Ok(())
}

/// State of an operation run through the blocking fallback.
pub struct BlockingState<O: IoOperation> {
    params: Option<O::Params>,
    output: Option<O::Output>,
    _operation: PhantomData<O>,
}

unsafe fn construct_blocking<O: IoOperation>(
    storage: StoragePtr,
    args: &mut dyn Any,
    listener: Option<NonNull<dyn Listener>>,
) -> Result<NonNull<OperationCore>> {
    if !storage.fits(StorageRequirements::of::<AsyncOperation<BlockingState<O>>>()) {
        return Err(Error::InvalidArgument);
    }
    let args = downcast_args::<O>(args)?;
    let params = args.params.take().ok_or(Error::InvalidArgument)?;
    let operation = storage.write(AsyncOperation {
        core: OperationCore::new(listener),
        handle: args.handle,
        state: BlockingState::<O> {
            params: Some(params),
            output: None,
            _operation: PhantomData,
        },
    })?;
    Ok(AsyncOperation::core_ptr(operation))
}

unsafe fn start_blocking<M, O>(multiplexer: &dyn Any, core: NonNull<OperationCore>) -> Result<()>
where
    M: PostSynchronousCompletion,
    O: IoOperation,
{
    let multiplexer = downcast_multiplexer::<M>(multiplexer)?;
    let (core_ref, handle, state) =
        AsyncOperation::<BlockingState<O>>::parts(AsyncOperation::from_core(core));
    let params = state.params.take().ok_or(Error::InvalidArgument)?;
    let result = O::block(handle, params).map(|output| {
        state.output = Some(output);
    });
    core_ref.set_submitted();
    multiplexer.post_synchronous_completion(core, result);
    Ok(())
}

unsafe fn cancel_blocking(_: &dyn Any, _: NonNull<OperationCore>) -> Result<()> {
    // Completed before start returned.
    Ok(())
}

unsafe fn take_output_blocking<O: IoOperation>(core: NonNull<OperationCore>, args: &mut dyn Any) {
    if let Ok(args) = downcast_args::<O>(args) {
        let (_, _, state) = AsyncOperation::<BlockingState<O>>::parts(AsyncOperation::from_core(core));
        args.output = state.output.take();
    }
}
