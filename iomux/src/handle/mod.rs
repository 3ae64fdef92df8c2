//! Handles own a native descriptor and, while attached, a connector to one multiplexer.
//!
//! Operations on a detached handle run as plain blocking calls. Once attached, the same call
//! sites go through the multiplexer: either blocking on it ([`PlatformHandle::block`]) or as a
//! [`Sender`](crate::sender::Sender) that completes asynchronously.
use std::any::TypeId;
use std::fmt;
use std::ops::BitOr;
use std::rc::Rc;

use log::{debug, warn};

use crate::multiplexer::{HandleRelation, Multiplexer};
use crate::sender::Sender;
use crate::{Error, Result};

mod event;
pub use event::{EventHandle, Signal, Wait, WaitParams};
#[cfg(unix)]
pub(crate) use event::sys::consume as consume_event;

mod file;
pub use file::{FileHandle, Flush, GatherWriteAt, ScatterReadAt};

mod socket;
pub use socket::{
    Accepted, ListenSocketHandle, SocketHandle, StreamAccept, StreamConnect, StreamRead, StreamWrite,
};

mod transfer;
pub use transfer::{Position, Transfer, TransferParams};
pub(crate) use transfer::Direction;

#[cfg(unix)]
pub type RawNativeHandle = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type RawNativeHandle = std::os::windows::io::RawHandle;

#[cfg(unix)]
const NULL_RAW_HANDLE: RawNativeHandle = -1;
#[cfg(windows)]
const NULL_RAW_HANDLE: RawNativeHandle = std::ptr::null_mut();

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleFlags(u32);

impl HandleFlags {
    pub const NONE: HandleFlags = HandleFlags(0);
    /// The handle refers to a resource.
    pub const NOT_NULL: HandleFlags = HandleFlags(1 << 0);
    /// The handle is a pseudo handle for the current process or thread and is never closed.
    pub const CURRENT: HandleFlags = HandleFlags(1 << 1);
    /// First bit available for handle type specific flags.
    pub const FIRST_SPECIFIC: u32 = 8;

    pub const fn specific(bit: u32) -> HandleFlags {
        HandleFlags(1 << (Self::FIRST_SPECIFIC + bit))
    }

    pub fn contains(self, other: HandleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for HandleFlags {
    type Output = HandleFlags;

    fn bitor(self, rhs: HandleFlags) -> HandleFlags {
        HandleFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for HandleFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleFlags({:#x})", self.0)
    }
}

/// A native descriptor plus flags. Plain value, owns nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeHandle {
    raw: RawNativeHandle,
    flags: HandleFlags,
}

impl NativeHandle {
    pub const fn null() -> NativeHandle {
        NativeHandle {
            raw: NULL_RAW_HANDLE,
            flags: HandleFlags::NONE,
        }
    }

    pub fn new(raw: RawNativeHandle) -> NativeHandle {
        NativeHandle {
            raw,
            flags: HandleFlags::NOT_NULL,
        }
    }

    pub fn with_flags(raw: RawNativeHandle, flags: HandleFlags) -> NativeHandle {
        NativeHandle {
            raw,
            flags: flags | HandleFlags::NOT_NULL,
        }
    }

    #[inline]
    pub fn raw(&self) -> RawNativeHandle {
        self.raw
    }

    #[inline]
    pub fn flags(&self) -> HandleFlags {
        self.flags
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        !self.flags.contains(HandleFlags::NOT_NULL)
    }
}

impl Default for NativeHandle {
    fn default() -> Self {
        NativeHandle::null()
    }
}

/// Backend specific state kept for a handle while it is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    Blocking,
    #[cfg(target_os = "linux")]
    IoUring(crate::io_uring::Connector),
    #[cfg(windows)]
    Iocp(crate::iocp::Connector),
}

/// Everything an operation needs to know about its handle while it is in flight.
#[derive(Debug, Clone, Copy)]
pub struct HandleView {
    pub native: NativeHandle,
    pub connector: Connector,
}

impl HandleView {
    pub fn detached(native: NativeHandle) -> HandleView {
        HandleView {
            native,
            connector: Connector::Blocking,
        }
    }
}

/// Identifies a handle type for relation lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleType {
    pub id: TypeId,
    pub name: &'static str,
}

impl HandleType {
    pub fn of<H: Handle>() -> HandleType {
        HandleType {
            id: TypeId::of::<H>(),
            name: H::NAME,
        }
    }
}

/// A kind of handle that can be attached to multiplexers.
pub trait Handle: 'static {
    const NAME: &'static str;

    fn platform(&self) -> &PlatformHandle;

    fn platform_mut(&mut self) -> &mut PlatformHandle;

    /// Bind the handle to a multiplexer. A handle is attached to at most one multiplexer.
    fn attach(&mut self, multiplexer: Rc<dyn Multiplexer>) -> Result<()>
    where
        Self: Sized,
    {
        self.platform_mut().attach(HandleType::of::<Self>(), multiplexer)
    }

    fn detach(&mut self) -> Result<()> {
        self.platform_mut().detach()
    }
}

/// A kind of operation on a handle type.
///
/// Every operation has a blocking implementation. It is used for detached handles, by the
/// blocking multiplexer, and by backends that do not implement the operation asynchronously.
pub trait IoOperation: Sized + 'static {
    type Handle: Handle;
    type Params: 'static;
    type Output: 'static;

    /// Position of the operation in the relation table of its handle type.
    const INDEX: usize;
    const NAME: &'static str;

    /// Observer operations with a bounded runtime always run as a direct blocking call, even on
    /// an asynchronous multiplexer.
    const BOUNDED: bool = false;

    fn block(handle: &HandleView, params: Self::Params) -> Result<Self::Output>;
}

/// Arguments handed to a multiplexer for one operation, passed around type erased.
///
/// Parameters are moved into the operation state on construction. The output is moved back
/// out once the operation concluded successfully.
pub struct OperationArgs<O: IoOperation> {
    pub(crate) handle: HandleView,
    pub(crate) params: Option<O::Params>,
    pub(crate) output: Option<O::Output>,
}

impl<O: IoOperation> OperationArgs<O> {
    pub fn new(handle: HandleView, params: O::Params) -> OperationArgs<O> {
        OperationArgs {
            handle,
            params: Some(params),
            output: None,
        }
    }

    pub fn handle(&self) -> &HandleView {
        &self.handle
    }

    pub fn take_output(&mut self) -> Option<O::Output> {
        self.output.take()
    }
}

pub(crate) struct Attachment {
    pub(crate) multiplexer: Rc<dyn Multiplexer>,
    pub(crate) relation: &'static HandleRelation,
    pub(crate) connector: Connector,
}

/// Owner of a native descriptor, shared by all handle types.
pub struct PlatformHandle {
    native: NativeHandle,
    close: fn(NativeHandle) -> Result<()>,
    attachment: Option<Attachment>,
}

impl PlatformHandle {
    pub(crate) fn new(native: NativeHandle, close: fn(NativeHandle) -> Result<()>) -> PlatformHandle {
        PlatformHandle {
            native,
            close,
            attachment: None,
        }
    }

    pub fn native(&self) -> NativeHandle {
        self.native
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    pub fn multiplexer(&self) -> Option<&Rc<dyn Multiplexer>> {
        self.attachment.as_ref().map(|a| &a.multiplexer)
    }

    pub(crate) fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    pub fn view(&self) -> HandleView {
        HandleView {
            native: self.native,
            connector: self
                .attachment
                .as_ref()
                .map(|a| a.connector)
                .unwrap_or(Connector::Blocking),
        }
    }

    fn attach(&mut self, handle_type: HandleType, multiplexer: Rc<dyn Multiplexer>) -> Result<()> {
        if self.native.is_null() {
            return Err(Error::InvalidArgument);
        }
        if self.attachment.is_some() {
            return Err(Error::InvalidArgument);
        }
        let relation = multiplexer.find_handle_relation(handle_type)?;
        let connector = (relation.attach)(multiplexer.as_any(), &self.native)?;
        debug!(
            "attached {} {:?} to the {} multiplexer",
            handle_type.name,
            self.native.raw(),
            multiplexer.name()
        );
        self.attachment = Some(Attachment {
            multiplexer,
            relation,
            connector,
        });
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        let attachment = match self.attachment.take() {
            Some(attachment) => attachment,
            None => return Err(Error::HandleIsNotMultiplexable),
        };
        (attachment.relation.detach)(
            attachment.multiplexer.as_any(),
            &self.native,
            &attachment.connector,
        )
    }

    /// Run an operation to completion on the calling thread.
    pub(crate) fn block<O: IoOperation>(&self, params: O::Params) -> Result<O::Output> {
        let attachment = match self.attachment.as_ref() {
            Some(attachment) => attachment,
            None => return O::block(&self.view(), params),
        };
        let descriptor = attachment.relation.operation(O::INDEX)?;
        let mut args = OperationArgs::<O>::new(self.view(), params);
        attachment.multiplexer.block(descriptor, &mut args)?;
        args.take_output().ok_or(Error::InvalidArgument)
    }

    pub(crate) fn sender<O: IoOperation>(&self, params: O::Params) -> Sender<'_, O> {
        Sender::new(self, params)
    }

    /// Detach if attached and close the descriptor.
    pub fn close(&mut self) -> Result<()> {
        if self.native.is_null() {
            return Ok(());
        }
        let detached = match self.attachment.is_some() {
            true => self.detach(),
            false => Ok(()),
        };
        let native = std::mem::replace(&mut self.native, NativeHandle::null());
        if native.flags().contains(HandleFlags::CURRENT) {
            return detached;
        }
        // The descriptor is closed even when detaching failed.
        let closed = (self.close)(native);
        detached.and(closed)
    }

    /// Give up ownership of the descriptor without closing it.
    pub fn release(mut self) -> Result<NativeHandle> {
        if self.attachment.is_some() {
            self.detach()?;
        }
        Ok(std::mem::replace(&mut self.native, NativeHandle::null()))
    }
}

impl Drop for PlatformHandle {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("failed to close handle {:?}: {}", self.native.raw(), err);
        }
    }
}

impl fmt::Debug for PlatformHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformHandle")
            .field("native", &self.native)
            .field(
                "multiplexer",
                &self.attachment.as_ref().map(|a| a.multiplexer.name()),
            )
            .finish()
    }
}

#[cfg(unix)]
pub(crate) fn close_native(native: NativeHandle) -> Result<()> {
    nix::unistd::close(native.raw())?;
    Ok(())
}

#[cfg(windows)]
pub(crate) fn close_native(native: NativeHandle) -> Result<()> {
    let closed = unsafe { winapi::um::handleapi::CloseHandle(native.raw() as _) };
    if closed == 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::Deadline;
    use crate::multiplexer::{Connect, PumpMode, PumpStatistics, RelationBuilder};
    use lazy_static::lazy_static;
    use std::any::Any;
    use std::cell::Cell;

    thread_local! {
        static CLOSED: Cell<usize> = Cell::new(0);
    }

    fn count_close(_: NativeHandle) -> Result<()> {
        CLOSED.with(|closed| closed.set(closed.get() + 1));
        Ok(())
    }

    /// Accepts every handle but refuses to let go of it.
    struct Sticky;

    lazy_static! {
        static ref STICKY: HandleRelation = RelationBuilder::<Sticky, EventHandle>::new().build();
    }

    impl Multiplexer for Sticky {
        fn name(&self) -> &'static str {
            "sticky"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn find_handle_relation(&self, _: HandleType) -> Result<&'static HandleRelation> {
            Ok(&STICKY)
        }

        fn pump(&self, _: PumpMode, _: Deadline) -> Result<PumpStatistics> {
            Ok(PumpStatistics::default())
        }
    }

    impl Connect<EventHandle> for Sticky {
        fn attach(&self, _: &NativeHandle) -> Result<Connector> {
            Ok(Connector::Blocking)
        }

        fn detach(&self, _: &NativeHandle, _: &Connector) -> Result<()> {
            Err(Error::InvalidArgument)
        }
    }

    #[test]
    fn test_close_after_failed_detach() {
        let mut handle = PlatformHandle::new(NativeHandle::new(0x40 as _), count_close);
        handle
            .attach(HandleType::of::<EventHandle>(), Rc::new(Sticky))
            .unwrap();
        assert!(handle.is_attached());

        assert_eq!(Err(Error::InvalidArgument), handle.close());
        assert_eq!(1, CLOSED.with(Cell::get));
        assert!(!handle.is_attached());
        assert!(handle.native().is_null());

        // Nothing is left to close on drop.
        drop(handle);
        assert_eq!(1, CLOSED.with(Cell::get));
    }

    #[test]
    fn test_current_handle_is_never_closed() {
        let native = NativeHandle::with_flags(0x40 as _, HandleFlags::CURRENT);
        let mut handle = PlatformHandle::new(native, count_close);
        let before = CLOSED.with(Cell::get);
        handle.close().unwrap();
        assert_eq!(before, CLOSED.with(Cell::get));
    }
}
