use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};

use log::{debug, trace, warn};
use winapi::shared::ntdef::HANDLE;
use winapi::shared::ntstatus::{STATUS_NOT_FOUND, STATUS_PENDING, STATUS_TIMEOUT};
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::ioapiset::CreateIoCompletionPort;
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::winbase::{
    SetFileCompletionNotificationModes, FILE_SKIP_COMPLETION_PORT_ON_SUCCESS,
    FILE_SKIP_SET_EVENT_ON_HANDLE, INFINITE,
};

use super::ntapi::{
    nt_success, CompletionEntry, FileCompletionInformation, IoStatusBlock, KernelTimeout,
    NtCancelIoFileEx, NtRemoveIoCompletionEx, NtSetInformationFile,
    FILE_COMPLETION_INFORMATION_CLASS, FILE_REPLACE_COMPLETION_INFORMATION_CLASS,
};
use crate::deadline::Deadline;
use crate::handle::{
    self, EventHandle, FileHandle, HandleType, ListenSocketHandle, NativeHandle, SocketHandle,
};
use crate::multiplexer::slot_pool::{SlotIndices, SlotPool};
use crate::multiplexer::{
    Connect, HandleRelation, Multiplexer, PostSynchronousCompletion, PumpMode, PumpStatistics,
};
use crate::operation::{self, DeferList, OperationCore};
use crate::{Error, Result};

/// Completion port specific state of an attached handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Connector {
    pub(crate) skip_completion_port_on_success: bool,
}

impl Connector {
    /// Requests that complete synchronously do not queue a completion packet.
    pub fn skips_completion_port_on_success(&self) -> bool {
        self.skip_completion_port_on_success
    }
}

/// Creation options of an [`IocpMultiplexer`].
#[derive(Debug, Clone)]
pub struct IocpOptions {
    /// Completion slots, bounding the requests in flight. Rounded up to a power of two.
    pub slot_count: usize,
    /// Threads the port lets run concurrently.
    pub concurrent_threads: u32,
    /// Maximum completion packets removed by one dequeue.
    pub max_dequeue: usize,
}

impl Default for IocpOptions {
    fn default() -> Self {
        IocpOptions {
            slot_count: 256,
            concurrent_threads: 1,
            max_dequeue: 32,
        }
    }
}

/// Called with the operation, the index the slot was bound with and the final status block.
pub(crate) type SlotFn = unsafe fn(&IocpMultiplexer, NonNull<OperationCore>, usize, &IoStatusBlock);

/// Storage for one request in flight. The address of a slot is the APC context of its request.
#[repr(C)]
pub(crate) struct IoSlot {
    io_status: UnsafeCell<IoStatusBlock>,
    operation: Cell<Option<NonNull<OperationCore>>>,
    on_completion: Cell<Option<SlotFn>>,
    index: Cell<usize>,
}

impl IoSlot {
    fn new() -> IoSlot {
        IoSlot {
            io_status: UnsafeCell::new(IoStatusBlock::pending()),
            operation: Cell::new(None),
            on_completion: Cell::new(None),
            index: Cell::new(0),
        }
    }

    pub(crate) fn io_status(&self) -> *mut IoStatusBlock {
        self.io_status.get()
    }

    pub(crate) fn apc_context(&self) -> *mut winapi::ctypes::c_void {
        self as *const IoSlot as *mut _
    }

    fn is_pending(&self) -> bool {
        unsafe { (*self.io_status.get()).status == STATUS_PENDING }
    }
}

/// I/O completion port backed multiplexer.
///
/// Every request is issued by the thread starting its operation, so there is nothing to submit.
/// Completion packets are dequeued by [`Multiplexer::pump`] and routed through the slot named by
/// their APC context.
pub struct IocpMultiplexer {
    port: HANDLE,
    slots: Box<[IoSlot]>,
    pool: RefCell<SlotPool>,
    /// Completion packets the port still owes.
    outstanding: Cell<usize>,
    deferred: RefCell<DeferList>,
    max_dequeue: usize,
}

impl IocpMultiplexer {
    pub fn new(options: &IocpOptions) -> Result<IocpMultiplexer> {
        if options.max_dequeue == 0 {
            return Err(Error::InvalidArgument);
        }
        let pool = SlotPool::new(options.slot_count)?;
        let port = unsafe {
            CreateIoCompletionPort(
                INVALID_HANDLE_VALUE,
                ptr::null_mut(),
                0,
                options.concurrent_threads,
            )
        };
        if port.is_null() {
            return Err(Error::last_os_error());
        }
        debug!(
            "created completion port {:?} with {} slots",
            port,
            pool.capacity()
        );
        Ok(IocpMultiplexer {
            port,
            slots: (0..pool.capacity()).map(|_| IoSlot::new()).collect(),
            pool: RefCell::new(pool),
            outstanding: Cell::new(0),
            deferred: RefCell::new(DeferList::new()),
            max_dequeue: options.max_dequeue,
        })
    }

    pub fn completion_port(&self) -> HANDLE {
        self.port
    }

    /// Take `count` slots, all or nothing.
    pub(crate) fn acquire_slots(&self, count: usize) -> Result<SlotIndices> {
        self.pool.borrow_mut().acquire(count)
    }

    pub(crate) fn release_slot(&self, index: u32) {
        let slot = &self.slots[index as usize];
        slot.operation.set(None);
        slot.on_completion.set(None);
        self.pool.borrow_mut().release(index);
    }

    pub(crate) fn slot(&self, index: u32) -> &IoSlot {
        &self.slots[index as usize]
    }

    /// Route the completion of slot `index` to `on_completion`, reset its status block to
    /// pending and return the slot.
    pub(crate) fn bind_slot(
        &self,
        index: u32,
        operation: NonNull<OperationCore>,
        sub_index: usize,
        on_completion: SlotFn,
    ) -> &IoSlot {
        let slot = &self.slots[index as usize];
        slot.operation.set(Some(operation));
        slot.on_completion.set(Some(on_completion));
        slot.index.set(sub_index);
        unsafe { slot.io_status.get().write(IoStatusBlock::pending()) };
        slot
    }

    /// A request was queued whose completion packet will be dequeued by a pump.
    pub(crate) fn expect_completion(&self) {
        self.outstanding.set(self.outstanding.get() + 1);
    }

    /// A queued completion packet was removed before it was dequeued.
    pub(crate) fn forget_completion(&self) {
        debug_assert!(self.outstanding.get() != 0);
        self.outstanding.set(self.outstanding.get() - 1);
    }

    /// # Safety
    /// `operation` must be live and submitted.
    pub(crate) unsafe fn complete(&self, operation: NonNull<OperationCore>, result: Result<()>) {
        operation::complete(operation, result, &self.deferred);
    }

    /// Cancel the request issued on `native` with slot `index`. Requests that already completed
    /// are left alone.
    pub(crate) fn cancel_slot(&self, native: NativeHandle, index: u32) -> Result<()> {
        let slot = &self.slots[index as usize];
        if !slot.is_pending() {
            return Ok(());
        }
        let mut io_status = IoStatusBlock::pending();
        let status = unsafe { NtCancelIoFileEx(native.raw() as HANDLE, slot.io_status(), &mut io_status) };
        if !nt_success(status) && status != STATUS_NOT_FOUND {
            return Err(Error::from_ntstatus(status));
        }
        Ok(())
    }

    /// Dequeue completion packets, waiting until the deadline for the first one.
    fn dequeue(&self, deadline: Deadline) -> Result<usize> {
        let mut entries: Vec<CompletionEntry> =
            (0..self.max_dequeue).map(|_| CompletionEntry::default()).collect();
        let mut removed = 0;
        let mut timeout = KernelTimeout::new(deadline);
        trace!("NtRemoveIoCompletionEx deadline={:?}", deadline);
        let status = unsafe {
            NtRemoveIoCompletionEx(
                self.port,
                entries.as_mut_ptr(),
                entries.len() as u32,
                &mut removed,
                timeout.as_mut_ptr(),
                0,
            )
        };
        if status == STATUS_TIMEOUT {
            return Ok(0);
        }
        if !nt_success(status) {
            return Err(Error::from_ntstatus(status));
        }
        for entry in &entries[..removed as usize] {
            if entry.apc_context.is_null() {
                continue;
            }
            self.forget_completion();
            unsafe { self.dispatch(&*(entry.apc_context as *const IoSlot), &entry.io_status) };
        }
        Ok(removed as usize)
    }

    unsafe fn dispatch(&self, slot: &IoSlot, io_status: &IoStatusBlock) {
        let index = (slot as *const IoSlot).offset_from(self.slots.as_ptr()) as u32;
        let target = slot.operation.get().zip(slot.on_completion.get());
        let sub_index = slot.index.get();
        // The operation may reuse the slot from its callback.
        self.release_slot(index);
        match target {
            Some((operation, on_completion)) => on_completion(self, operation, sub_index, io_status),
            None => warn!("completion packet for unbound slot {}", index),
        }
    }

    fn register(&self, native: &NativeHandle) -> Result<handle::Connector> {
        let raw = native.raw() as HANDLE;
        set_completion_information(raw, self.port)?;
        let modes = FILE_SKIP_COMPLETION_PORT_ON_SUCCESS | FILE_SKIP_SET_EVENT_ON_HANDLE;
        let skip_completion_port_on_success =
            if unsafe { SetFileCompletionNotificationModes(raw, modes) } != 0 {
                true
            } else {
                warn!(
                    "Error: skipping the completion port for {:?}. Skipping {}",
                    raw,
                    Error::last_os_error()
                );
                false
            };
        Ok(handle::Connector::Iocp(Connector {
            skip_completion_port_on_success,
        }))
    }

    fn deregister(&self, native: &NativeHandle) -> Result<()> {
        set_completion_information(native.raw() as HANDLE, ptr::null_mut())
    }
}

/// Associate `handle` with `port`, or dissociate it from its port if `port` is null.
fn set_completion_information(handle: HANDLE, port: HANDLE) -> Result<()> {
    let mut io_status = IoStatusBlock::pending();
    let mut information = FileCompletionInformation {
        port,
        key: ptr::null_mut(),
    };
    let class = if port.is_null() {
        FILE_REPLACE_COMPLETION_INFORMATION_CLASS
    } else {
        FILE_COMPLETION_INFORMATION_CLASS
    };
    let mut status = unsafe {
        NtSetInformationFile(
            handle,
            &mut io_status,
            &mut information as *mut FileCompletionInformation as *mut _,
            mem::size_of::<FileCompletionInformation>() as u32,
            class,
        )
    };
    if status == STATUS_PENDING {
        unsafe { WaitForSingleObject(handle, INFINITE) };
        status = io_status.status;
    }
    if !nt_success(status) {
        return Err(Error::from_ntstatus(status));
    }
    Ok(())
}

impl Multiplexer for IocpMultiplexer {
    fn name(&self) -> &'static str {
        "iocp"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn find_handle_relation(&self, handle: HandleType) -> Result<&'static HandleRelation> {
        super::operations::RELATIONS.find(handle)
    }

    fn pump(&self, mode: PumpMode, deadline: Deadline) -> Result<PumpStatistics> {
        let mut stats = PumpStatistics::default();
        if mode.contains(PumpMode::FLUSH) {
            stats.concluded += unsafe { operation::flush(&self.deferred) };
        }
        if mode.contains(PumpMode::COMPLETE) {
            let deadline = if stats.concluded != 0 || self.outstanding.get() == 0 {
                Deadline::Instant
            } else {
                deadline
            };
            stats.completed += self.dequeue(deadline)?;
        }
        if mode.contains(PumpMode::FLUSH) {
            stats.concluded += unsafe { operation::flush(&self.deferred) };
        }
        Ok(stats)
    }
}

impl PostSynchronousCompletion for IocpMultiplexer {
    unsafe fn post_synchronous_completion(&self, operation: NonNull<OperationCore>, result: Result<()>) {
        self.complete(operation, result);
    }
}

impl Connect<FileHandle> for IocpMultiplexer {
    fn attach(&self, native: &NativeHandle) -> Result<handle::Connector> {
        self.register(native)
    }

    fn detach(&self, native: &NativeHandle, _: &handle::Connector) -> Result<()> {
        self.deregister(native)
    }
}

impl Connect<SocketHandle> for IocpMultiplexer {
    fn attach(&self, native: &NativeHandle) -> Result<handle::Connector> {
        self.register(native)
    }

    fn detach(&self, native: &NativeHandle, _: &handle::Connector) -> Result<()> {
        self.deregister(native)
    }
}

// Accepting runs blocking, so listening sockets stay off the port.
impl Connect<ListenSocketHandle> for IocpMultiplexer {
    fn attach(&self, _: &NativeHandle) -> Result<handle::Connector> {
        Ok(handle::Connector::Iocp(Connector::default()))
    }

    fn detach(&self, _: &NativeHandle, _: &handle::Connector) -> Result<()> {
        Ok(())
    }
}

// Events are waited on through wait packets and never bound to the port.
impl Connect<EventHandle> for IocpMultiplexer {
    fn attach(&self, _: &NativeHandle) -> Result<handle::Connector> {
        Ok(handle::Connector::Iocp(Connector::default()))
    }

    fn detach(&self, _: &NativeHandle, _: &handle::Connector) -> Result<()> {
        Ok(())
    }
}

impl Drop for IocpMultiplexer {
    fn drop(&mut self) {
        if self.outstanding.get() != 0 {
            warn!(
                "completion port {:?} dropped with {} completions outstanding",
                self.port,
                self.outstanding.get()
            );
        }
        debug!("closing completion port {:?}", self.port);
        unsafe { CloseHandle(self.port) };
    }
}

impl fmt::Debug for IocpMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IocpMultiplexer")
            .field("port", &self.port)
            .field("slots", &self.slots.len())
            .field("outstanding", &self.outstanding.get())
            .finish()
    }
}
