use std::cmp;
use std::mem;
use std::ptr::{self, NonNull};

use lazy_static::lazy_static;
use log::warn;
use winapi::shared::minwindef::{DWORD, FALSE, TRUE};
use winapi::shared::ntdef::{HANDLE, LARGE_INTEGER, NTSTATUS};
use winapi::shared::ntstatus::{STATUS_END_OF_FILE, STATUS_PENDING, STATUS_SUCCESS, STATUS_TIMEOUT};
use winapi::shared::winerror::WAIT_TIMEOUT;
use winapi::um::handleapi::CloseHandle;
use winapi::um::synchapi::{
    CancelWaitableTimer, CreateWaitableTimerW, SetWaitableTimer, WaitForSingleObject,
};
use winapi::um::winbase::{WAIT_FAILED, WAIT_OBJECT_0};

use super::multiplexer::{Connector, IocpMultiplexer};
use super::ntapi::{
    nt_success, relative_timeout, IoStatusBlock, NtAssociateWaitCompletionPacket,
    NtCancelWaitCompletionPacket, NtCreateWaitCompletionPacket, NtReadFile, NtWriteFile,
};
use crate::deadline::Deadline;
use crate::handle::{
    self, Direction, EventHandle, FileHandle, Flush, GatherWriteAt, HandleView, ListenSocketHandle,
    Position, ScatterReadAt, Signal, SocketHandle, StreamAccept, StreamConnect, StreamRead,
    StreamWrite, Transfer, TransferParams, Wait, WaitParams,
};
use crate::multiplexer::slot_pool::SlotIndices;
use crate::multiplexer::{
    AsyncOperation, AsyncOperationImpl, PostSynchronousCompletion, RelationBuilder, RelationTable,
};
use crate::operation::composite::{Issue, ScatterGather};
use crate::operation::OperationCore;
use crate::{Error, Result};

lazy_static! {
    pub(crate) static ref RELATIONS: RelationTable = RelationTable::new()
        .with(
            RelationBuilder::<IocpMultiplexer, FileHandle>::new()
                .operation::<ScatterReadAt>()
                .operation::<GatherWriteAt>()
                .fallback::<Flush>()
                .build()
        )
        .with(
            RelationBuilder::<IocpMultiplexer, SocketHandle>::new()
                .operation::<StreamRead>()
                .operation::<StreamWrite>()
                .fallback::<StreamConnect>()
                .build()
        )
        .with(
            RelationBuilder::<IocpMultiplexer, ListenSocketHandle>::new()
                .fallback::<StreamAccept>()
                .build()
        )
        .with(
            RelationBuilder::<IocpMultiplexer, EventHandle>::new()
                .operation::<Wait>()
                .fallback::<Signal>()
                .build()
        );
}

fn connector(handle: &HandleView) -> Connector {
    match handle.connector {
        handle::Connector::Iocp(connector) => connector,
        _ => Connector::default(),
    }
}

/// A read or write of several buffers, one request per buffer.
pub struct TransferState {
    direction: Direction,
    position: Position,
    buffers: Vec<Vec<u8>>,
    /// Pool index of the slot of each issued request.
    slots: SlotIndices,
    sg: ScatterGather,
    transferred: usize,
}

fn transfer_result(io_status: &IoStatusBlock) -> Result<usize> {
    match io_status.status {
        STATUS_END_OF_FILE => Ok(0),
        status if nt_success(status) => Ok(io_status.information),
        status => Err(Error::from_ntstatus(status)),
    }
}

unsafe fn submit_transfer(
    multiplexer: &IocpMultiplexer,
    operation: NonNull<AsyncOperation<TransferState>>,
) -> Result<()> {
    let core_ptr = AsyncOperation::core_ptr(operation);
    let (core, handle, state) = AsyncOperation::parts(operation);

    if state.buffers.is_empty() {
        core.set_submitted();
        multiplexer.post_synchronous_completion(core_ptr, Ok(()));
        return Ok(());
    }

    let indices = multiplexer.acquire_slots(state.buffers.len())?;
    let skip_on_success = connector(handle).skip_completion_port_on_success;
    let raw = handle.native.raw() as HANDLE;
    let syscall = match state.direction {
        Direction::Read => NtReadFile,
        Direction::Write => NtWriteFile,
    };

    let TransferState {
        position,
        buffers,
        sg,
        ..
    } = state;
    let mut position = *position;
    let mut issued = 0;
    sg.issue_each(|index| {
        issued = index + 1;
        let buffer = &mut buffers[index];
        let slot = multiplexer.bind_slot(indices[index], core_ptr, index, on_transfer_completion);
        let mut offset: LARGE_INTEGER = mem::zeroed();
        let offset_ptr = match position {
            Position::At(at) => {
                *offset.QuadPart_mut() = at as i64;
                &mut offset as *mut LARGE_INTEGER
            }
            Position::Stream => ptr::null_mut(),
        };
        let len = cmp::min(buffer.len(), DWORD::MAX as usize);
        position = position.advance(len);
        let status = syscall(
            raw,
            ptr::null_mut(),
            ptr::null_mut(),
            slot.apc_context(),
            slot.io_status(),
            buffer.as_mut_ptr() as *mut _,
            len as u32,
            offset_ptr,
            ptr::null_mut(),
        );
        if status == STATUS_PENDING || (nt_success(status) && !skip_on_success) {
            multiplexer.expect_completion();
            return Issue::Pending;
        }
        let result = if nt_success(status) {
            transfer_result(&*slot.io_status())
        } else if status == STATUS_END_OF_FILE {
            Ok(0)
        } else {
            Err(Error::from_ntstatus(status))
        };
        multiplexer.release_slot(indices[index]);
        Issue::Completed(result)
    });
    for &index in &indices[issued..] {
        multiplexer.release_slot(index);
    }
    state.slots = indices;

    if state.sg.in_flight() != 0 {
        core.set_submitted();
        return Ok(());
    }
    // Everything completed while being issued.
    state.transferred = state.sg.transferred()?;
    core.set_submitted();
    multiplexer.post_synchronous_completion(core_ptr, Ok(()));
    Ok(())
}

unsafe fn on_transfer_completion(
    multiplexer: &IocpMultiplexer,
    core: NonNull<OperationCore>,
    index: usize,
    io_status: &IoStatusBlock,
) {
    let (_, handle, state) = AsyncOperation::<TransferState>::parts(AsyncOperation::from_core(core));
    for later in state.sg.complete(index, transfer_result(io_status)) {
        if let Err(err) = multiplexer.cancel_slot(handle.native, state.slots[later]) {
            warn!("Error: cancelling request {} of a short transfer: {}", later, err);
        }
    }
    if state.sg.is_done() {
        let result = state.sg.transferred().map(|transferred| {
            state.transferred = transferred;
        });
        multiplexer.complete(core, result);
    }
}

unsafe fn cancel_transfer(
    multiplexer: &IocpMultiplexer,
    operation: NonNull<AsyncOperation<TransferState>>,
) -> Result<()> {
    let (_, handle, state) = AsyncOperation::parts(operation);
    for index in state.sg.cancel_all() {
        multiplexer.cancel_slot(handle.native, state.slots[index])?;
    }
    Ok(())
}

macro_rules! transfer_operation {
    ($operation:ty, $direction:expr) => {
        impl AsyncOperationImpl<$operation> for IocpMultiplexer {
            type State = TransferState;

            fn construct(_: &HandleView, params: TransferParams) -> Result<TransferState> {
                Ok(TransferState {
                    direction: $direction,
                    position: params.position,
                    sg: ScatterGather::new(params.buffers.iter().map(Vec::len))?,
                    buffers: params.buffers,
                    slots: SlotIndices::new(),
                    transferred: 0,
                })
            }

            unsafe fn submit(&self, operation: NonNull<AsyncOperation<TransferState>>) -> Result<()> {
                submit_transfer(self, operation)
            }

            unsafe fn cancel_io(&self, operation: NonNull<AsyncOperation<TransferState>>) -> Result<()> {
                cancel_transfer(self, operation)
            }

            fn take_output(state: &mut TransferState) -> Option<Transfer> {
                Some(Transfer {
                    buffers: mem::take(&mut state.buffers),
                    transferred: state.transferred,
                })
            }
        }
    };
}

transfer_operation!(ScatterReadAt, Direction::Read);
transfer_operation!(GatherWriteAt, Direction::Write);
transfer_operation!(StreamRead, Direction::Read);
transfer_operation!(StreamWrite, Direction::Write);

const EVENT_PACKET: usize = 0;
const TIMER_PACKET: usize = 1;

/// A wait completion packet bound to one slot while armed.
struct WaitPacket {
    handle: HANDLE,
    slot: Option<u32>,
}

impl WaitPacket {
    fn new() -> WaitPacket {
        WaitPacket {
            handle: ptr::null_mut(),
            slot: None,
        }
    }

    fn create(&mut self) -> Result<HANDLE> {
        if self.handle.is_null() {
            let status = unsafe { NtCreateWaitCompletionPacket(&mut self.handle, 0, ptr::null_mut()) };
            if !nt_success(status) {
                return Err(Error::from_ntstatus(status));
            }
        }
        Ok(self.handle)
    }

    /// Remove the packet from the port before it is dequeued. False if its completion is
    /// still going to be delivered.
    fn cancel(&mut self, multiplexer: &IocpMultiplexer) -> Result<bool> {
        let slot = match self.slot {
            Some(slot) => slot,
            None => return Ok(false),
        };
        let status = unsafe { NtCancelWaitCompletionPacket(self.handle, TRUE) };
        if !nt_success(status) {
            return Err(Error::from_ntstatus(status));
        }
        if status == STATUS_PENDING {
            return Ok(false);
        }
        self.slot = None;
        multiplexer.forget_completion();
        multiplexer.release_slot(slot);
        Ok(true)
    }
}

impl Drop for WaitPacket {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

/// A wait on an event through the completion port. A finite deadline arms a second packet on
/// a waitable timer; whichever completes first cancels the other.
pub struct WaitState {
    deadline: Deadline,
    packets: [WaitPacket; 2],
    timer: HANDLE,
    result: Option<Result<()>>,
}

impl WaitState {
    fn is_armed(&self) -> bool {
        self.packets.iter().any(|packet| packet.slot.is_some())
    }

    fn timer(&mut self) -> Result<HANDLE> {
        if self.timer.is_null() {
            self.timer = unsafe { CreateWaitableTimerW(ptr::null_mut(), TRUE, ptr::null()) };
            if self.timer.is_null() {
                return Err(Error::last_os_error());
            }
        }
        Ok(self.timer)
    }
}

impl Drop for WaitState {
    fn drop(&mut self) {
        if !self.timer.is_null() {
            unsafe { CloseHandle(self.timer) };
        }
    }
}

/// Associate packet `which` with `target`. Returns true if the target was already signaled, in
/// which case nothing was queued.
unsafe fn arm_packet(
    multiplexer: &IocpMultiplexer,
    core: NonNull<OperationCore>,
    state: &mut WaitState,
    which: usize,
    target: HANDLE,
    slot: u32,
    status: NTSTATUS,
) -> Result<bool> {
    let packet = &mut state.packets[which];
    let handle = packet.create()?;
    let bound = multiplexer.bind_slot(slot, core, which, on_wait_completion);
    let mut already_signaled = 0;
    let result = NtAssociateWaitCompletionPacket(
        handle,
        multiplexer.completion_port(),
        target,
        ptr::null_mut(),
        bound.apc_context(),
        status,
        0,
        &mut already_signaled,
    );
    if !nt_success(result) {
        return Err(Error::from_ntstatus(result));
    }
    if already_signaled != 0 {
        // Take back the completion that was queued anyway.
        let cancelled = NtCancelWaitCompletionPacket(handle, TRUE);
        debug_assert!(nt_success(cancelled));
        return Ok(true);
    }
    packet.slot = Some(slot);
    multiplexer.expect_completion();
    Ok(false)
}

unsafe fn finish_wait(multiplexer: &IocpMultiplexer, core: NonNull<OperationCore>, state: &mut WaitState) {
    if !state.timer.is_null() {
        CancelWaitableTimer(state.timer);
    }
    let result = state.result.take().unwrap_or(Err(Error::OperationCanceled));
    multiplexer.complete(core, result);
}

unsafe fn on_wait_completion(
    multiplexer: &IocpMultiplexer,
    core: NonNull<OperationCore>,
    which: usize,
    io_status: &IoStatusBlock,
) {
    let (_, _, state) = AsyncOperation::<WaitState>::parts(AsyncOperation::from_core(core));
    state.packets[which].slot = None;
    if which == EVENT_PACKET {
        // The wait consumed the signal, whatever else happened.
        state.result = Some(if nt_success(io_status.status) {
            Ok(())
        } else {
            Err(Error::from_ntstatus(io_status.status))
        });
    } else if state.result.is_none() {
        state.result = Some(Err(Error::TimedOut));
    }

    let other = 1 - which;
    if let Err(err) = state.packets[other].cancel(multiplexer) {
        warn!("Error: cancelling a wait packet: {}", err);
    }
    if !state.is_armed() {
        finish_wait(multiplexer, core, state);
    }
}

impl AsyncOperationImpl<Wait> for IocpMultiplexer {
    type State = WaitState;

    fn construct(_: &HandleView, params: WaitParams) -> Result<WaitState> {
        Ok(WaitState {
            deadline: params.deadline.start(),
            packets: [WaitPacket::new(), WaitPacket::new()],
            timer: ptr::null_mut(),
            result: None,
        })
    }

    unsafe fn submit(&self, operation: NonNull<AsyncOperation<WaitState>>) -> Result<()> {
        let core_ptr = AsyncOperation::core_ptr(operation);
        let (core, handle, state) = AsyncOperation::parts(operation);
        let event = handle.native.raw() as HANDLE;

        if state.deadline.is_instant() {
            let result = match WaitForSingleObject(event, 0) {
                WAIT_OBJECT_0 => Ok(()),
                WAIT_TIMEOUT => Err(Error::TimedOut),
                WAIT_FAILED => return Err(Error::last_os_error()),
                _ => return Err(Error::InvalidArgument),
            };
            core.set_submitted();
            self.post_synchronous_completion(core_ptr, result);
            return Ok(());
        }

        let remaining = state.deadline.remaining();
        let slots = self.acquire_slots(if remaining.is_some() { 2 } else { 1 })?;
        let release = |from: usize| {
            for &slot in &slots[from..] {
                self.release_slot(slot);
            }
        };

        match arm_packet(self, core_ptr, state, EVENT_PACKET, event, slots[0], STATUS_SUCCESS) {
            Ok(false) => {}
            Ok(true) => {
                release(0);
                core.set_submitted();
                self.post_synchronous_completion(core_ptr, Ok(()));
                return Ok(());
            }
            Err(err) => {
                release(0);
                return Err(err);
            }
        }

        if let Some(remaining) = remaining {
            let armed = state.timer().and_then(|timer| {
                let mut due = relative_timeout(remaining);
                if SetWaitableTimer(timer, &mut due, 0, None, ptr::null_mut(), FALSE) == 0 {
                    return Err(Error::last_os_error());
                }
                arm_packet(self, core_ptr, state, TIMER_PACKET, timer, slots[1], STATUS_TIMEOUT)
            });
            let failure = match armed {
                Ok(false) => None,
                // Expired before the packet was queued.
                Ok(true) => Some(Error::TimedOut),
                Err(err) => Some(err),
            };
            if let Some(err) = failure {
                release(1);
                match state.packets[EVENT_PACKET].cancel(self) {
                    Ok(true) if err == Error::TimedOut => {
                        core.set_submitted();
                        self.post_synchronous_completion(core_ptr, Err(err));
                        return Ok(());
                    }
                    Ok(true) => return Err(err),
                    // The event completed meanwhile; conclude through its packet.
                    _ => state.result = Some(Err(err)),
                }
            }
        }

        core.set_submitted();
        Ok(())
    }

    unsafe fn cancel_io(&self, operation: NonNull<AsyncOperation<WaitState>>) -> Result<()> {
        let core_ptr = AsyncOperation::core_ptr(operation);
        let (_, _, state) = AsyncOperation::parts(operation);
        if !state.is_armed() {
            return Ok(());
        }
        let event = state.packets[EVENT_PACKET].cancel(self)?;
        state.packets[TIMER_PACKET].cancel(self)?;
        if event && state.result.is_none() {
            state.result = Some(Err(Error::OperationCanceled));
        }
        if !state.is_armed() {
            finish_wait(self, core_ptr, state);
        }
        Ok(())
    }

    fn take_output(_: &mut WaitState) -> Option<()> {
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;
    use crate::multiplexer::{Multiplexer, PumpMode};
    use crate::sys::windows::IocpOptions;
    use futures_lite::pin;
    use futures_test::task::noop_context;
    use std::fs::OpenOptions;
    use std::future::Future;
    use std::os::windows::fs::OpenOptionsExt;
    use std::rc::Rc;
    use std::task::Poll;
    use std::time::{Duration, Instant};
    use winapi::um::winbase::FILE_FLAG_OVERLAPPED;

    fn overlapped_tempfile() -> std::fs::File {
        let path = std::env::temp_dir().join(format!(
            "iomux-{}-{:016x}",
            std::process::id(),
            fastrand::u64(..)
        ));
        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .custom_flags(FILE_FLAG_OVERLAPPED | winapi::um::winbase::FILE_FLAG_DELETE_ON_CLOSE)
            .open(path)
            .unwrap()
    }

    #[test]
    fn test_event_wait() {
        let multiplexer = Rc::new(IocpMultiplexer::new(&IocpOptions::default()).unwrap());
        let mut event = EventHandle::new().unwrap();
        event.attach(multiplexer).unwrap();

        event.signal().unwrap();
        event.wait(Deadline::Never).unwrap();
        assert_eq!(Err(Error::TimedOut), event.wait(Deadline::Instant));

        let started = Instant::now();
        assert_eq!(
            Err(Error::TimedOut),
            event.wait(Deadline::after(Duration::from_millis(20)))
        );
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_file_round_trip() {
        let multiplexer = Rc::new(IocpMultiplexer::new(&IocpOptions::default()).unwrap());
        let mut file = FileHandle::from_std(overlapped_tempfile());
        file.attach(multiplexer).unwrap();

        let written = file
            .write_at(0, vec![b"abc".to_vec(), b"defg".to_vec()])
            .unwrap();
        assert_eq!(7, written.transferred);

        let read = file.read_at(1, vec![vec![0; 2], vec![0; 8]]).unwrap();
        assert_eq!(6, read.transferred);
        assert_eq!(b"bc", &read.buffers[0][..]);
        assert_eq!(b"defg", &read.buffers[1][..4]);
    }

    #[test]
    fn test_accept_connection() {
        use socket2::{Domain, SockAddr, Type};

        let multiplexer = Rc::new(IocpMultiplexer::new(&IocpOptions::default()).unwrap());
        let any = SockAddr::from("127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap());
        let mut listener = ListenSocketHandle::bind(&any, 4).unwrap();
        listener.attach(multiplexer.clone()).unwrap();
        let mut client = SocketHandle::new(Domain::IPV4, Type::STREAM).unwrap();
        client.attach(multiplexer).unwrap();

        client.connect(listener.local_addr().unwrap()).unwrap();
        let accepted = listener.accept().unwrap();

        let written = client.write(vec![b"ack".to_vec()]).unwrap();
        assert_eq!(3, written.transferred);
        let read = accepted.socket.read(vec![vec![0; 3]]).unwrap();
        assert_eq!(b"ack", &read.buffers[0][..]);
    }

    #[test]
    fn test_slot_exhaustion() {
        let options = IocpOptions {
            slot_count: 1,
            ..IocpOptions::default()
        };
        let multiplexer = Rc::new(IocpMultiplexer::new(&options).unwrap());
        let mut event = EventHandle::new().unwrap();
        event.attach(multiplexer.clone()).unwrap();

        let mut cx = noop_context();
        let first = event.wait_async(Deadline::Never).into_future();
        pin!(first);
        assert!(first.as_mut().poll(&mut cx).is_pending());

        let second = event.wait_async(Deadline::Never).into_future();
        pin!(second);
        assert_eq!(
            Poll::Ready(Err(Error::TooManyConcurrentAsyncOperations)),
            second.as_mut().poll(&mut cx)
        );
        multiplexer.pump(PumpMode::ALL, Deadline::Instant).unwrap();

        first.cancel().unwrap();
        let result = loop {
            multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
            if let Poll::Ready(result) = first.as_mut().poll(&mut cx) {
                break result;
            }
        };
        assert_eq!(Err(Error::OperationCanceled), result);
    }
}
