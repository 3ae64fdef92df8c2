//! io_uring implementations of the operations on files, sockets and events.
use std::cmp;
use std::mem;
use std::os::unix::io::FromRawFd;
use std::ptr::NonNull;

use lazy_static::lazy_static;
use socket2::{SockAddr, Socket};

use super::abi::{
    KernelTimespec, Sqe, IORING_OP_ACCEPT, IORING_OP_CONNECT, IORING_OP_POLL_ADD, IORING_OP_READ,
    IORING_OP_WRITE, IOSQE_IO_LINK,
};
use super::files::FileDescriptor;
use super::multiplexer::IoUringMultiplexer;
use super::user_data::{IoHandler, IoSlot};
use crate::deadline::Deadline;
use crate::handle::{
    consume_event, Accepted, Direction, EventHandle, FileHandle, Flush, GatherWriteAt, HandleView,
    ListenSocketHandle, Position, ScatterReadAt, Signal, SocketHandle, StreamAccept,
    StreamConnect, StreamRead, StreamWrite, Transfer, TransferParams, Wait, WaitParams,
};
use crate::multiplexer::{AsyncOperation, AsyncOperationImpl, RelationBuilder, RelationTable};
use crate::operation::composite::ScatterGather;
use crate::operation::OperationCore;
use crate::{Error, Result};

lazy_static! {
    pub(crate) static ref RELATIONS: RelationTable = RelationTable::new()
        .with(
            RelationBuilder::<IoUringMultiplexer, FileHandle>::new()
                .operation::<ScatterReadAt>()
                .operation::<GatherWriteAt>()
                .fallback::<Flush>()
                .build()
        )
        .with(
            RelationBuilder::<IoUringMultiplexer, SocketHandle>::new()
                .operation::<StreamRead>()
                .operation::<StreamWrite>()
                .operation::<StreamConnect>()
                .build()
        )
        .with(
            RelationBuilder::<IoUringMultiplexer, ListenSocketHandle>::new()
                .operation::<StreamAccept>()
                .build()
        )
        .with(
            RelationBuilder::<IoUringMultiplexer, EventHandle>::new()
                .operation::<Wait>()
                .fallback::<Signal>()
                .build()
        );
}

/// A read or write of several buffers, one linked request per buffer.
///
/// A short or failed request breaks the link, so the kernel cancels every later request itself.
#[repr(C)]
pub struct TransferState {
    handler: IoHandler,
    direction: Direction,
    position: Position,
    buffers: Vec<Vec<u8>>,
    slots: Box<[IoSlot]>,
    sg: ScatterGather,
    transferred: usize,
}

impl TransferState {
    fn new(direction: Direction, params: TransferParams) -> Result<TransferState> {
        let sg = ScatterGather::new(params.buffers.iter().map(Vec::len))?;
        Ok(TransferState {
            handler: IoHandler::new(on_transfer_completion),
            direction,
            position: params.position,
            slots: (0..params.buffers.len()).map(IoSlot::new).collect(),
            buffers: params.buffers,
            sg,
            transferred: 0,
        })
    }

    fn take_output(&mut self) -> Option<Transfer> {
        Some(Transfer {
            buffers: mem::take(&mut self.buffers),
            transferred: self.transferred,
        })
    }
}

unsafe fn submit_transfer(
    multiplexer: &IoUringMultiplexer,
    operation: NonNull<AsyncOperation<TransferState>>,
) -> Result<()> {
    let core_ptr = AsyncOperation::core_ptr(operation);
    let (core, handle, state) = AsyncOperation::parts(operation);

    if state.buffers.is_empty() {
        core.set_submitted();
        multiplexer.complete(core_ptr, Ok(()));
        return Ok(());
    }
    if state.buffers.len() > multiplexer.sq.entries() as usize {
        // Would never fit into the ring.
        return Err(Error::InvalidArgument);
    }

    state.handler.bind(core_ptr);
    let (fd, fd_flags) = FileDescriptor::of(handle).target();
    let opcode = match state.direction {
        Direction::Read => IORING_OP_READ,
        Direction::Write => IORING_OP_WRITE,
    };

    let mut context = multiplexer.record();
    let mut position = state.position;
    for (index, buffer) in state.buffers.iter_mut().enumerate() {
        let slot = &state.slots[index];
        slot.bind(&state.handler);
        if index != 0 {
            context.link_last(IOSQE_IO_LINK);
        }
        context.push(Sqe {
            opcode,
            flags: fd_flags,
            fd,
            off: match position {
                Position::At(offset) => offset,
                // -1: the current file position.
                Position::Stream => u64::MAX,
            },
            addr: buffer.as_mut_ptr() as u64,
            len: cmp::min(buffer.len(), u32::MAX as usize) as u32,
            user_data: slot.user_data(),
            ..Sqe::default()
        })?;
        position = position.advance(buffer.len());
    }
    context.commit();

    for index in 0..state.buffers.len() {
        state.sg.mark_issued(index);
    }
    state.sg.finish_issuing();
    core.set_submitted();
    Ok(())
}

unsafe fn on_transfer_completion(
    multiplexer: &IoUringMultiplexer,
    core: NonNull<OperationCore>,
    index: usize,
    res: i32,
) {
    let (_, _, state) = AsyncOperation::<TransferState>::parts(AsyncOperation::from_core(core));
    let result = if res >= 0 {
        Ok(res as usize)
    } else {
        Err(Error::from_kernel_result(res))
    };
    // Later requests are linked and get cancelled by the kernel.
    let _ = state.sg.complete(index, result);
    if state.sg.is_done() {
        let result = state.sg.transferred().map(|transferred| {
            state.transferred = transferred;
        });
        multiplexer.complete(core, result);
    }
}

unsafe fn cancel_transfer(
    multiplexer: &IoUringMultiplexer,
    operation: NonNull<AsyncOperation<TransferState>>,
) -> Result<()> {
    let (_, _, state) = AsyncOperation::parts(operation);
    let pending = state.sg.cancel_all();
    let slots = &state.slots;
    multiplexer.cancel_user_data(pending.into_iter().map(|index| slots[index].user_data()))
}

macro_rules! transfer_operation {
    ($operation:ty, $direction:expr) => {
        impl AsyncOperationImpl<$operation> for IoUringMultiplexer {
            type State = TransferState;

            fn construct(_: &HandleView, params: TransferParams) -> Result<TransferState> {
                TransferState::new($direction, params)
            }

            unsafe fn submit(&self, operation: NonNull<AsyncOperation<TransferState>>) -> Result<()> {
                submit_transfer(self, operation)
            }

            unsafe fn cancel_io(&self, operation: NonNull<AsyncOperation<TransferState>>) -> Result<()> {
                cancel_transfer(self, operation)
            }

            fn take_output(state: &mut TransferState) -> Option<Transfer> {
                state.take_output()
            }
        }
    };
}

transfer_operation!(ScatterReadAt, Direction::Read);
transfer_operation!(GatherWriteAt, Direction::Write);
transfer_operation!(StreamRead, Direction::Read);
transfer_operation!(StreamWrite, Direction::Write);

/// Readiness poll of an eventfd, optionally bounded by a linked timeout.
#[repr(C)]
pub struct WaitState {
    handler: IoHandler,
    deadline: Deadline,
    timespec: KernelTimespec,
    timed: bool,
    cancel_requested: bool,
}

/// Record the poll, and the timeout if the deadline is finite.
unsafe fn arm_wait(
    multiplexer: &IoUringMultiplexer,
    handle: &HandleView,
    state: &mut WaitState,
) -> Result<()> {
    let (fd, fd_flags) = FileDescriptor::of(handle).target();
    let mut context = multiplexer.record();
    context.push(Sqe {
        opcode: IORING_OP_POLL_ADD,
        flags: fd_flags,
        fd,
        op_flags: libc::POLLIN as u32,
        user_data: state.handler.user_data(),
        ..Sqe::default()
    })?;
    state.timed = match state.deadline.remaining() {
        Some(remaining) => {
            state.timespec = KernelTimespec::from(remaining);
            context.link_timeout(&state.timespec)?;
            true
        }
        None => false,
    };
    context.commit();
    Ok(())
}

unsafe fn on_wait_completion(
    multiplexer: &IoUringMultiplexer,
    core: NonNull<OperationCore>,
    _: usize,
    res: i32,
) {
    let (_, handle, state) = AsyncOperation::<WaitState>::parts(AsyncOperation::from_core(core));
    let result = if res >= 0 {
        match consume_event(handle.native) {
            Ok(true) => Ok(()),
            // Another waiter took the signal.
            Ok(false) if state.cancel_requested => Err(Error::OperationCanceled),
            Ok(false) if state.timed && state.deadline.is_instant() => Err(Error::TimedOut),
            Ok(false) => match arm_wait(multiplexer, handle, state) {
                Ok(()) => return,
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        }
    } else if res == -libc::ECANCELED && state.timed && !state.cancel_requested {
        Err(Error::TimedOut)
    } else {
        Err(Error::from_kernel_result(res))
    };
    multiplexer.complete(core, result);
}

impl AsyncOperationImpl<Wait> for IoUringMultiplexer {
    type State = WaitState;

    fn construct(_: &HandleView, params: WaitParams) -> Result<WaitState> {
        Ok(WaitState {
            handler: IoHandler::new(on_wait_completion),
            deadline: params.deadline.start(),
            timespec: KernelTimespec::default(),
            timed: false,
            cancel_requested: false,
        })
    }

    unsafe fn submit(&self, operation: NonNull<AsyncOperation<WaitState>>) -> Result<()> {
        let core_ptr = AsyncOperation::core_ptr(operation);
        let (core, handle, state) = AsyncOperation::parts(operation);
        state.handler.bind(core_ptr);
        arm_wait(self, handle, state)?;
        core.set_submitted();
        Ok(())
    }

    unsafe fn cancel_io(&self, operation: NonNull<AsyncOperation<WaitState>>) -> Result<()> {
        let (_, _, state) = AsyncOperation::parts(operation);
        state.cancel_requested = true;
        self.cancel_user_data(Some(state.handler.user_data()))
    }

    fn take_output(_: &mut WaitState) -> Option<()> {
        Some(())
    }
}

/// Record a single request completing straight to `handler`.
unsafe fn push_single(
    multiplexer: &IoUringMultiplexer,
    handle: &HandleView,
    handler: &IoHandler,
    sqe: Sqe,
) -> Result<()> {
    let (fd, fd_flags) = FileDescriptor::of(handle).target();
    let mut context = multiplexer.record();
    context.push(Sqe {
        flags: fd_flags,
        fd,
        user_data: handler.user_data(),
        ..sqe
    })?;
    context.commit();
    Ok(())
}

#[repr(C)]
pub struct ConnectState {
    handler: IoHandler,
    address: SockAddr,
}

unsafe fn on_connect_completion(
    multiplexer: &IoUringMultiplexer,
    core: NonNull<OperationCore>,
    _: usize,
    res: i32,
) {
    let result = if res >= 0 {
        Ok(())
    } else {
        Err(Error::from_kernel_result(res))
    };
    multiplexer.complete(core, result);
}

impl AsyncOperationImpl<StreamConnect> for IoUringMultiplexer {
    type State = ConnectState;

    fn construct(_: &HandleView, address: SockAddr) -> Result<ConnectState> {
        Ok(ConnectState {
            handler: IoHandler::new(on_connect_completion),
            address,
        })
    }

    unsafe fn submit(&self, operation: NonNull<AsyncOperation<ConnectState>>) -> Result<()> {
        let core_ptr = AsyncOperation::core_ptr(operation);
        let (core, handle, state) = AsyncOperation::parts(operation);
        state.handler.bind(core_ptr);
        push_single(
            self,
            handle,
            &state.handler,
            Sqe {
                opcode: IORING_OP_CONNECT,
                addr: state.address.as_ptr() as u64,
                off: state.address.len() as u64,
                ..Sqe::default()
            },
        )?;
        core.set_submitted();
        Ok(())
    }

    unsafe fn cancel_io(&self, operation: NonNull<AsyncOperation<ConnectState>>) -> Result<()> {
        let (_, _, state) = AsyncOperation::parts(operation);
        self.cancel_user_data(Some(state.handler.user_data()))
    }

    fn take_output(_: &mut ConnectState) -> Option<()> {
        Some(())
    }
}

/// The kernel fills in the peer address while the accept is in flight.
#[repr(C)]
pub struct AcceptState {
    handler: IoHandler,
    storage: libc::sockaddr_storage,
    length: libc::socklen_t,
    accepted: Option<Accepted>,
}

unsafe fn on_accept_completion(
    multiplexer: &IoUringMultiplexer,
    core: NonNull<OperationCore>,
    _: usize,
    res: i32,
) {
    let (_, _, state) = AsyncOperation::<AcceptState>::parts(AsyncOperation::from_core(core));
    let result = if res >= 0 {
        // Owned from here on, even if nobody takes the output.
        let socket = Socket::from_raw_fd(res);
        state.accepted = Some(Accepted {
            socket: SocketHandle::from_socket(socket),
            address: SockAddr::new(state.storage, state.length),
        });
        Ok(())
    } else {
        Err(Error::from_kernel_result(res))
    };
    multiplexer.complete(core, result);
}

impl AsyncOperationImpl<StreamAccept> for IoUringMultiplexer {
    type State = AcceptState;

    fn construct(_: &HandleView, _: ()) -> Result<AcceptState> {
        Ok(AcceptState {
            handler: IoHandler::new(on_accept_completion),
            storage: unsafe { mem::zeroed() },
            length: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
            accepted: None,
        })
    }

    unsafe fn submit(&self, operation: NonNull<AsyncOperation<AcceptState>>) -> Result<()> {
        let core_ptr = AsyncOperation::core_ptr(operation);
        let (core, handle, state) = AsyncOperation::parts(operation);
        state.handler.bind(core_ptr);
        push_single(
            self,
            handle,
            &state.handler,
            Sqe {
                opcode: IORING_OP_ACCEPT,
                addr: &mut state.storage as *mut libc::sockaddr_storage as u64,
                // addr2: where the kernel stores the address length.
                off: &mut state.length as *mut libc::socklen_t as u64,
                op_flags: libc::SOCK_CLOEXEC as u32,
                ..Sqe::default()
            },
        )?;
        core.set_submitted();
        Ok(())
    }

    unsafe fn cancel_io(&self, operation: NonNull<AsyncOperation<AcceptState>>) -> Result<()> {
        let (_, _, state) = AsyncOperation::parts(operation);
        self.cancel_user_data(Some(state.handler.user_data()))
    }

    fn take_output(state: &mut AcceptState) -> Option<Accepted> {
        state.accepted.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{Handle, HandleType, IoOperation, OperationArgs};
    use crate::multiplexer::{Multiplexer, PumpMode};
    use crate::operation::{erase_listener, Listener, OperationStorage, Status};
    use std::cell::RefCell;
    use crate::sys::linux::multiplexer::tests::test_multiplexer;
    use crate::sys::linux::IoUringOptions;
    use crate::test_utils::tempfile;
    use futures_lite::pin;
    use futures_test::task::noop_context;
    use std::future::Future;
    use std::rc::Rc;
    use std::task::Poll;
    use std::time::{Duration, Instant};

    #[test]
    fn test_event_wait() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => Rc::new(multiplexer),
            None => return,
        };
        let mut event = EventHandle::new().unwrap();
        event.attach(multiplexer).unwrap();

        event.signal().unwrap();
        event.wait(Deadline::Never).unwrap();

        let started = Instant::now();
        assert_eq!(
            Err(Error::TimedOut),
            event.wait(Deadline::after(Duration::from_millis(20)))
        );
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(Err(Error::TimedOut), event.wait(Deadline::Instant));
    }

    #[test]
    fn test_socket_round_trip() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => Rc::new(multiplexer),
            None => return,
        };
        let (mut a, mut b) = SocketHandle::pair().unwrap();
        a.attach(multiplexer.clone()).unwrap();
        b.attach(multiplexer).unwrap();

        let written = a.write(vec![b"hello ".to_vec(), b"world".to_vec()]).unwrap();
        assert_eq!(11, written.transferred);

        // The first buffer comes back short, ending the transfer.
        let read = b.read(vec![vec![0; 32], vec![0; 4]]).unwrap();
        assert_eq!(11, read.transferred);
        assert_eq!(b"hello world", &read.buffers[0][..11]);
    }

    #[test]
    fn test_file_with_fixed_files() {
        let options = IoUringOptions {
            fixed_file_capacity: 4,
            ..IoUringOptions::default()
        };
        let multiplexer = match test_multiplexer(&options) {
            Some(multiplexer) => Rc::new(multiplexer),
            None => return,
        };
        let mut file = FileHandle::from_std(tempfile());
        file.attach(multiplexer.clone()).unwrap();
        if multiplexer.has_fixed_files() {
            assert_eq!(
                crate::handle::Connector::IoUring(super::super::Connector {
                    file_index: Some(0)
                }),
                file.platform().view().connector
            );
        }

        let written = file
            .write_at(0, vec![b"abc".to_vec(), b"defg".to_vec()])
            .unwrap();
        assert_eq!(7, written.transferred);
        file.flush().unwrap();

        let read = file.read_at(1, vec![vec![0; 2], vec![0; 8]]).unwrap();
        assert_eq!(6, read.transferred);
        assert_eq!(b"bc", &read.buffers[0][..]);
        assert_eq!(b"defg", &read.buffers[1][..4]);

        file.detach().unwrap();
    }

    #[test]
    fn test_many_waits_conclude_once() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => Rc::new(multiplexer),
            None => return,
        };
        let mut events = Vec::new();
        for _ in 0..16 {
            let mut event = EventHandle::new().unwrap();
            event.attach(multiplexer.clone()).unwrap();
            event.signal().unwrap();
            events.push(event);
        }

        let mut cx = noop_context();
        let mut futures: Vec<_> = events
            .iter()
            .map(|event| Box::pin(event.wait_async(Deadline::Never).into_future()))
            .collect();
        for future in futures.iter_mut() {
            assert!(future.as_mut().poll(&mut cx).is_pending());
        }

        let mut concluded = vec![false; futures.len()];
        while concluded.iter().any(|done| !done) {
            multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
            for (future, done) in futures.iter_mut().zip(concluded.iter_mut()) {
                if *done {
                    continue;
                }
                if let Poll::Ready(result) = future.as_mut().poll(&mut cx) {
                    assert_eq!(Ok(()), result);
                    *done = true;
                }
            }
        }
        assert!(!multiplexer.pump(PumpMode::ALL, Deadline::Instant).unwrap().made_progress());
    }

    #[test]
    fn test_linked_read_fails_on_second_buffer() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => Rc::new(multiplexer),
            None => return,
        };
        let (a, mut b) = SocketHandle::pair().unwrap();
        b.attach(multiplexer.clone()).unwrap();
        a.write(vec![b"abcd".to_vec()]).unwrap();
        // Left unread, so closing `a` resets the connection.
        b.write(vec![b"xy".to_vec()]).unwrap();

        let future = b
            .read_async(vec![vec![0; 4], vec![0; 8], vec![0; 4]])
            .into_future();
        pin!(future);
        let mut cx = noop_context();
        assert!(future.as_mut().poll(&mut cx).is_pending());
        multiplexer.pump(PumpMode::ALL, Deadline::Instant).unwrap();
        assert!(future.as_mut().poll(&mut cx).is_pending());

        drop(a);
        let transfer = loop {
            multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
            if let Poll::Ready(result) = future.as_mut().poll(&mut cx) {
                break result.unwrap();
            }
        };
        // The first buffer is kept, the failure ends the chain.
        assert_eq!(4, transfer.transferred);
        assert_eq!(b"abcd", &transfer.buffers[0][..]);
        assert!(multiplexer.is_idle());
    }

    #[test]
    fn test_cancel_transfer_returns_budget() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => Rc::new(multiplexer),
            None => return,
        };
        let (_a, mut b) = SocketHandle::pair().unwrap();
        b.attach(multiplexer.clone()).unwrap();

        let future = b.read_async(vec![vec![0; 4], vec![0; 4]]).into_future();
        pin!(future);
        let mut cx = noop_context();
        assert!(future.as_mut().poll(&mut cx).is_pending());
        multiplexer.pump(PumpMode::ALL, Deadline::Instant).unwrap();
        assert!(!multiplexer.is_idle());

        future.cancel().unwrap();
        let result = loop {
            multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
            if let Poll::Ready(result) = future.as_mut().poll(&mut cx) {
                break result;
            }
        };
        assert_eq!(Err(Error::OperationCanceled), result.map(|_| ()));
        // The completion budget is whole again.
        while !multiplexer.is_idle() {
            multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
        }
    }

    fn loopback_listener() -> ListenSocketHandle {
        let any = SockAddr::from("127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap());
        ListenSocketHandle::bind(&any, 4).unwrap()
    }

    #[test]
    fn test_accept_and_connect() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => Rc::new(multiplexer),
            None => return,
        };
        let mut listener = loopback_listener();
        listener.attach(multiplexer.clone()).unwrap();
        let address = listener.local_addr().unwrap();
        let mut client = SocketHandle::new(socket2::Domain::IPV4, socket2::Type::STREAM).unwrap();
        client.attach(multiplexer.clone()).unwrap();

        let mut cx = noop_context();
        let accept = listener.accept_async().into_future();
        pin!(accept);
        assert!(accept.as_mut().poll(&mut cx).is_pending());
        let connect = client.connect_async(address).into_future();
        pin!(connect);
        assert!(connect.as_mut().poll(&mut cx).is_pending());

        let (mut accepted, mut connected) = (None, None);
        while accepted.is_none() || connected.is_none() {
            multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
            if accepted.is_none() {
                if let Poll::Ready(result) = accept.as_mut().poll(&mut cx) {
                    accepted = Some(result.unwrap());
                }
            }
            if connected.is_none() {
                if let Poll::Ready(result) = connect.as_mut().poll(&mut cx) {
                    connected = Some(result);
                }
            }
        }
        assert_eq!(Some(Ok(())), connected);
        let mut accepted = accepted.unwrap();
        assert_eq!(
            Some(std::net::Ipv4Addr::LOCALHOST),
            accepted.address.as_socket_ipv4().map(|a| *a.ip())
        );

        accepted.socket.attach(multiplexer.clone()).unwrap();
        client.write(vec![b"over the ring".to_vec()]).unwrap();
        let read = accepted.socket.read(vec![vec![0; 13]]).unwrap();
        assert_eq!(b"over the ring", &read.buffers[0][..]);
        assert!(multiplexer.is_idle());
    }

    #[test]
    fn test_cancel_pending_accept() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => Rc::new(multiplexer),
            None => return,
        };
        let mut listener = loopback_listener();
        listener.attach(multiplexer.clone()).unwrap();

        let future = listener.accept_async().into_future();
        pin!(future);
        let mut cx = noop_context();
        assert!(future.as_mut().poll(&mut cx).is_pending());
        multiplexer.pump(PumpMode::ALL, Deadline::Instant).unwrap();

        future.cancel().unwrap();
        let result = loop {
            multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
            if let Poll::Ready(result) = future.as_mut().poll(&mut cx) {
                break result;
            }
        };
        assert_eq!(Err(Error::OperationCanceled), result.map(|_| ()));
        while !multiplexer.is_idle() {
            multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<Status>>,
    }

    impl Listener for Recorder {
        fn submitted(&self, operation: &OperationCore) {
            self.events.borrow_mut().push(operation.status());
        }

        fn completed(&self, operation: &OperationCore) {
            self.events.borrow_mut().push(operation.status());
        }

        fn concluded(&self, result: Result<()>) {
            assert_eq!(Ok(()), result);
            self.events.borrow_mut().push(Status::Concluded);
        }
    }

    #[test]
    fn test_listener_order_across_operations() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => Rc::new(multiplexer),
            None => return,
        };
        const COUNT: usize = 8;
        let mut events = Vec::new();
        for _ in 0..COUNT {
            let mut event = EventHandle::new().unwrap();
            event.attach(multiplexer.clone()).unwrap();
            event.signal().unwrap();
            events.push(event);
        }
        let descriptor = multiplexer
            .find_handle_relation(HandleType::of::<EventHandle>())
            .unwrap()
            .operation(Wait::INDEX)
            .unwrap();

        let recorders: Vec<Recorder> = (0..COUNT).map(|_| Recorder::default()).collect();
        let mut storages: Vec<Box<OperationStorage>> =
            (0..COUNT).map(|_| Box::new(OperationStorage::new())).collect();
        let mut operations = Vec::new();
        for ((event, recorder), storage) in events.iter().zip(&recorders).zip(storages.iter_mut()) {
            let storage = storage.reserve(descriptor.requirements()).unwrap();
            let mut args = OperationArgs::<Wait>::new(
                event.platform().view(),
                WaitParams {
                    deadline: Deadline::Never,
                },
            );
            let operation = unsafe {
                multiplexer
                    .construct_and_start(descriptor, storage, &mut args, Some(erase_listener(recorder)))
                    .unwrap()
            };
            operations.push(operation);
        }

        while !operations.iter().all(|operation| operation.core().is_concluded()) {
            multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
        }
        for recorder in &recorders {
            assert_eq!(
                vec![Status::Submitted, Status::Completed, Status::Concluded],
                *recorder.events.borrow()
            );
        }
        drop(operations);
        assert!(multiplexer.is_idle());
    }

    #[test]
    fn test_cancel_wait() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => Rc::new(multiplexer),
            None => return,
        };
        let mut event = EventHandle::new().unwrap();
        event.attach(multiplexer.clone()).unwrap();

        let future = event.wait_async(Deadline::Never).into_future();
        pin!(future);
        let mut cx = noop_context();
        assert!(future.as_mut().poll(&mut cx).is_pending());
        multiplexer.pump(PumpMode::ALL, Deadline::Instant).unwrap();
        assert!(future.as_mut().poll(&mut cx).is_pending());

        future.cancel().unwrap();
        let result = loop {
            multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
            if let Poll::Ready(result) = future.as_mut().poll(&mut cx) {
                break result;
            }
        };
        assert_eq!(Err(Error::OperationCanceled), result);
    }

    #[test]
    fn test_cancel_after_completion() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => Rc::new(multiplexer),
            None => return,
        };
        let mut event = EventHandle::new().unwrap();
        event.attach(multiplexer.clone()).unwrap();
        event.signal().unwrap();

        let future = event.wait_async(Deadline::Never).into_future();
        pin!(future);
        let mut cx = noop_context();
        assert!(future.as_mut().poll(&mut cx).is_pending());
        let result = loop {
            multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
            if let Poll::Ready(result) = future.as_mut().poll(&mut cx) {
                break result;
            }
        };
        assert_eq!(Ok(()), result);
        // Concluded: cancellation has nothing left to do.
        future.cancel().unwrap();
    }
}
