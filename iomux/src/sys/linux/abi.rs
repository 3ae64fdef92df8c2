//! Kernel interface of io_uring: shared structures, constants and the three system calls.
#![allow(dead_code)]
use std::io;
use std::os::unix::io::RawFd;

pub(crate) const IORING_SETUP_SQPOLL: u32 = 1 << 1;
pub(crate) const IORING_SETUP_CQSIZE: u32 = 1 << 3;
pub(crate) const IORING_SETUP_ATTACH_WQ: u32 = 1 << 5;

pub(crate) const IORING_FEAT_SINGLE_MMAP: u32 = 1 << 0;
pub(crate) const IORING_FEAT_EXT_ARG: u32 = 1 << 8;
pub(crate) const IORING_FEAT_CQE_SKIP: u32 = 1 << 11;

pub(crate) const IORING_OFF_SQ_RING: i64 = 0;
pub(crate) const IORING_OFF_CQ_RING: i64 = 0x8000000;
pub(crate) const IORING_OFF_SQES: i64 = 0x10000000;

pub(crate) const IORING_ENTER_GETEVENTS: u32 = 1 << 0;
pub(crate) const IORING_ENTER_SQ_WAKEUP: u32 = 1 << 1;
pub(crate) const IORING_ENTER_EXT_ARG: u32 = 1 << 3;

pub(crate) const IORING_SQ_NEED_WAKEUP: u32 = 1 << 0;

pub(crate) const IOSQE_FIXED_FILE: u8 = 1 << 0;
pub(crate) const IOSQE_IO_LINK: u8 = 1 << 2;
pub(crate) const IOSQE_IO_HARDLINK: u8 = 1 << 3;
pub(crate) const IOSQE_CQE_SKIP_SUCCESS: u8 = 1 << 6;

pub(crate) const IORING_OP_NOP: u8 = 0;
pub(crate) const IORING_OP_POLL_ADD: u8 = 6;
pub(crate) const IORING_OP_ACCEPT: u8 = 13;
pub(crate) const IORING_OP_ASYNC_CANCEL: u8 = 14;
pub(crate) const IORING_OP_LINK_TIMEOUT: u8 = 15;
pub(crate) const IORING_OP_CONNECT: u8 = 16;
pub(crate) const IORING_OP_READ: u8 = 22;
pub(crate) const IORING_OP_WRITE: u8 = 23;

pub(crate) const IORING_UNREGISTER_BUFFERS: u32 = 1;
pub(crate) const IORING_REGISTER_FILES: u32 = 2;
pub(crate) const IORING_REGISTER_FILES_UPDATE: u32 = 6;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Params {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqRingOffsets,
    pub cq_off: CqRingOffsets,
}

/// A submission queue entry.
///
/// Unions of the kernel definition are flattened to the member this crate uses: `off` doubles
/// as `addr2`, `op_flags` as `poll32_events`, `timeout_flags` and `cancel_flags`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Sqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub op_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub splice_fd_in: i32,
    pub addr3: u64,
    pub pad: [u64; 1],
}

impl Sqe {
    /// A request that completes immediately with result 0.
    pub fn nop() -> Sqe {
        Sqe {
            opcode: IORING_OP_NOP,
            fd: -1,
            ..Sqe::default()
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KernelTimespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl From<std::time::Duration> for KernelTimespec {
    fn from(duration: std::time::Duration) -> Self {
        KernelTimespec {
            tv_sec: duration.as_secs() as i64,
            tv_nsec: duration.subsec_nanos() as i64,
        }
    }
}

#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct GeteventsArg {
    pub sigmask: u64,
    pub sigmask_sz: u32,
    pub pad: u32,
    pub ts: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct FilesUpdate {
    pub offset: u32,
    pub resv: u32,
    pub fds: u64,
}

const _: () = assert!(std::mem::size_of::<Params>() == 120);
const _: () = assert!(std::mem::size_of::<Sqe>() == 64);
const _: () = assert!(std::mem::size_of::<Cqe>() == 16);

fn check(ret: libc::c_long) -> io::Result<libc::c_long> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

pub(crate) fn io_uring_setup(entries: u32, params: &mut Params) -> io::Result<RawFd> {
    let ret = unsafe { libc::syscall(libc::SYS_io_uring_setup, entries, params as *mut Params) };
    check(ret).map(|fd| fd as RawFd)
}

/// # Safety
/// `arg` must be null or point to a structure of `arg_size` bytes matching `flags`.
pub(crate) unsafe fn io_uring_enter(
    fd: RawFd,
    to_submit: u32,
    min_complete: u32,
    flags: u32,
    arg: *const libc::c_void,
    arg_size: usize,
) -> io::Result<u32> {
    let ret = libc::syscall(
        libc::SYS_io_uring_enter,
        fd,
        to_submit,
        min_complete,
        flags,
        arg,
        arg_size,
    );
    check(ret).map(|n| n as u32)
}

/// # Safety
/// `arg` must point to `nr_args` entries of the structure `opcode` expects.
pub(crate) unsafe fn io_uring_register(
    fd: RawFd,
    opcode: u32,
    arg: *const libc::c_void,
    nr_args: u32,
) -> io::Result<()> {
    let ret = libc::syscall(libc::SYS_io_uring_register, fd, opcode, arg, nr_args);
    check(ret).map(drop)
}
