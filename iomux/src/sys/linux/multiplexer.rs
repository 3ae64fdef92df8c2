use std::any::Any;
use std::cell::{Cell, RefCell};
use std::cmp;
use std::fmt;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};

use lazy_static::lazy_static;
use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use rlimit::Resource;

use super::abi::{
    io_uring_enter, io_uring_register, io_uring_setup, Cqe, GeteventsArg, KernelTimespec, Params,
    Sqe, IORING_ENTER_EXT_ARG, IORING_ENTER_GETEVENTS, IORING_ENTER_SQ_WAKEUP,
    IORING_FEAT_CQE_SKIP, IORING_FEAT_EXT_ARG, IORING_FEAT_SINGLE_MMAP, IORING_OFF_CQ_RING,
    IORING_OFF_SQES, IORING_OFF_SQ_RING, IORING_OP_ASYNC_CANCEL, IORING_SETUP_ATTACH_WQ,
    IORING_SETUP_CQSIZE, IORING_SETUP_SQPOLL, IORING_UNREGISTER_BUFFERS, IOSQE_CQE_SKIP_SUCCESS,
};
use super::files::{Connector, FixedFiles};
use super::record::RecordContext;
use super::ring::{CompletionQueue, MappedRegion, SubmissionQueue};
use super::user_data::{dispatch, is_budgeted};
use crate::deadline::Deadline;
use crate::handle::{self, Handle, HandleType, NativeHandle};
use crate::multiplexer::{
    Connect, HandleRelation, Multiplexer, PostSynchronousCompletion, PumpMode, PumpStatistics,
};
use crate::operation::{self, DeferList, OperationCore};
use crate::{Error, Result};

const MIN_ENTRIES: u32 = 32;
const MIN_MEMLOCK_LIMIT: u64 = 512 * 1024;

lazy_static! {
    static ref IS_SUPPORTED: bool = probe();
}

fn probe() -> bool {
    // Any error other than ENOSYS means the system call exists.
    match unsafe { io_uring_register(-1, IORING_UNREGISTER_BUFFERS, ptr::null(), 0) } {
        Ok(()) => true,
        Err(err) => err.raw_os_error() != Some(libc::ENOSYS),
    }
}

/// Whether the running kernel implements io_uring. Probed once per process.
pub fn is_supported() -> bool {
    *IS_SUPPORTED
}

/// Creation options of an [`IoUringMultiplexer`].
#[derive(Debug, Clone)]
pub struct IoUringOptions {
    /// Minimum number of submission queue entries. Rounded up to a power of two, at least 32.
    pub submission_queue_size: u32,
    /// Minimum number of completion queue entries; 0 means twice the submission queue.
    pub completion_queue_size: u32,
    /// Let a kernel thread poll the submission queue.
    pub kernel_thread: bool,
    /// Milliseconds of inactivity after which the kernel thread goes to sleep.
    pub kernel_thread_idle: u32,
    /// Publish recorded requests as soon as they are committed instead of on the next pump.
    pub auto_submit: bool,
    /// Slots in the fixed file table. 0 disables the table.
    pub fixed_file_capacity: u32,
    /// Ring whose kernel thread polls this ring's submission queue too. Requires `kernel_thread`.
    pub shared_kernel_thread: Option<RawFd>,
}

impl Default for IoUringOptions {
    fn default() -> Self {
        IoUringOptions {
            submission_queue_size: 128,
            completion_queue_size: 0,
            kernel_thread: false,
            kernel_thread_idle: 1000,
            auto_submit: false,
            fixed_file_capacity: 0,
            shared_kernel_thread: None,
        }
    }
}

impl IoUringOptions {
    /// Poll the submission queue with the kernel thread of `other` instead of a new one.
    pub fn share_kernel_thread(mut self, other: &IoUringMultiplexer) -> Self {
        self.kernel_thread = true;
        self.shared_kernel_thread = Some(other.ring.0);
        self
    }
}

struct RingFd(RawFd);

impl Drop for RingFd {
    fn drop(&mut self) {
        if let Err(err) = nix::unistd::close(self.0) {
            warn!("Error: closing io_uring {}: {}", self.0, err);
        }
    }
}

/// io_uring backed multiplexer.
///
/// Requests are recorded into the submission ring by [`RecordContext`] transactions and handed to
/// the kernel by [`Multiplexer::pump`], or right away when `auto_submit` is enabled. Completions
/// are only reaped by `pump`.
pub struct IoUringMultiplexer {
    pub(crate) sq: SubmissionQueue,
    cq: CompletionQueue,
    pub(crate) cq_free: Cell<u32>,
    pub(crate) record_lock: Cell<bool>,
    /// `IOSQE_CQE_SKIP_SUCCESS` if the kernel supports it, 0 otherwise.
    pub(crate) cqe_skip_success: u8,
    pub(crate) auto_submit: bool,
    setup_flags: u32,
    features: u32,
    files: Option<RefCell<FixedFiles>>,
    deferred: RefCell<DeferList>,
    _sqes: MappedRegion,
    _cq_ring: Option<MappedRegion>,
    _sq_ring: MappedRegion,
    ring: RingFd,
}

impl IoUringMultiplexer {
    pub fn new(options: &IoUringOptions) -> Result<IoUringMultiplexer> {
        check_memlock();

        let sq_entries = cmp::max(MIN_ENTRIES, options.submission_queue_size)
            .checked_next_power_of_two()
            .ok_or(Error::InvalidArgument)?;
        let cq_entries = match options.completion_queue_size {
            0 => sq_entries.checked_mul(2),
            size => cmp::max(size, sq_entries).checked_next_power_of_two(),
        }
        .ok_or(Error::InvalidArgument)?;

        let mut params = Params {
            flags: IORING_SETUP_CQSIZE,
            cq_entries,
            ..Params::default()
        };
        if options.kernel_thread {
            params.flags |= IORING_SETUP_SQPOLL;
            params.sq_thread_idle = options.kernel_thread_idle;
        }
        if let Some(fd) = options.shared_kernel_thread {
            params.flags |= IORING_SETUP_ATTACH_WQ;
            params.wq_fd = fd as u32;
        }

        let ring = RingFd(io_uring_setup(sq_entries, &mut params)?);

        let mut sq_size = params.sq_off.array as usize + params.sq_entries as usize * mem::size_of::<u32>();
        let mut cq_size = params.cq_off.cqes as usize + params.cq_entries as usize * mem::size_of::<Cqe>();
        let single_mmap = params.features & IORING_FEAT_SINGLE_MMAP != 0;
        if single_mmap {
            sq_size = cmp::max(sq_size, cq_size);
            cq_size = sq_size;
        }

        let sq_ring = MappedRegion::map(ring.0, IORING_OFF_SQ_RING, sq_size)?;
        let cq_ring = if single_mmap {
            None
        } else {
            Some(MappedRegion::map(ring.0, IORING_OFF_CQ_RING, cq_size)?)
        };
        let sqes = MappedRegion::map(
            ring.0,
            IORING_OFF_SQES,
            params.sq_entries as usize * mem::size_of::<Sqe>(),
        )?;

        let (sq, cq) = unsafe {
            let sq = SubmissionQueue::new(&sq_ring, &params.sq_off, sqes.at(0));
            let cq = CompletionQueue::new(cq_ring.as_ref().unwrap_or(&sq_ring), &params.cq_off);
            (sq, cq)
        };

        let files = match options.fixed_file_capacity {
            0 => None,
            capacity => match FixedFiles::register(ring.0, capacity) {
                Ok(files) => Some(RefCell::new(files)),
                Err(err) => {
                    warn!("Error: registering the fixed file table. Skipping {}", err);
                    None
                }
            },
        };

        debug!(
            "created io_uring {} with {} submission and {} completion entries, features {:#x}",
            ring.0, params.sq_entries, params.cq_entries, params.features
        );

        Ok(IoUringMultiplexer {
            cq_free: Cell::new(cq.entries()),
            sq,
            cq,
            record_lock: Cell::new(false),
            cqe_skip_success: if params.features & IORING_FEAT_CQE_SKIP != 0 {
                IOSQE_CQE_SKIP_SUCCESS
            } else {
                0
            },
            auto_submit: options.auto_submit,
            setup_flags: params.flags,
            features: params.features,
            files,
            deferred: RefCell::new(DeferList::new()),
            _sqes: sqes,
            _cq_ring: cq_ring,
            _sq_ring: sq_ring,
            ring,
        })
    }

    pub fn ring_fd(&self) -> RawFd {
        self.ring.0
    }

    pub fn has_kernel_thread(&self) -> bool {
        self.setup_flags & IORING_SETUP_SQPOLL != 0
    }

    pub fn has_fixed_files(&self) -> bool {
        self.files.is_some()
    }

    /// Open a transaction recording submission queue entries.
    ///
    /// # Panics
    /// If another context of this multiplexer is still open.
    pub fn record(&self) -> RecordContext<'_> {
        RecordContext::new(self)
    }

    /// Publish committed entries and make the kernel consume them. Returns the number of
    /// entries handed over.
    pub(crate) fn submit(&self) -> Result<usize> {
        let published = self.sq.publish();
        if self.has_kernel_thread() {
            if published != 0 && self.sq.needs_wakeup() {
                self.enter(0, 0, IORING_ENTER_SQ_WAKEUP, None)?;
            }
            return Ok(published as usize);
        }
        let to_submit = self.sq.unconsumed();
        if to_submit == 0 {
            return Ok(0);
        }
        self.enter(to_submit, 0, 0, None)
    }

    /// Submission on commit. Failures leave the entries in the ring for the next pump.
    pub(crate) fn submit_released(&self) {
        if let Err(err) = self.submit() {
            warn!("Error: submitting on commit, deferring to the next pump: {}", err);
        }
    }

    /// Returns the number of entries the kernel consumed. Interrupted or busy calls are not
    /// errors; the caller retries on its next pump.
    fn enter(
        &self,
        to_submit: u32,
        min_complete: u32,
        flags: u32,
        timeout: Option<&KernelTimespec>,
    ) -> Result<usize> {
        trace!(
            "io_uring_enter to_submit={} min_complete={} flags={:#x} timeout={:?}",
            to_submit,
            min_complete,
            flags,
            timeout
        );
        let arg;
        let (flags, arg_ptr, arg_size) = match timeout {
            Some(timespec) => {
                arg = GeteventsArg {
                    sigmask: 0,
                    // _NSIG / 8, as liburing passes it.
                    sigmask_sz: 8,
                    pad: 0,
                    ts: timespec as *const KernelTimespec as u64,
                };
                (
                    flags | IORING_ENTER_EXT_ARG,
                    &arg as *const GeteventsArg as *const libc::c_void,
                    mem::size_of::<GeteventsArg>(),
                )
            }
            None => (flags, ptr::null(), 0),
        };
        match unsafe { io_uring_enter(self.ring.0, to_submit, min_complete, flags, arg_ptr, arg_size) } {
            Ok(consumed) => Ok(consumed as usize),
            Err(err) => match Errno::from_i32(err.raw_os_error().unwrap_or(0)) {
                Errno::EINTR | Errno::EAGAIN | Errno::EBUSY | Errno::ETIME => Ok(0),
                _ => Err(err.into()),
            },
        }
    }

    /// Block until at least one completion is available or the deadline expires.
    fn wait_for_completions(&self, deadline: Deadline) -> Result<()> {
        let remaining = match deadline.remaining() {
            None => {
                self.enter(0, 1, IORING_ENTER_GETEVENTS, None)?;
                return Ok(());
            }
            Some(remaining) => remaining,
        };
        if self.features & IORING_FEAT_EXT_ARG != 0 {
            let timespec = KernelTimespec::from(remaining);
            self.enter(0, 1, IORING_ENTER_GETEVENTS, Some(&timespec))?;
            return Ok(());
        }
        // The ring is readable while completions are pending.
        let mut fds = [PollFd::new(self.ring.0, PollFlags::POLLIN)];
        match poll(&mut fds, deadline.as_poll_timeout()) {
            Ok(_) | Err(Errno::EINTR) => Ok(()),
            Err(errno) => Err(errno.into()),
        }
    }

    /// Hand every available completion to `f` and return the budget of those that held one.
    pub(crate) fn reap_completion_queue_with<F>(&self, mut f: F) -> usize
    where
        F: FnMut(Cqe),
    {
        let mut budgeted = 0u32;
        let reaped = self.cq.reap(|cqe| {
            if is_budgeted(cqe.user_data) {
                budgeted += 1;
            }
            f(cqe)
        });
        let free = self.cq_free.get().saturating_add(budgeted);
        self.cq_free.set(cmp::min(free, self.cq.entries()));
        reaped as usize
    }

    fn reap_completion_queue(&self) -> usize {
        self.reap_completion_queue_with(|cqe| unsafe {
            dispatch(self, cqe.user_data, cqe.res);
        })
    }

    /// Nothing was submitted that still owes a completion.
    pub(crate) fn is_idle(&self) -> bool {
        self.cq_free.get() == self.cq.entries() && !self.cq.has_completions()
    }

    /// Record a completion. The operation concludes now if it has no listener, otherwise on the
    /// next flush.
    ///
    /// # Safety
    /// `operation` must be live and submitted.
    pub(crate) unsafe fn complete(&self, operation: NonNull<OperationCore>, result: Result<()>) {
        operation::complete(operation, result, &self.deferred);
    }

    /// Ask the kernel to cancel the requests identified by `targets`.
    pub(crate) fn cancel_user_data<I>(&self, targets: I) -> Result<()>
    where
        I: IntoIterator<Item = u64>,
    {
        let mut context = self.record();
        for target in targets {
            context.push(Sqe {
                opcode: IORING_OP_ASYNC_CANCEL,
                fd: -1,
                addr: target,
                ..Sqe::default()
            })?;
            // The outcome shows on the target.
            context.set_cqe_skip_success();
        }
        context.commit();
        Ok(())
    }
}

fn check_memlock() {
    match Resource::MEMLOCK.get() {
        Ok((limit, _)) if limit < MIN_MEMLOCK_LIMIT => warn!(
            "The memlock resource limit is low: {} (recommended {})",
            limit, MIN_MEMLOCK_LIMIT
        ),
        Ok(_) => {}
        Err(err) => warn!("Error: reading the memlock resource limit: {}", err),
    }
}

impl Multiplexer for IoUringMultiplexer {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn find_handle_relation(&self, handle: HandleType) -> Result<&'static HandleRelation> {
        super::operations::RELATIONS.find(handle)
    }

    fn pump(&self, mode: PumpMode, deadline: Deadline) -> Result<PumpStatistics> {
        let mut stats = PumpStatistics::default();
        // Synchronous completions first.
        if mode.contains(PumpMode::FLUSH) {
            stats.concluded += unsafe { operation::flush(&self.deferred) };
        }
        if mode.contains(PumpMode::SUBMIT) {
            stats.submitted += self.submit()?;
        }
        if mode.contains(PumpMode::COMPLETE) {
            let mut completed = self.reap_completion_queue();
            let wait = completed == 0
                && stats.concluded == 0
                && !deadline.is_instant()
                && !self.is_idle();
            if wait {
                self.wait_for_completions(deadline)?;
                completed = self.reap_completion_queue();
            }
            stats.completed += completed;
        }
        if mode.contains(PumpMode::FLUSH) {
            stats.concluded += unsafe { operation::flush(&self.deferred) };
        }
        Ok(stats)
    }
}

impl PostSynchronousCompletion for IoUringMultiplexer {
    unsafe fn post_synchronous_completion(&self, operation: NonNull<OperationCore>, result: Result<()>) {
        self.complete(operation, result);
    }
}

impl<H: Handle> Connect<H> for IoUringMultiplexer {
    fn attach(&self, native: &NativeHandle) -> Result<handle::Connector> {
        let file_index = match self.files.as_ref() {
            Some(files) => files.borrow_mut().install(self.ring.0, native.raw()),
            None => None,
        };
        Ok(handle::Connector::IoUring(Connector { file_index }))
    }

    fn detach(&self, _native: &NativeHandle, connector: &handle::Connector) -> Result<()> {
        if let handle::Connector::IoUring(Connector {
            file_index: Some(idx),
        }) = *connector
        {
            if let Some(files) = self.files.as_ref() {
                files.borrow_mut().remove(self.ring.0, idx)?;
            }
        }
        Ok(())
    }
}

impl Drop for IoUringMultiplexer {
    fn drop(&mut self) {
        let outstanding = self.cq.entries() - self.cq_free.get();
        if outstanding != 0 {
            warn!(
                "io_uring {} dropped with {} completions outstanding",
                self.ring.0, outstanding
            );
        }
        debug!("destroying io_uring {}", self.ring.0);
    }
}

impl fmt::Debug for IoUringMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoUringMultiplexer")
            .field("ring", &self.ring.0)
            .field("sq_entries", &self.sq.entries())
            .field("cq_entries", &self.cq.entries())
            .field("features", &format_args!("{:#x}", self.features))
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sys::linux::abi::{
        IORING_OP_LINK_TIMEOUT, IORING_OP_POLL_ADD, IORING_OP_READ, IOSQE_IO_LINK,
    };
    use crate::sys::linux::user_data::{IoHandler, TAG_UNBUDGETED};
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    /// A multiplexer, or `None` where the sandbox does not allow io_uring.
    pub(crate) fn test_multiplexer(options: &IoUringOptions) -> Option<IoUringMultiplexer> {
        if !is_supported() {
            return None;
        }
        match IoUringMultiplexer::new(options) {
            Ok(multiplexer) => Some(multiplexer),
            Err(err) => match err.raw_os_error() {
                Some(libc::EPERM) | Some(libc::ENOSYS) | Some(libc::ENOMEM) => None,
                _ => panic!("failed to create io_uring: {}", err),
            },
        }
    }

    fn collect(multiplexer: &IoUringMultiplexer, count: usize) -> Vec<(u64, i32)> {
        let mut completions = Vec::new();
        multiplexer.submit().unwrap();
        while completions.len() < count {
            multiplexer.reap_completion_queue_with(|cqe| completions.push((cqe.user_data, cqe.res)));
            if completions.len() < count {
                multiplexer.wait_for_completions(Deadline::Never).unwrap();
            }
        }
        completions.sort();
        completions
    }

    #[test]
    fn test_linked_timeout_cancelled_by_completion() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => multiplexer,
            None => return,
        };
        let timespec = KernelTimespec::from(Duration::from_secs(1));
        let mut context = multiplexer.record();
        context
            .push(Sqe {
                user_data: 1,
                ..Sqe::nop()
            })
            .unwrap();
        context.link_last(IOSQE_IO_LINK);
        context
            .push(Sqe {
                opcode: IORING_OP_LINK_TIMEOUT,
                fd: -1,
                addr: &timespec as *const KernelTimespec as u64,
                len: 1,
                user_data: 2,
                ..Sqe::default()
            })
            .unwrap();
        context.commit();

        assert_eq!(
            vec![(1, 0), (2, -libc::ECANCELED)],
            collect(&multiplexer, 2)
        );
        assert!(multiplexer.is_idle());
    }

    #[test]
    fn test_zero_linked_timeout_loses_to_inline_completion() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => multiplexer,
            None => return,
        };
        let timespec = KernelTimespec::default();
        let mut context = multiplexer.record();
        context
            .push(Sqe {
                user_data: 1,
                ..Sqe::nop()
            })
            .unwrap();
        context.link_last(IOSQE_IO_LINK);
        context
            .push(Sqe {
                opcode: IORING_OP_LINK_TIMEOUT,
                fd: -1,
                addr: &timespec as *const KernelTimespec as u64,
                len: 1,
                user_data: 2,
                ..Sqe::default()
            })
            .unwrap();
        context.commit();

        assert_eq!(
            vec![(1, 0), (2, -libc::ECANCELED)],
            collect(&multiplexer, 2)
        );
        assert!(multiplexer.is_idle());
    }

    #[test]
    fn test_linked_timeout_expires() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => multiplexer,
            None => return,
        };
        let (reader, writer) = nix::unistd::pipe().unwrap();
        let timespec = KernelTimespec::from(Duration::from_millis(10));
        let mut context = multiplexer.record();
        context
            .push(Sqe {
                opcode: IORING_OP_POLL_ADD,
                fd: reader,
                op_flags: libc::POLLIN as u32,
                user_data: 1,
                ..Sqe::default()
            })
            .unwrap();
        context.link_last(IOSQE_IO_LINK);
        context
            .push(Sqe {
                opcode: IORING_OP_LINK_TIMEOUT,
                fd: -1,
                addr: &timespec as *const KernelTimespec as u64,
                len: 1,
                user_data: 2,
                ..Sqe::default()
            })
            .unwrap();
        context.commit();

        assert_eq!(
            vec![(1, -libc::ECANCELED), (2, -libc::ETIME)],
            collect(&multiplexer, 2)
        );
        nix::unistd::close(reader).unwrap();
        nix::unistd::close(writer).unwrap();
    }

    #[test]
    fn test_async_cancel() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => multiplexer,
            None => return,
        };
        let (reader, writer) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut context = multiplexer.record();
        context
            .push(Sqe {
                opcode: IORING_OP_POLL_ADD,
                fd: reader.as_raw_fd(),
                op_flags: libc::POLLIN as u32,
                user_data: 1,
                ..Sqe::default()
            })
            .unwrap();
        context.commit();
        multiplexer.submit().unwrap();

        let mut context = multiplexer.record();
        context
            .push(Sqe {
                opcode: IORING_OP_ASYNC_CANCEL,
                fd: -1,
                addr: 1,
                user_data: 2,
                ..Sqe::default()
            })
            .unwrap();
        context.commit();

        assert_eq!(
            vec![(1, -libc::ECANCELED), (2, 0)],
            collect(&multiplexer, 2)
        );
        drop(writer);
    }

    #[test]
    fn test_uncommitted_entries_are_discarded() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => multiplexer,
            None => return,
        };
        {
            let mut context = multiplexer.record();
            context.push(Sqe::nop()).unwrap();
            context.push(Sqe::nop()).unwrap();
            assert_eq!(2, context.len());
        }
        assert!(multiplexer.record().is_empty());
        assert_eq!(0, multiplexer.submit().unwrap());
        assert!(multiplexer.is_idle());
    }

    #[test]
    #[should_panic]
    fn test_record_is_not_reentrant() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => multiplexer,
            None => panic!("io_uring unavailable"),
        };
        let _first = multiplexer.record();
        let _second = multiplexer.record();
    }

    #[test]
    fn test_full_submission_queue() {
        let options = IoUringOptions {
            submission_queue_size: 1,
            ..IoUringOptions::default()
        };
        let multiplexer = match test_multiplexer(&options) {
            Some(multiplexer) => multiplexer,
            None => return,
        };
        assert_eq!(MIN_ENTRIES, multiplexer.sq.entries());

        let mut context = multiplexer.record();
        for _ in 0..MIN_ENTRIES {
            context.push(Sqe::nop()).unwrap();
        }
        assert_eq!(
            Err(Error::TooManyConcurrentAsyncOperations),
            context.push(Sqe::nop()).map(|_| ())
        );
        context.commit();

        let stats = multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
        assert_eq!(MIN_ENTRIES as usize, stats.submitted);
        while !multiplexer.is_idle() {
            multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
        }
    }

    #[test]
    fn test_skipped_completions_return_budget() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => multiplexer,
            None => return,
        };
        let entries = multiplexer.cq.entries();
        for _ in 0..2 * entries {
            let mut context = multiplexer.record();
            context.push(Sqe::nop()).unwrap();
            context.set_cqe_skip_success();
            context.push(Sqe::nop()).unwrap();
            context.commit();
            while !multiplexer.is_idle() {
                multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
            }
        }
        assert_eq!(entries, multiplexer.cq_free.get());

        // A failing skipped entry still completes, without budget.
        let mut context = multiplexer.record();
        context
            .push(Sqe {
                opcode: IORING_OP_READ,
                fd: -1,
                ..Sqe::default()
            })
            .unwrap();
        context.set_cqe_skip_success();
        context.push(Sqe::nop()).unwrap();
        context.commit();
        let mut stats = PumpStatistics::default();
        while !multiplexer.is_idle() {
            stats += multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
        }
        assert_eq!(2, stats.completed);
        assert_eq!(entries, multiplexer.cq_free.get());
    }

    #[test]
    fn test_shared_kernel_thread() {
        let options = IoUringOptions {
            kernel_thread: true,
            ..IoUringOptions::default()
        };
        let first = match test_multiplexer(&options) {
            Some(multiplexer) => multiplexer,
            None => return,
        };
        let options = IoUringOptions {
            submission_queue_size: 64,
            ..IoUringOptions::default()
        }
        .share_kernel_thread(&first);
        assert!(options.kernel_thread);
        assert_eq!(Some(first.ring_fd()), options.shared_kernel_thread);
        let second = match test_multiplexer(&options) {
            Some(multiplexer) => multiplexer,
            None => return,
        };
        assert!(second.has_kernel_thread());

        let mut context = second.record();
        context.push(Sqe::nop()).unwrap();
        context.commit();
        let mut stats = PumpStatistics::default();
        while stats.completed == 0 {
            stats += second.pump(PumpMode::ALL, Deadline::Never).unwrap();
        }
        assert!(second.is_idle());
    }

    thread_local! {
        static DISPATCHED: Cell<usize> = Cell::new(0);
    }

    unsafe fn count(_: &IoUringMultiplexer, _: NonNull<OperationCore>, index: usize, res: i32) {
        assert_eq!((0, 0), (index, res));
        DISPATCHED.with(|dispatched| dispatched.set(dispatched.get() + 1));
    }

    #[test]
    fn test_dispatch_tags() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => multiplexer,
            None => return,
        };
        let core = Box::new(OperationCore::new(None));
        let handler = IoHandler::new(count);
        unsafe {
            assert!(!dispatch(&multiplexer, 0, 0));
            // Not bound yet.
            assert!(!dispatch(&multiplexer, handler.user_data(), 0));
            handler.bind(NonNull::from(&*core));
            assert!(!dispatch(&multiplexer, TAG_UNBUDGETED, -libc::ENOENT));
            assert!(dispatch(&multiplexer, handler.user_data() | TAG_UNBUDGETED, 0));
        }
        assert_eq!(1, DISPATCHED.with(Cell::get));
    }

    #[test]
    fn test_pump_does_not_wait_when_idle() {
        let multiplexer = match test_multiplexer(&IoUringOptions::default()) {
            Some(multiplexer) => multiplexer,
            None => return,
        };
        let stats = multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
        assert!(!stats.made_progress());
    }

    #[test]
    fn test_auto_submit() {
        let options = IoUringOptions {
            auto_submit: true,
            ..IoUringOptions::default()
        };
        let multiplexer = match test_multiplexer(&options) {
            Some(multiplexer) => multiplexer,
            None => return,
        };
        let mut context = multiplexer.record();
        context.push(Sqe::nop()).unwrap();
        context.commit();
        assert_eq!(0, multiplexer.sq.unconsumed());

        let stats = multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
        assert_eq!(0, stats.submitted);
        assert_eq!(1, stats.completed);
    }
}
