use std::ptr;

use super::abi::{KernelTimespec, Sqe, IORING_OP_LINK_TIMEOUT, IOSQE_IO_HARDLINK, IOSQE_IO_LINK};
use super::multiplexer::IoUringMultiplexer;
use super::user_data::TAG_UNBUDGETED;
use crate::{Error, Result};

const LINK_FLAGS: u8 = IOSQE_IO_LINK | IOSQE_IO_HARDLINK;

/// A transaction recording submission queue entries.
///
/// Entries pushed into a context become visible to the kernel together, in push order, when the
/// context is committed. Dropping a context without committing discards everything it recorded.
/// Only one context may exist per multiplexer at a time.
pub struct RecordContext<'a> {
    multiplexer: &'a IoUringMultiplexer,
    sq_acquire: u32,
    cq_free: u32,
    last: *mut Sqe,
}

impl<'a> RecordContext<'a> {
    pub(crate) fn new(multiplexer: &'a IoUringMultiplexer) -> RecordContext<'a> {
        let locked = multiplexer.record_lock.replace(true);
        assert!(!locked, "The I/O recording context may not be re-entered.");
        RecordContext {
            multiplexer,
            sq_acquire: multiplexer.sq.release_cursor(),
            cq_free: multiplexer.cq_free.get(),
            last: ptr::null_mut(),
        }
    }

    /// Number of entries recorded so far.
    pub fn len(&self) -> u32 {
        self.sq_acquire.wrapping_sub(self.multiplexer.sq.release_cursor())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn acquire(&mut self, acquire_cqe: bool) -> Result<&mut Sqe> {
        if self.multiplexer.sq.is_full(self.sq_acquire) {
            return Err(Error::TooManyConcurrentAsyncOperations);
        }
        if acquire_cqe {
            if self.cq_free == 0 {
                return Err(Error::TooManyConcurrentAsyncOperations);
            }
            self.cq_free -= 1;
        }
        let slot = unsafe { self.multiplexer.sq.slot(self.sq_acquire) };
        self.sq_acquire = self.sq_acquire.wrapping_add(1);
        self.last = slot;
        unsafe {
            slot.write(Sqe::default());
            Ok(&mut *slot)
        }
    }

    /// Record `sqe`. Fails with [`Error::TooManyConcurrentAsyncOperations`] when either the
    /// submission ring or the completion budget is exhausted.
    pub fn push(&mut self, sqe: Sqe) -> Result<&mut Sqe> {
        let slot = self.acquire(true)?;
        *slot = sqe;
        Ok(slot)
    }

    /// Link the last recorded entry to the next one.
    pub fn link_last(&mut self, flags: u8) {
        debug_assert!(!self.last.is_null());
        debug_assert!(flags & LINK_FLAGS != 0 && flags & !LINK_FLAGS == 0);
        unsafe { (*self.last).flags |= flags };
    }

    /// Cancel the last recorded entry if it has not completed within `timespec`.
    ///
    /// The timeout itself never reports a completion to an operation: it carries ignored user
    /// data and, where the kernel supports it, `IOSQE_CQE_SKIP_SUCCESS`.
    pub(crate) fn link_timeout(&mut self, timespec: &KernelTimespec) -> Result<()> {
        debug_assert!(!self.last.is_null());
        let previous = self.last;
        debug_assert!(unsafe { (*previous).opcode } != IORING_OP_LINK_TIMEOUT);

        self.push(Sqe {
            opcode: IORING_OP_LINK_TIMEOUT,
            fd: -1,
            addr: timespec as *const KernelTimespec as u64,
            len: 1,
            ..Sqe::default()
        })?;
        self.set_cqe_skip_success();
        unsafe { (*previous).flags |= IOSQE_IO_LINK };
        Ok(())
    }

    /// Set `IOSQE_CQE_SKIP_SUCCESS` on the last entry if the kernel supports it.
    ///
    /// A skipped entry only completes if it fails, so it gives back the completion budget taken
    /// by [`push`](RecordContext::push). Its user data is tagged so that a failure completion is
    /// not counted as budget when it is reaped. User data passed to `push` must leave the top
    /// bit clear.
    pub fn set_cqe_skip_success(&mut self) {
        debug_assert!(!self.last.is_null());
        let skip = self.multiplexer.cqe_skip_success;
        unsafe {
            if skip == 0 || (*self.last).user_data & TAG_UNBUDGETED != 0 {
                return;
            }
            (*self.last).flags |= skip;
            (*self.last).user_data |= TAG_UNBUDGETED;
        }
        self.cq_free += 1;
    }

    /// Make the recorded entries visible to the kernel.
    pub fn commit(mut self) {
        if self.last.is_null() {
            return;
        }
        unsafe {
            debug_assert!(
                (*self.last).flags & LINK_FLAGS == 0,
                "The final SQE in a series may not be linked."
            );
        }
        self.multiplexer.sq.release(self.sq_acquire);
        self.multiplexer.cq_free.set(self.cq_free);
        self.last = ptr::null_mut();
        if self.multiplexer.auto_submit {
            self.multiplexer.submit_released();
        }
    }
}

impl Drop for RecordContext<'_> {
    fn drop(&mut self) {
        self.multiplexer.record_lock.set(false);
    }
}
