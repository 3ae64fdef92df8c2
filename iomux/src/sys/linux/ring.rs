//! The memory shared with the kernel: ring mappings and cursors.
//!
//! Submission queue cursors, all free running `u32` counters compared with wrapping arithmetic:
//!
//! ```text
//! k_consume <= produce <= release <= acquire <= k_consume + entries
//! ```
//!
//! `k_consume` is the kernel's head, `produce` the tail last published to the kernel, `release`
//! the end of committed entries and `acquire` the end of entries reserved by a record context.
//! Slots in `[release, acquire)` are private to the context recording them.
use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicU32, Ordering};

use super::abi::{Cqe, CqRingOffsets, Sqe, SqRingOffsets, IORING_SQ_NEED_WAKEUP};

/// `a <= b` for free running cursors.
#[inline]
pub(crate) fn wrap_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) < 1 << 31
}

/// A shared mapping of ring memory, unmapped on drop.
#[derive(Debug)]
pub(crate) struct MappedRegion {
    addr: NonNull<u8>,
    len: usize,
}

impl MappedRegion {
    pub(crate) fn map(fd: RawFd, offset: i64, len: usize) -> io::Result<MappedRegion> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let addr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        Ok(MappedRegion { addr, len })
    }

    #[inline]
    pub(crate) fn at<T>(&self, offset: u32) -> *mut T {
        debug_assert!((offset as usize) < self.len);
        unsafe { self.addr.as_ptr().add(offset as usize) as *mut T }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

pub(crate) struct SubmissionQueue {
    k_head: *const AtomicU32,
    k_tail: *const AtomicU32,
    k_flags: *const AtomicU32,
    sqes: *mut Sqe,
    mask: u32,
    entries: u32,
    consume: Cell<u32>,
    produce: Cell<u32>,
    release: Cell<u32>,
}

impl SubmissionQueue {
    /// # Safety
    /// `ring` must be the submission ring mapping described by `offsets` and `sqes` the entry
    /// array mapping. Both must outlive the queue.
    pub(crate) unsafe fn new(ring: &MappedRegion, offsets: &SqRingOffsets, sqes: *mut Sqe) -> Self {
        Self::from_raw_parts(
            ring.at(offsets.head),
            ring.at(offsets.tail),
            ring.at(offsets.flags),
            ring.at(offsets.array),
            sqes,
            *ring.at::<u32>(offsets.ring_entries),
        )
    }

    /// # Safety
    /// Every pointer must stay valid for the lifetime of the queue. `array` and `sqes` must hold
    /// `entries` elements, a power of two.
    pub(crate) unsafe fn from_raw_parts(
        k_head: *const AtomicU32,
        k_tail: *const AtomicU32,
        k_flags: *const AtomicU32,
        array: *mut u32,
        sqes: *mut Sqe,
        entries: u32,
    ) -> Self {
        debug_assert!(entries.is_power_of_two());
        // Logical slot i always uses physical entry i.
        for index in 0..entries {
            array.add(index as usize).write(index);
        }
        let tail = (*k_tail).load(Ordering::Relaxed);
        SubmissionQueue {
            k_head,
            k_tail,
            k_flags,
            sqes,
            mask: entries - 1,
            entries,
            consume: Cell::new((*k_head).load(Ordering::Acquire)),
            produce: Cell::new(tail),
            release: Cell::new(tail),
        }
    }

    pub(crate) fn entries(&self) -> u32 {
        self.entries
    }

    pub(crate) fn release_cursor(&self) -> u32 {
        self.release.get()
    }

    /// True if no slot is free for `acquire`. Refreshes the kernel head before giving up.
    pub(crate) fn is_full(&self, acquire: u32) -> bool {
        if acquire.wrapping_sub(self.consume.get()) < self.entries {
            return false;
        }
        let head = unsafe { (*self.k_head).load(Ordering::Acquire) };
        self.consume.set(head);
        acquire.wrapping_sub(head) >= self.entries
    }

    /// # Safety
    /// The slot must have been reserved by the caller and not yet released.
    #[inline]
    pub(crate) unsafe fn slot(&self, cursor: u32) -> *mut Sqe {
        self.sqes.add((cursor & self.mask) as usize)
    }

    /// Make entries up to `acquire` eligible for publication.
    pub(crate) fn release(&self, acquire: u32) {
        debug_assert!(wrap_le(self.release.get(), acquire));
        debug_assert!(wrap_le(acquire, self.consume.get().wrapping_add(self.entries)));
        self.release.set(acquire);
    }

    /// Store the release cursor as the kernel's tail. Returns the number of entries published.
    pub(crate) fn publish(&self) -> u32 {
        let release = self.release.get();
        let published = release.wrapping_sub(self.produce.get());
        if published != 0 {
            unsafe { (*self.k_tail).store(release, Ordering::Release) };
            self.produce.set(release);
        }
        published
    }

    /// Entries published but not yet consumed by the kernel.
    pub(crate) fn unconsumed(&self) -> u32 {
        let head = unsafe { (*self.k_head).load(Ordering::Acquire) };
        self.consume.set(head);
        debug_assert!(wrap_le(head, self.produce.get()));
        self.produce.get().wrapping_sub(head)
    }

    /// The kernel polling thread went to sleep and must be woken to see new entries.
    pub(crate) fn needs_wakeup(&self) -> bool {
        // Order the tail store before the flags load.
        fence(Ordering::SeqCst);
        unsafe { (*self.k_flags).load(Ordering::Relaxed) & IORING_SQ_NEED_WAKEUP != 0 }
    }
}

pub(crate) struct CompletionQueue {
    k_head: *const AtomicU32,
    k_tail: *const AtomicU32,
    cqes: *const Cqe,
    mask: u32,
    entries: u32,
}

impl CompletionQueue {
    /// # Safety
    /// `ring` must be the completion ring mapping described by `offsets` and outlive the queue.
    pub(crate) unsafe fn new(ring: &MappedRegion, offsets: &CqRingOffsets) -> Self {
        Self::from_raw_parts(
            ring.at(offsets.head),
            ring.at(offsets.tail),
            ring.at(offsets.cqes),
            *ring.at::<u32>(offsets.ring_entries),
        )
    }

    /// # Safety
    /// Every pointer must stay valid for the lifetime of the queue and `cqes` must hold
    /// `entries` elements, a power of two.
    pub(crate) unsafe fn from_raw_parts(
        k_head: *const AtomicU32,
        k_tail: *const AtomicU32,
        cqes: *const Cqe,
        entries: u32,
    ) -> Self {
        debug_assert!(entries.is_power_of_two());
        CompletionQueue {
            k_head,
            k_tail,
            cqes,
            mask: entries - 1,
            entries,
        }
    }

    pub(crate) fn entries(&self) -> u32 {
        self.entries
    }

    pub(crate) fn has_completions(&self) -> bool {
        unsafe {
            (*self.k_head).load(Ordering::Relaxed) != (*self.k_tail).load(Ordering::Acquire)
        }
    }

    /// Hand every available completion to `dispatch`, then return the slots to the kernel.
    pub(crate) fn reap<F>(&self, mut dispatch: F) -> u32
    where
        F: FnMut(Cqe),
    {
        let (head, tail) = unsafe {
            (
                (*self.k_head).load(Ordering::Relaxed),
                (*self.k_tail).load(Ordering::Acquire),
            )
        };
        let mut cursor = head;
        while cursor != tail {
            let cqe = unsafe { self.cqes.add((cursor & self.mask) as usize).read() };
            cursor = cursor.wrapping_add(1);
            dispatch(cqe);
        }
        if cursor != head {
            unsafe { (*self.k_head).store(cursor, Ordering::Release) };
        }
        cursor.wrapping_sub(head)
    }
}
