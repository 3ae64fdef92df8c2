//! The fixed file table.
//!
//! Attached handles may be installed into the ring's registered file table so that requests
//! refer to them by index and skip the per-request file lookup. Registration is optional: when
//! the table is full or the kernel refuses, the handle is used through its plain descriptor.
use std::os::unix::io::RawFd;

use log::warn;

use super::abi::{io_uring_register, FilesUpdate, IORING_REGISTER_FILES, IORING_REGISTER_FILES_UPDATE, IOSQE_FIXED_FILE};
use crate::handle::{self, HandleView};
use crate::Result;

/// io_uring specific state of an attached handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Connector {
    pub(crate) file_index: Option<u32>,
}

impl Connector {
    /// Index of the handle in the fixed file table, if it was installed there.
    pub fn file_index(&self) -> Option<u32> {
        self.file_index
    }
}

/// How a request names its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileDescriptor {
    Owned(RawFd),
    Registered(u32),
}

impl FileDescriptor {
    pub(crate) fn of(view: &HandleView) -> FileDescriptor {
        match view.connector {
            handle::Connector::IoUring(Connector {
                file_index: Some(idx),
            }) => FileDescriptor::Registered(idx),
            _ => FileDescriptor::Owned(view.native.raw()),
        }
    }

    /// The `fd` field and flags of a request on this file.
    pub(crate) fn target(&self) -> (i32, u8) {
        match *self {
            FileDescriptor::Owned(fd) => (fd, 0),
            FileDescriptor::Registered(idx) => (idx as i32, IOSQE_FIXED_FILE),
        }
    }
}

/// Allocation of fixed file table slots.
#[derive(Debug)]
pub(crate) struct FixedFiles {
    free: Vec<u32>,
    capacity: u32,
}

impl FixedFiles {
    /// Register a sparse table of `capacity` empty slots with the ring.
    pub(crate) fn register(ring: RawFd, capacity: u32) -> Result<FixedFiles> {
        let empty: Vec<i32> = vec![-1; capacity as usize];
        unsafe {
            io_uring_register(
                ring,
                IORING_REGISTER_FILES,
                empty.as_ptr() as *const libc::c_void,
                capacity,
            )?;
        }
        Ok(FixedFiles::new(capacity))
    }

    fn new(capacity: u32) -> FixedFiles {
        FixedFiles {
            // Hand out low indices first.
            free: (0..capacity).rev().collect(),
            capacity,
        }
    }

    /// Install `fd` into a free slot. `None` if the table is full or the update failed.
    pub(crate) fn install(&mut self, ring: RawFd, fd: RawFd) -> Option<u32> {
        let idx = self.free.pop()?;
        match update(ring, idx, fd) {
            Ok(()) => Some(idx),
            Err(err) => {
                warn!("Error: installing fd {} in the fixed file table. Skipping {}", fd, err);
                self.free.push(idx);
                None
            }
        }
    }

    pub(crate) fn remove(&mut self, ring: RawFd, idx: u32) -> Result<()> {
        debug_assert!(idx < self.capacity && !self.free.contains(&idx));
        update(ring, idx, -1)?;
        self.free.push(idx);
        Ok(())
    }
}

fn update(ring: RawFd, idx: u32, fd: RawFd) -> Result<()> {
    let fds = [fd];
    let update = FilesUpdate {
        offset: idx,
        resv: 0,
        fds: fds.as_ptr() as u64,
    };
    unsafe {
        io_uring_register(
            ring,
            IORING_REGISTER_FILES_UPDATE,
            &update as *const FilesUpdate as *const libc::c_void,
            1,
        )?;
    }
    Ok(())
}
