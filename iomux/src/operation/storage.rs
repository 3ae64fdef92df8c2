use std::mem;
use std::ptr::NonNull;

use smallvec::SmallVec;

use crate::{Error, Result};

/// Size and alignment of backend operation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageRequirements {
    pub size: usize,
    pub align: usize,
}

impl StorageRequirements {
    pub const fn of<T>() -> StorageRequirements {
        StorageRequirements {
            size: mem::size_of::<T>(),
            align: mem::align_of::<T>(),
        }
    }

    /// Requirements satisfying both `self` and `other`.
    pub fn union(self, other: StorageRequirements) -> StorageRequirements {
        StorageRequirements {
            size: std::cmp::max(self.size, other.size),
            align: std::cmp::max(self.align, other.align),
        }
    }
}

impl Default for StorageRequirements {
    fn default() -> Self {
        StorageRequirements { size: 0, align: 1 }
    }
}

/// Borrowed, uninitialized memory for one operation state.
#[derive(Debug, Clone, Copy)]
pub struct StoragePtr {
    ptr: NonNull<u8>,
    size: usize,
}

impl StoragePtr {
    /// # Safety
    /// `ptr` must be valid for writes of `size` bytes for as long as an operation lives in it.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, size: usize) -> StoragePtr {
        StoragePtr { ptr, size }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn fits(&self, requirements: StorageRequirements) -> bool {
        requirements.size <= self.size && (self.ptr.as_ptr() as usize) % requirements.align == 0
    }

    /// Move `value` into the storage.
    ///
    /// # Safety
    /// The storage must not hold a live value.
    pub(crate) unsafe fn write<T>(self, value: T) -> Result<NonNull<T>> {
        if !self.fits(StorageRequirements::of::<T>()) {
            return Err(Error::InvalidArgument);
        }
        let ptr = self.ptr.cast::<T>();
        ptr.as_ptr().write(value);
        Ok(ptr)
    }
}

#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct Chunk([u8; 16]);

const CHUNK_SIZE: usize = mem::size_of::<Chunk>();

/// Number of bytes of operation state held without allocating.
pub const INLINE_STORAGE_SIZE: usize = 384;

/// Caller side storage for operation state.
///
/// Small states live inline, larger ones spill to the heap. Operation state written into the
/// storage must not move, so the storage itself has to stay put (pinned) while an operation
/// is in flight.
pub struct OperationStorage {
    chunks: SmallVec<[Chunk; INLINE_STORAGE_SIZE / CHUNK_SIZE]>,
}

impl OperationStorage {
    pub fn new() -> OperationStorage {
        OperationStorage {
            chunks: SmallVec::new(),
        }
    }

    /// Make room for state with the given requirements, returning a pointer to the memory.
    pub fn reserve(&mut self, requirements: StorageRequirements) -> Result<StoragePtr> {
        if requirements.align > mem::align_of::<Chunk>() {
            return Err(Error::InvalidArgument);
        }
        let chunks = std::cmp::max(1, (requirements.size + CHUNK_SIZE - 1) / CHUNK_SIZE);
        if self.chunks.len() < chunks {
            self.chunks.resize(chunks, Chunk([0; CHUNK_SIZE]));
        }
        let ptr = NonNull::new(self.chunks.as_mut_ptr() as *mut u8).ok_or(Error::InvalidArgument)?;
        Ok(StoragePtr {
            ptr,
            size: self.chunks.len() * CHUNK_SIZE,
        })
    }

    pub fn is_inline(&self) -> bool {
        !self.chunks.spilled()
    }
}

impl Default for OperationStorage {
    fn default() -> Self {
        Self::new()
    }
}
