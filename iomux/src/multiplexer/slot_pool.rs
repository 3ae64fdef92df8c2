//! Bounded pool of completion slot indices.
//!
//! Free indices are kept in a ring: `head` is the next index handed out, `tail` the position
//! the next released index is stored at. Both cursors only grow and wrap at 2^32; the ring
//! capacity is a power of two so that wrapping keeps them congruent.
#![cfg_attr(not(windows), allow(dead_code))]

use smallvec::SmallVec;

use crate::{Error, Result};

pub(crate) type SlotIndices = SmallVec<[u32; 4]>;

#[derive(Debug)]
pub(crate) struct SlotPool {
    free: Box<[u32]>,
    head: u32,
    tail: u32,
}

impl SlotPool {
    pub(crate) fn new(capacity: usize) -> Result<SlotPool> {
        if capacity == 0 || capacity > u16::MAX as usize + 1 {
            return Err(Error::InvalidArgument);
        }
        let capacity = capacity.next_power_of_two();
        let free = (0..capacity as u32).collect::<Vec<_>>().into_boxed_slice();
        Ok(SlotPool {
            free,
            head: 0,
            tail: capacity as u32,
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.free.len()
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.free.len() as u32 - 1
    }

    pub(crate) fn available(&self) -> usize {
        self.tail.wrapping_sub(self.head) as usize
    }

    /// Take `count` slots, all or nothing.
    pub(crate) fn acquire(&mut self, count: usize) -> Result<SlotIndices> {
        if self.available() < count {
            return Err(Error::TooManyConcurrentAsyncOperations);
        }
        let mask = self.mask();
        let mut indices = SlotIndices::with_capacity(count);
        for _ in 0..count {
            indices.push(self.free[(self.head & mask) as usize]);
            self.head = self.head.wrapping_add(1);
        }
        Ok(indices)
    }

    pub(crate) fn release(&mut self, index: u32) {
        debug_assert!((index as usize) < self.capacity());
        debug_assert!(self.available() < self.capacity(), "slot {} released twice", index);
        let mask = self.mask();
        self.free[(self.tail & mask) as usize] = index;
        self.tail = self.tail.wrapping_add(1);
    }
}
