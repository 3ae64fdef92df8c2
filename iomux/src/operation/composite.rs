//! Bookkeeping for scatter/gather transfers issued as one sub-operation per buffer.
//!
//! Both backends present N raw completions as a single logical completion. Sub-operations are
//! tracked in a bitmask of in-flight slots. The first sub-operation that fails or transfers less
//! than its buffer length ends the transfer: every sub-operation on a later buffer is cancelled
//! (or never issued), earlier ones are left alone since their data is already valid. The
//! reported byte count is the sum of the fully transferred buffers plus the partial count of
//! the first short one.
use bitmaps::Bitmap;
use smallvec::SmallVec;
use typenum::U64;

use crate::{Error, Result};

/// Maximum number of buffers in one scatter/gather transfer.
pub const MAX_BUFFERS: usize = 64;

/// Outcome of issuing one sub-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issue {
    /// The kernel accepted the request; a completion will follow.
    Pending,
    /// The request finished while being issued.
    Completed(Result<usize>),
}

#[derive(Debug)]
pub struct ScatterGather {
    lengths: SmallVec<[usize; 4]>,
    results: SmallVec<[Option<Result<usize>>; 4]>,
    in_flight: Bitmap<U64>,
    cancel_requested: Bitmap<U64>,
    issuing: bool,
}

impl ScatterGather {
    pub fn new<I>(lengths: I) -> Result<ScatterGather>
    where
        I: IntoIterator<Item = usize>,
    {
        let lengths: SmallVec<[usize; 4]> = lengths.into_iter().collect();
        if lengths.len() > MAX_BUFFERS {
            return Err(Error::InvalidArgument);
        }
        let results = lengths.iter().map(|_| None).collect();
        Ok(ScatterGather {
            lengths,
            results,
            in_flight: Bitmap::new(),
            cancel_requested: Bitmap::new(),
            issuing: true,
        })
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    pub fn buffer_len(&self, index: usize) -> usize {
        self.lengths[index]
    }

    /// Number of sub-operations still owned by the kernel.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, index: usize) -> bool {
        self.in_flight.get(index)
    }

    /// True once no further sub-operation will be issued and none is in flight.
    pub fn is_done(&self) -> bool {
        !self.issuing && self.in_flight.is_empty()
    }

    /// Record that sub-operation `index` was handed to the kernel.
    pub fn mark_issued(&mut self, index: usize) {
        debug_assert!(self.results[index].is_none());
        let was_set = self.in_flight.set(index, true);
        debug_assert!(!was_set, "sub-operation {} issued twice", index);
    }

    /// Record that all sub-operations that are going to be issued have been.
    pub fn finish_issuing(&mut self) {
        self.issuing = false;
    }

    /// Issue one sub-operation per buffer in order.
    ///
    /// Issuing stops at the first sub-operation that fails or comes back short while being
    /// issued; later buffers are never issued.
    pub fn issue_each<F>(&mut self, mut issue: F)
    where
        F: FnMut(usize) -> Issue,
    {
        for index in 0..self.len() {
            match issue(index) {
                Issue::Pending => self.mark_issued(index),
                Issue::Completed(result) => {
                    self.results[index] = Some(result);
                    if self.is_short(index) {
                        break;
                    }
                }
            }
        }
        self.finish_issuing();
    }

    /// Record the completion of an in-flight sub-operation.
    ///
    /// Returns the later sub-operations that are still in flight and must now be cancelled.
    pub fn complete(&mut self, index: usize, result: Result<usize>) -> SmallVec<[usize; 4]> {
        let was_set = self.in_flight.set(index, false);
        debug_assert!(was_set, "sub-operation {} completed twice", index);
        self.results[index] = Some(result);

        let mut cancel = SmallVec::new();
        if self.is_short(index) {
            for later in index + 1..self.len() {
                if self.in_flight.get(later) && !self.cancel_requested.set(later, true) {
                    cancel.push(later);
                }
            }
        }
        cancel
    }

    /// Sub-operations in flight that have not been asked to cancel yet. Used to cancel the
    /// whole transfer on request.
    pub fn cancel_all(&mut self) -> SmallVec<[usize; 4]> {
        let mut cancel = SmallVec::new();
        for index in 0..self.len() {
            if self.in_flight.get(index) && !self.cancel_requested.set(index, true) {
                cancel.push(index);
            }
        }
        cancel
    }

    fn is_short(&self, index: usize) -> bool {
        match self.results[index] {
            Some(Ok(transferred)) => transferred < self.lengths[index],
            Some(Err(_)) => true,
            None => false,
        }
    }

    /// Bytes transferred by the composite operation.
    ///
    /// An error is only reported if not a single byte was transferred before it.
    pub fn transferred(&self) -> Result<usize> {
        let mut total = 0;
        for (index, result) in self.results.iter().enumerate() {
            match *result {
                Some(Ok(transferred)) => {
                    total += transferred;
                    if transferred < self.lengths[index] {
                        break;
                    }
                }
                Some(Err(err)) => {
                    if total == 0 {
                        return Err(err);
                    }
                    break;
                }
                None => break,
            }
        }
        Ok(total)
    }
}
