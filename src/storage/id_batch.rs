//! Per-thread id allocation on top of a shared [`IdRangeSource`].

use tracing::debug;

use super::id_generator::{IdRange, IdRangeSource};
use crate::types::{ImportError, Result, RESERVED_ID};

struct RangeCursor {
    reused: std::vec::IntoIter<u64>,
    next: u64,
    end: u64,
}

impl RangeCursor {
    fn new(range: IdRange) -> Self {
        Self {
            reused: range.reused.into_iter(),
            next: range.start,
            end: range.start + range.length,
        }
    }

    fn next_id(&mut self) -> Option<u64> {
        if let Some(id) = self.reused.next() {
            return Some(id);
        }
        if self.next < self.end {
            let id = self.next;
            self.next += 1;
            return Some(id);
        }
        None
    }
}

/// Hands out ids one at a time from coarse batches fetched from the store.
///
/// One instance belongs to one worker. Ids issued between two batch fetches must
/// be strictly consecutive; a gap means the source misbehaved and is fatal.
pub struct BatchingIdGetter<'a> {
    source: &'a dyn IdRangeSource,
    batch_size: usize,
    range: Option<RangeCursor>,
    last: Option<u64>,
    fresh: bool,
    batches: u64,
}

impl<'a> BatchingIdGetter<'a> {
    /// Creates an allocator fetching `batch_size` ids per request.
    pub fn new(source: &'a dyn IdRangeSource, batch_size: usize) -> Self {
        Self {
            source,
            batch_size: batch_size.max(1),
            range: None,
            last: None,
            fresh: false,
            batches: 0,
        }
    }

    /// Returns the next id, fetching a new batch when the current one is exhausted.
    pub fn next_id(&mut self) -> Result<u64> {
        loop {
            if let Some(cursor) = self.range.as_mut() {
                if let Some(id) = cursor.next_id() {
                    if id == RESERVED_ID {
                        self.last = Some(id);
                        continue;
                    }
                    if !self.fresh {
                        if let Some(prev) = self.last {
                            if id != prev + 1 {
                                return Err(ImportError::IdSequence {
                                    expected: prev + 1,
                                    actual: id,
                                });
                            }
                        }
                    }
                    self.fresh = false;
                    self.last = Some(id);
                    return Ok(id);
                }
            }
            let range = self.source.next_id_batch(self.batch_size)?;
            if range.total() == 0 {
                return Err(ImportError::invalid("id source returned an empty range"));
            }
            self.batches += 1;
            debug!(start = range.start, length = range.length, "idbatch.refetch");
            self.range = Some(RangeCursor::new(range));
            self.fresh = true;
        }
    }

    /// Last id handed out, if any.
    pub fn last_issued(&self) -> Option<u64> {
        self.last.filter(|id| *id != RESERVED_ID)
    }

    /// Number of batches fetched so far.
    pub fn batches_fetched(&self) -> u64 {
        self.batches
    }

    /// Visits ids that were reserved in the current batch but never handed out.
    pub fn visit_unused(&mut self, mut visitor: impl FnMut(u64)) {
        if let Some(mut cursor) = self.range.take() {
            while let Some(id) = cursor.next_id() {
                if id != RESERVED_ID {
                    visitor(id);
                }
            }
        }
    }

    /// Frees the unused tail of the current batch back to the source.
    pub fn free_unused(&mut self) -> u64 {
        let source = self.source;
        let mut freed = 0;
        self.visit_unused(|id| {
            source.free_id(id);
            freed += 1;
        });
        freed
    }
}
