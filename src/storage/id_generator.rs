use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::types::{ImportError, Result};

/// Contiguous id interval handed out by an id generator, optionally preceded
/// by individually reused ids.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdRange {
    /// Previously freed ids handed out before the contiguous part.
    pub reused: Vec<u64>,
    /// First id of the contiguous part.
    pub start: u64,
    /// Length of the contiguous part.
    pub length: u64,
}

impl IdRange {
    /// A plain `[start, start + length)` range.
    pub fn contiguous(start: u64, length: u64) -> Self {
        Self {
            reused: Vec::new(),
            start,
            length,
        }
    }

    /// Total ids in the range.
    pub fn total(&self) -> u64 {
        self.reused.len() as u64 + self.length
    }
}

/// Source of id ranges, shared by all allocators of one store.
pub trait IdRangeSource: Send + Sync {
    /// Atomically reserves `size` ids.
    fn next_id_batch(&self, size: usize) -> Result<IdRange>;
    /// Returns an id that ended up unused.
    fn free_id(&self, id: u64);
}

/// High-water-mark id generator of a record store.
///
/// Bulk import never reuses ids; freed ids are only remembered so the store can
/// report them.
pub struct IdGenerator {
    store: &'static str,
    high: AtomicU64,
    max_id: u64,
    freed: Mutex<Vec<u64>>,
}

impl IdGenerator {
    /// Creates a generator starting at `high_id` that never exceeds `max_id`.
    pub fn new(store: &'static str, high_id: u64, max_id: u64) -> Self {
        Self {
            store,
            high: AtomicU64::new(high_id),
            max_id,
            freed: Mutex::new(Vec::new()),
        }
    }

    /// Next id that has never been handed out.
    pub fn high_id(&self) -> u64 {
        self.high.load(Ordering::Acquire)
    }

    /// Largest id this generator may hand out.
    pub fn max_id(&self) -> u64 {
        self.max_id
    }

    /// Raises the high id so that `id` counts as used.
    pub fn mark_used(&self, id: u64) {
        self.high.fetch_max(id.saturating_add(1), Ordering::AcqRel);
    }

    /// Ids freed during the import, sorted.
    pub fn freed_ids(&self) -> Vec<u64> {
        let mut ids = self.freed.lock().clone();
        ids.sort_unstable();
        ids
    }
}

impl IdRangeSource for IdGenerator {
    fn next_id_batch(&self, size: usize) -> Result<IdRange> {
        if size == 0 {
            return Err(ImportError::invalid("id batch size must be positive"));
        }
        let start = self.high.fetch_add(size as u64, Ordering::AcqRel);
        let end = start.saturating_add(size as u64);
        if end > self.max_id.saturating_add(1) {
            return Err(ImportError::ReservedIdExhausted {
                store: self.store,
                high_id: start,
            });
        }
        trace!(store = self.store, start, size, "idgen.batch");
        Ok(IdRange::contiguous(start, size as u64))
    }

    fn free_id(&self, id: u64) {
        self.freed.lock().push(id);
    }
}
