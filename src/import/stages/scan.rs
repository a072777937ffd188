//! Store scans feeding stages, and the sink writing records back.

use crate::staging::{Batch, Producer, Sink};
use crate::storage::{RecordFormat, RecordStore};
use crate::types::Result;

type RecordFilter<'a, R> = Box<dyn Fn(&R) -> bool + Send + Sync + 'a>;

/// Reads in-use records of a store page-wise, ascending or descending by id.
pub struct RecordScanProducer<'a, R: RecordFormat> {
    store: &'a RecordStore<R>,
    low: u64,
    high: u64,
    ascending: bool,
    batch_records: u64,
    filter: Option<RecordFilter<'a, R>>,
    scratch: Vec<R>,
}

impl<'a, R: RecordFormat> RecordScanProducer<'a, R> {
    fn new(store: &'a RecordStore<R>, ascending: bool, pages_per_batch: usize) -> Self {
        let batch_records = (store.records_per_page() * pages_per_batch.max(1)) as u64;
        Self {
            store,
            low: 0,
            high: store.high_id(),
            ascending,
            batch_records,
            filter: None,
            scratch: Vec::new(),
        }
    }

    /// Scans every record from id 0 up to the high id.
    pub fn ascending(store: &'a RecordStore<R>, pages_per_batch: usize) -> Self {
        Self::new(store, true, pages_per_batch)
    }

    /// Scans every record from the high id down to id 0.
    pub fn descending(store: &'a RecordStore<R>, pages_per_batch: usize) -> Self {
        Self::new(store, false, pages_per_batch)
    }

    /// Only emits in-use records for which `filter` holds.
    pub fn with_filter(mut self, filter: impl Fn(&R) -> bool + Send + Sync + 'a) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    fn next_range(&mut self) -> Option<(u64, u64)> {
        if self.low >= self.high {
            return None;
        }
        let count = (self.high - self.low).min(self.batch_records);
        if self.ascending {
            let start = self.low;
            self.low += count;
            Some((start, count))
        } else {
            self.high -= count;
            Some((self.high, count))
        }
    }
}

impl<R: RecordFormat> Producer<R> for RecordScanProducer<'_, R> {
    fn next_batch(&mut self, mut buffer: Vec<R>) -> Result<Option<Vec<R>>> {
        while buffer.is_empty() {
            let Some((start, count)) = self.next_range() else {
                return Ok(None);
            };
            self.scratch.clear();
            self.store.read_records(start, count as usize, &mut self.scratch)?;
            if !self.ascending {
                self.scratch.reverse();
            }
            let filter = &self.filter;
            buffer.extend(
                self.scratch
                    .drain(..)
                    .filter(|r| r.in_use() && filter.as_ref().map_or(true, |f| f(r))),
            );
        }
        Ok(Some(buffer))
    }
}

/// Writes every record of a batch back to its store.
pub struct UpdateRecordsSink<'a, R: RecordFormat> {
    store: &'a RecordStore<R>,
}

impl<'a, R: RecordFormat> UpdateRecordsSink<'a, R> {
    /// Sink writing into `store`.
    pub fn new(store: &'a RecordStore<R>) -> Self {
        Self { store }
    }
}

impl<R: RecordFormat> Sink<R> for UpdateRecordsSink<'_, R> {
    fn consume(&self, _worker: usize, batch: &Batch<R>) -> Result<()> {
        self.store.update_records(&batch.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BatchingStores, NodeRecord};

    fn collect(mut producer: RecordScanProducer<'_, NodeRecord>) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        while let Some(batch) = producer.next_batch(Vec::new())? {
            ids.extend(batch.iter().map(|r| r.id));
        }
        Ok(ids)
    }

    #[test]
    fn scans_skip_unused_records_in_both_directions() -> Result<()> {
        let stores = BatchingStores::in_memory()?;
        let nodes = stores.nodes();
        for id in 0..(nodes.records_per_page() as u64 * 2 + 3) {
            let mut record = NodeRecord::new(id);
            record.in_use = id % 3 != 0;
            nodes.update_record(&record)?;
        }
        let up = collect(RecordScanProducer::ascending(nodes, 1))?;
        assert!(up.windows(2).all(|w| w[0] < w[1]));
        assert!(up.iter().all(|id| id % 3 != 0));

        let mut down = collect(RecordScanProducer::descending(nodes, 1))?;
        down.reverse();
        assert_eq!(up, down);

        let even = collect(RecordScanProducer::ascending(nodes, 1).with_filter(|r| r.id % 2 == 0))?;
        assert!(even.iter().all(|id| id % 2 == 0 && id % 3 != 0));
        Ok(())
    }
}
