//! Rewrites scratch relationship groups contiguously per node, sorted by type.

use parking_lot::Mutex;

use crate::cache::{CachedGroup, RelationshipGroupCache};
use crate::staging::{Batch, ExecutionMonitor, Producer, Stage, StageConfig, StageSummary, Step};
use crate::storage::{BatchingStores, IdGenerator, IdRangeSource, RelationshipGroupRecord};
use crate::types::{ImportError, Result, NULL_REF};

use super::scan::{RecordScanProducer, UpdateRecordsSink};

/// Counts scratch groups per owner.
pub struct CountGroupsStage<'a> {
    stores: &'a BatchingStores,
    cache: &'a RelationshipGroupCache,
    config: StageConfig,
    pages_per_batch: usize,
}

impl<'a> CountGroupsStage<'a> {
    /// Stage counting into `cache`.
    pub fn new(
        stores: &'a BatchingStores,
        cache: &'a RelationshipGroupCache,
        config: StageConfig,
        pages_per_batch: usize,
    ) -> Self {
        Self {
            stores,
            cache,
            config,
            pages_per_batch,
        }
    }

    /// Runs the stage.
    pub fn execute(self, monitor: &dyn ExecutionMonitor) -> Result<StageSummary> {
        let cache = self.cache;
        Stage::new("count groups", self.config)
            .add(Step::producer(
                "read groups",
                RecordScanProducer::ascending(self.stores.temp_groups(), self.pages_per_batch),
            ))
            .add(
                Step::sink("count", move |_worker: usize, batch: &Batch<RelationshipGroupRecord>| {
                    for group in &batch.items {
                        cache.increment_group_count(group.owner)?;
                    }
                    Ok(())
                })
                .with_workers(self.config.max_processors),
            )
            .execute(monitor)
    }
}

/// Caches the scratch groups of the prepared owner range, scanning backwards.
pub struct ScanAndCacheGroupsStage<'a> {
    stores: &'a BatchingStores,
    cache: &'a mut RelationshipGroupCache,
    from: u64,
    to: u64,
    config: StageConfig,
    pages_per_batch: usize,
}

impl<'a> ScanAndCacheGroupsStage<'a> {
    /// Stage filling `cache`, which was prepared for owners `[from, to)`.
    pub fn new(
        stores: &'a BatchingStores,
        cache: &'a mut RelationshipGroupCache,
        range: (u64, u64),
        config: StageConfig,
        pages_per_batch: usize,
    ) -> Self {
        Self {
            stores,
            cache,
            from: range.0,
            to: range.1,
            config,
            pages_per_batch,
        }
    }

    /// Runs the stage and verifies that every chain of the range was complete.
    pub fn execute(self, monitor: &dyn ExecutionMonitor) -> Result<StageSummary> {
        let (from, to) = (self.from, self.to);
        let cache = Mutex::new(self.cache);
        let summary = Stage::new("gather groups", self.config)
            .add(Step::producer(
                "read groups backwards",
                RecordScanProducer::descending(self.stores.temp_groups(), self.pages_per_batch)
                    .with_filter(move |group: &RelationshipGroupRecord| {
                        group.owner >= from && group.owner < to
                    }),
            ))
            .add(Step::sink(
                "cache",
                |_worker: usize, batch: &Batch<RelationshipGroupRecord>| {
                    let mut cache = cache.lock();
                    for group in &batch.items {
                        cache.put(group)?;
                    }
                    Ok(())
                },
            ))
            .execute(monitor)?;
        cache.into_inner().verify_range()?;
        Ok(summary)
    }
}

/// Hands out the cached groups owner by owner with consecutive final ids.
struct FinalGroupProducer<'a> {
    owners: Vec<(u64, &'a [CachedGroup])>,
    position: usize,
    ids: &'a IdGenerator,
    batch_size: usize,
}

impl Producer<RelationshipGroupRecord> for FinalGroupProducer<'_> {
    fn next_batch(
        &mut self,
        mut buffer: Vec<RelationshipGroupRecord>,
    ) -> Result<Option<Vec<RelationshipGroupRecord>>> {
        while buffer.len() < self.batch_size && self.position < self.owners.len() {
            let (owner, groups) = self.owners[self.position];
            self.position += 1;
            let range = self.ids.next_id_batch(groups.len())?;
            if !range.reused.is_empty() || range.length != groups.len() as u64 {
                return Err(ImportError::invalid(format!(
                    "groups of node {owner} need {} consecutive ids",
                    groups.len()
                )));
            }
            let last = range.start + range.length - 1;
            for (id, group) in (range.start..).zip(groups) {
                buffer.push(RelationshipGroupRecord {
                    id,
                    in_use: true,
                    type_id: group.type_id,
                    owner,
                    next: if id == last { NULL_REF } else { id + 1 },
                    first: group.first,
                });
            }
        }
        Ok((!buffer.is_empty()).then_some(buffer))
    }
}

/// Writes the cached groups of the prepared range to the final group store.
pub struct WriteGroupsStage<'a> {
    stores: &'a BatchingStores,
    cache: &'a RelationshipGroupCache,
    config: StageConfig,
}

impl<'a> WriteGroupsStage<'a> {
    /// Stage draining `cache`.
    pub fn new(stores: &'a BatchingStores, cache: &'a RelationshipGroupCache, config: StageConfig) -> Self {
        Self {
            stores,
            cache,
            config,
        }
    }

    /// Runs the stage.
    pub fn execute(self, monitor: &dyn ExecutionMonitor) -> Result<StageSummary> {
        let groups = self.stores.groups();
        let producer = FinalGroupProducer {
            owners: self.cache.groups().collect(),
            position: 0,
            ids: groups.id_generator(),
            batch_size: self.config.batch_size.max(1),
        };
        Stage::new("write groups", self.config)
            .add(Step::producer("assign ids", producer))
            .add(Step::sink("write", UpdateRecordsSink::new(groups)).with_workers(self.config.max_processors))
            .execute(monitor)
    }
}

/// Points every dense node at its first final group.
pub struct NodeFirstGroupStage<'a> {
    stores: &'a BatchingStores,
    config: StageConfig,
    pages_per_batch: usize,
}

impl<'a> NodeFirstGroupStage<'a> {
    /// Stage reading the final group store.
    pub fn new(stores: &'a BatchingStores, config: StageConfig, pages_per_batch: usize) -> Self {
        Self {
            stores,
            config,
            pages_per_batch,
        }
    }

    /// Runs the stage.
    pub fn execute(self, monitor: &dyn ExecutionMonitor) -> Result<StageSummary> {
        let nodes = self.stores.nodes();
        let last_owner = Mutex::new(NULL_REF);
        Stage::new("node first group", self.config)
            .add(Step::producer(
                "read groups",
                RecordScanProducer::ascending(self.stores.groups(), self.pages_per_batch),
            ))
            .add(Step::sink(
                "set first group",
                |_worker: usize, batch: &Batch<RelationshipGroupRecord>| {
                    let mut last_owner = last_owner.lock();
                    for group in &batch.items {
                        if group.owner == *last_owner {
                            continue;
                        }
                        *last_owner = group.owner;
                        let mut node = nodes.get_record(group.owner)?;
                        if !node.in_use {
                            return Err(ImportError::corruption(format!(
                                "group {} is owned by unused node {}",
                                group.id, group.owner
                            )));
                        }
                        node.dense = true;
                        node.next_rel = group.id;
                        nodes.update_record(&node)?;
                    }
                    Ok(())
                },
            ))
            .execute(monitor)
    }
}
