//! Count stores and token indexes, built from the finished node and relationship stores.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::cache::NodeLabelsCache;
use crate::staging::{Batch, ExecutionMonitor, Stage, StageConfig, StageSummary, Step, WorkerLocal};
use crate::storage::{
    BatchingStores, NodeCounts, NodeRecord, RelationshipCountKey, RelationshipCounts,
    RelationshipRecord,
};
use crate::types::Result;

use super::scan::RecordScanProducer;

/// Counts nodes per label, fills the label index and caches node labels.
pub struct NodeCountsAndLabelIndexBuildStage<'a> {
    stores: &'a BatchingStores,
    labels: &'a NodeLabelsCache,
    config: StageConfig,
    pages_per_batch: usize,
}

impl<'a> NodeCountsAndLabelIndexBuildStage<'a> {
    /// Stage filling `labels` for the relationship counting that follows.
    pub fn new(
        stores: &'a BatchingStores,
        labels: &'a NodeLabelsCache,
        config: StageConfig,
        pages_per_batch: usize,
    ) -> Self {
        Self {
            stores,
            labels,
            config,
            pages_per_batch,
        }
    }

    /// Runs the stage.
    pub fn execute(self, monitor: &dyn ExecutionMonitor) -> Result<StageSummary> {
        let stores = self.stores;
        let labels_cache = self.labels;
        let locals: WorkerLocal<NodeCounts> = WorkerLocal::new(self.config.max_processors, |_| NodeCounts::default());
        let summary = Stage::new("node counts and label index", self.config)
            .add(Step::producer(
                "read nodes",
                RecordScanProducer::ascending(stores.nodes(), self.pages_per_batch),
            ))
            .add(
                Step::sink("count", |worker: usize, batch: &Batch<NodeRecord>| {
                    let mut index: FxHashMap<u32, Vec<u64>> = FxHashMap::default();
                    let mut cached = Vec::with_capacity(batch.items.len());
                    {
                        let mut counts = locals.get(worker);
                        for node in &batch.items {
                            let labels = stores.node_labels(node)?;
                            *counts.entry(None).or_default() += 1;
                            for label in &labels {
                                *counts.entry(Some(*label)).or_default() += 1;
                                index.entry(*label).or_default().push(node.id);
                            }
                            cached.push((node.id, labels));
                        }
                    }
                    labels_cache.put_all(cached.iter().map(|(id, labels)| (*id, labels.as_slice())))?;
                    for (label, ids) in index {
                        stores.label_index().add(label, &ids);
                    }
                    Ok(())
                })
                .with_workers(self.config.max_processors),
            )
            .execute(monitor)?;
        for counts in locals.into_inner() {
            stores.counts().add_node_counts(&counts);
        }
        debug!(nodes = stores.counts().node_count(None), "import.counts.nodes");
        Ok(summary)
    }
}

fn bump(counts: &mut RelationshipCounts, start_label: Option<u32>, type_id: Option<u32>, end_label: Option<u32>) {
    let key = RelationshipCountKey {
        start_label,
        type_id,
        end_label,
    };
    *counts.entry(key).or_default() += 1;
}

/// Counts one relationship under every key it matches.
///
/// Keys fix at most one label, either on the start or on the end side.
fn count_relationship(counts: &mut RelationshipCounts, type_id: u32, start_labels: &[u32], end_labels: &[u32]) {
    let t = Some(type_id);
    bump(counts, None, None, None);
    bump(counts, None, t, None);
    for label in start_labels {
        bump(counts, Some(*label), None, None);
        bump(counts, Some(*label), t, None);
    }
    for label in end_labels {
        bump(counts, None, None, Some(*label));
        bump(counts, None, t, Some(*label));
    }
}

/// Counts relationships per type and endpoint label, and fills the type index.
pub struct RelationshipCountsAndTypeIndexBuildStage<'a> {
    stores: &'a BatchingStores,
    labels: &'a NodeLabelsCache,
    config: StageConfig,
    pages_per_batch: usize,
}

impl<'a> RelationshipCountsAndTypeIndexBuildStage<'a> {
    /// Stage reading endpoint labels from `labels`.
    pub fn new(
        stores: &'a BatchingStores,
        labels: &'a NodeLabelsCache,
        config: StageConfig,
        pages_per_batch: usize,
    ) -> Self {
        Self {
            stores,
            labels,
            config,
            pages_per_batch,
        }
    }

    /// Runs the stage.
    pub fn execute(self, monitor: &dyn ExecutionMonitor) -> Result<StageSummary> {
        let stores = self.stores;
        let labels_cache = self.labels;
        let locals: WorkerLocal<RelationshipCounts> =
            WorkerLocal::new(self.config.max_processors, |_| RelationshipCounts::default());
        let summary = Stage::new("relationship counts and type index", self.config)
            .add(Step::producer(
                "read relationships",
                RecordScanProducer::ascending(stores.relationships(), self.pages_per_batch),
            ))
            .add(
                Step::sink("count", |worker: usize, batch: &Batch<RelationshipRecord>| {
                    let mut index: FxHashMap<u32, Vec<u64>> = FxHashMap::default();
                    {
                        let mut counts = locals.get(worker);
                        for rel in &batch.items {
                            let start: SmallVec<[u32; 2]> = labels_cache.get(rel.first_node);
                            let end: SmallVec<[u32; 2]> = labels_cache.get(rel.second_node);
                            count_relationship(&mut counts, rel.type_id, &start, &end);
                            index.entry(rel.type_id).or_default().push(rel.id);
                        }
                    }
                    for (type_id, ids) in index {
                        stores.type_index().add(type_id, &ids);
                    }
                    Ok(())
                })
                .with_workers(self.config.max_processors),
            )
            .execute(monitor)?;
        for counts in locals.into_inner() {
            stores.counts().add_relationship_counts(&counts);
        }
        debug!(
            relationships = stores.counts().relationship_count(None, None, None),
            "import.counts.relationships"
        );
        Ok(summary)
    }
}
