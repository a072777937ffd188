//! Counts relationships per node into the node relationship cache.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use crate::cache::NodeRelationshipCache;
use crate::staging::{Batch, ExecutionMonitor, Stage, StageConfig, StageSummary, Step};
use crate::storage::{BatchingStores, NodeRecord, RelationshipRecord};
use crate::types::Result;

use super::scan::RecordScanProducer;

/// Scans all relationships and increments the degree of both endpoints.
pub struct NodeDegreeCountStage<'a> {
    stores: &'a BatchingStores,
    cache: &'a NodeRelationshipCache,
    config: StageConfig,
    pages_per_batch: usize,
}

impl<'a> NodeDegreeCountStage<'a> {
    /// Stage counting into `cache`, which must already be sized for all nodes.
    pub fn new(
        stores: &'a BatchingStores,
        cache: &'a NodeRelationshipCache,
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
        Stage::new("node degrees", self.config)
            .add(Step::producer(
                "read relationships",
                RecordScanProducer::ascending(self.stores.relationships(), self.pages_per_batch),
            ))
            .add(
                Step::sink("count", move |_worker: usize, batch: &Batch<RelationshipRecord>| {
                    for rel in &batch.items {
                        cache.increment_count(rel.first_node)?;
                        if !rel.is_loop() {
                            cache.increment_count(rel.second_node)?;
                        }
                    }
                    Ok(())
                })
                .with_workers(self.config.max_processors),
            )
            .execute(monitor)
    }
}

/// Marks nodes carrying any of a set of labels as dense before degrees are counted.
pub struct ExplicitlyDenseNodesStage<'a> {
    stores: &'a BatchingStores,
    cache: &'a NodeRelationshipCache,
    labels: Vec<u32>,
    config: StageConfig,
    pages_per_batch: usize,
}

impl<'a> ExplicitlyDenseNodesStage<'a> {
    /// Stage marking nodes labelled with one of `labels`.
    pub fn new(
        stores: &'a BatchingStores,
        cache: &'a NodeRelationshipCache,
        labels: Vec<u32>,
        config: StageConfig,
        pages_per_batch: usize,
    ) -> Self {
        Self {
            stores,
            cache,
            labels,
            config,
            pages_per_batch,
        }
    }

    /// Runs the stage and returns the number of nodes marked.
    pub fn execute(self, monitor: &dyn ExecutionMonitor) -> Result<u64> {
        if self.labels.is_empty() {
            return Ok(0);
        }
        let marked = AtomicU64::new(0);
        let (stores, cache, labels) = (self.stores, self.cache, &self.labels);
        Stage::new("explicitly dense nodes", self.config)
            .add(Step::producer(
                "read nodes",
                RecordScanProducer::ascending(stores.nodes(), self.pages_per_batch),
            ))
            .add(
                Step::sink("mark", |_worker: usize, batch: &Batch<NodeRecord>| {
                    for node in &batch.items {
                        let node_labels = stores.node_labels(node)?;
                        if node_labels.iter().any(|label| labels.contains(label)) {
                            cache.mark_as_explicitly_dense(node.id)?;
                            marked.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Ok(())
                })
                .with_workers(self.config.max_processors),
            )
            .execute(monitor)?;
        let marked = marked.into_inner();
        info!(marked, "import.degrees.explicitly_dense");
        Ok(marked)
    }
}
