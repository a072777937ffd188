//! Stages replaying input entities through the node and relationship importers.

use rustc_hash::FxHashMap;
use tracing::info;

use crate::import::importer::{EntityContext, ImporterStats, NodeImporter, RelationshipImporter};
use crate::input::{Groups, InputEntity, InputEntityVisitor, InputIterator};
use crate::staging::{Batch, ExecutionMonitor, Producer, Stage, StageConfig, StageSummary, Step, WorkerLocal};
use crate::types::Result;

/// Turns an input iterator into a stream of entity batches.
pub struct InputProducer<'a> {
    iter: Box<dyn InputIterator + 'a>,
    batch_size: usize,
}

impl<'a> InputProducer<'a> {
    /// Reads up to `batch_size` entities per batch.
    pub fn new(iter: Box<dyn InputIterator + 'a>, batch_size: usize) -> Self {
        Self {
            iter,
            batch_size: batch_size.max(1),
        }
    }
}

impl Producer<InputEntity> for InputProducer<'_> {
    fn next_batch(&mut self, mut buffer: Vec<InputEntity>) -> Result<Option<Vec<InputEntity>>> {
        self.iter.next_chunk(&mut buffer, self.batch_size)?;
        Ok((!buffer.is_empty()).then_some(buffer))
    }
}

fn replay_into<'a, V>(
    name: &str,
    iter: Box<dyn InputIterator + 'a>,
    groups: &Groups,
    config: StageConfig,
    monitor: &dyn ExecutionMonitor,
    importers: &WorkerLocal<V>,
) -> Result<StageSummary>
where
    V: InputEntityVisitor + Send,
{
    Stage::new(name, config)
        .add(Step::producer("input", InputProducer::new(iter, config.batch_size)))
        .add(
            Step::sink("import", |worker: usize, batch: &Batch<InputEntity>| {
                let mut importer = importers.get(worker);
                for entity in &batch.items {
                    entity.replay(groups, &mut *importer)?;
                }
                Ok(())
            })
            .with_workers(config.max_processors),
        )
        .execute(monitor)
}

/// Outcome of an entity import stage.
#[derive(Debug)]
pub struct EntityImportOutcome {
    /// Stage counters.
    pub summary: StageSummary,
    /// Merged importer counters.
    pub stats: ImporterStats,
    /// Relationships imported per type; empty for nodes.
    pub type_counts: FxHashMap<u32, u64>,
}

/// Imports all input nodes.
pub struct NodeImportStage<'a> {
    iter: Box<dyn InputIterator + 'a>,
    groups: &'a Groups,
    ctx: EntityContext<'a>,
    config: StageConfig,
}

impl<'a> NodeImportStage<'a> {
    /// Stage reading nodes from `iter`.
    pub fn new(
        iter: Box<dyn InputIterator + 'a>,
        groups: &'a Groups,
        ctx: EntityContext<'a>,
        config: StageConfig,
    ) -> Self {
        Self {
            iter,
            groups,
            ctx,
            config,
        }
    }

    /// Runs the stage.
    pub fn execute(self, monitor: &dyn ExecutionMonitor) -> Result<EntityImportOutcome> {
        let ctx = self.ctx;
        let importers = WorkerLocal::new(self.config.max_processors, |_| NodeImporter::new(ctx));
        let summary = replay_into("nodes", self.iter, self.groups, self.config, monitor, &importers)?;
        let mut stats = ImporterStats::default();
        for mut importer in importers.into_inner() {
            stats.merge(&importer.finish());
        }
        info!(
            nodes = stats.entities,
            rejected = stats.rejected,
            properties = stats.properties,
            "import.nodes.done"
        );
        Ok(EntityImportOutcome {
            summary,
            stats,
            type_counts: FxHashMap::default(),
        })
    }
}

/// Imports all input relationships.
pub struct RelationshipImportStage<'a> {
    iter: Box<dyn InputIterator + 'a>,
    groups: &'a Groups,
    ctx: EntityContext<'a>,
    config: StageConfig,
}

impl<'a> RelationshipImportStage<'a> {
    /// Stage reading relationships from `iter`.
    pub fn new(
        iter: Box<dyn InputIterator + 'a>,
        groups: &'a Groups,
        ctx: EntityContext<'a>,
        config: StageConfig,
    ) -> Self {
        Self {
            iter,
            groups,
            ctx,
            config,
        }
    }

    /// Runs the stage and merges the per-worker type distributions.
    pub fn execute(self, monitor: &dyn ExecutionMonitor) -> Result<EntityImportOutcome> {
        let ctx = self.ctx;
        let importers = WorkerLocal::new(self.config.max_processors, |_| RelationshipImporter::new(ctx));
        let summary = replay_into(
            "relationships",
            self.iter,
            self.groups,
            self.config,
            monitor,
            &importers,
        )?;
        let mut stats = ImporterStats::default();
        let mut type_counts: FxHashMap<u32, u64> = FxHashMap::default();
        for mut importer in importers.into_inner() {
            let (local, counts) = importer.finish();
            stats.merge(&local);
            for (type_id, count) in counts {
                *type_counts.entry(type_id).or_default() += count;
            }
        }
        info!(
            relationships = stats.entities,
            rejected = stats.rejected,
            types = type_counts.len(),
            "import.relationships.done"
        );
        Ok(EntityImportOutcome {
            summary,
            stats,
            type_counts,
        })
    }
}
