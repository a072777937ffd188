//! Import orchestration.
//!
//! [`ImportLogic`] runs the stages in their fixed order and owns the state handed
//! from one stage to the next: the id mapper, the node relationship cache, the
//! relationship type distribution and the memory bookkeeping. Steps must be
//! called in order; a failing step leaves the logic in a failed state in which
//! only [`ImportLogic::close`] is allowed.

use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::{debug, error, info};

use super::collector::Collector;
use super::importer::EntityContext;
use super::sanity::{self, SanityWarning};
use super::schema::{AffectedSchema, NoSchemaMonitor, SchemaMonitor, UniquenessMonitor};
use super::stages::{
    prepare_id_mapper, CountGroupsStage, DeleteDuplicateNodesStage, ExplicitlyDenseNodesStage,
    LinkingRound, NodeCountsAndLabelIndexBuildStage, NodeDegreeCountStage, NodeFirstGroupStage,
    NodeImportStage, RelationshipCountsAndTypeIndexBuildStage, RelationshipGroupStage,
    RelationshipImportStage, RelationshipLinkBackwardStage, RelationshipLinkForwardStage,
    ScanAndCacheGroupsStage, SparseNodeFirstRelationshipStage, WriteGroupsStage,
};
use super::statistics::DataStatistics;
use crate::cache::{next_set_of_types_that_fit_in_memory, NodeLabelsCache, NodeRelationshipCache, RelationshipGroupCache};
use crate::config::ImportConfig;
use crate::idmapping::{id_mapper_for, IdMapper};
use crate::input::Input;
use crate::staging::{ExecutionMonitor, StageSummary};
use crate::storage::BatchingStores;
use crate::types::{ImportError, Result, TypeId};

/// Observer of linking rounds.
pub trait RelationshipLinkingMonitor: Send + Sync {
    /// The forward pass of `round` linked `types`.
    fn forward_linking_completed(&self, _round: u32, _types: &[u32]) {}
    /// The backward pass of `round` completed.
    fn backward_linking_completed(&self, _round: u32) {}
}

/// Linking monitor that ignores everything.
pub struct NoLinkingMonitor;

impl RelationshipLinkingMonitor for NoLinkingMonitor {}

/// Position of an import in its fixed sequence of steps.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportState {
    /// Nothing ran yet.
    Created,
    /// Sanity checks ran.
    Initialized,
    /// Nodes are written.
    NodesImported,
    /// Duplicates are resolved and deleted.
    IdMapperPrepared,
    /// Relationships are written, unlinked.
    RelationshipsImported,
    /// Node degrees are known.
    DegreesCalculated,
    /// Some linking rounds ran.
    Linking,
    /// All relationship types are linked.
    Linked,
    /// Groups are contiguous per node.
    Defragmented,
    /// Counts and token indexes are built.
    CountsBuilt,
    /// Stores are flushed.
    Succeeded,
    /// A step failed.
    Failed,
}

/// Outcome of an import, successful or not.
#[derive(Clone, Debug, Serialize)]
pub struct ImportReport {
    /// Whether every step succeeded.
    pub successful: bool,
    /// State the import ended in.
    pub state: ImportState,
    /// Wall time.
    pub elapsed_ms: u64,
    /// Totals.
    pub statistics: DataStatistics,
    /// Entities rejected.
    pub bad_entries: u64,
    /// Nodes deleted because their input id was a duplicate.
    pub duplicates_deleted: u64,
    /// Dense nodes found by degree counting.
    pub dense_nodes: u64,
    /// Linking rounds.
    pub rounds: u32,
    /// Highest cache memory observed.
    pub peak_memory_bytes: u64,
    /// Stage after which the peak was observed.
    pub peak_memory_stage: String,
    /// Sanity check findings.
    pub warnings: Vec<SanityWarning>,
    /// Labels and relationship types written.
    pub affected_schema: AffectedSchema,
    /// Per-stage counters in execution order.
    pub stages: Vec<StageSummary>,
}

impl ImportReport {
    /// One-line human readable summary.
    pub fn summary_line(&self) -> String {
        format!(
            "{}: {} in {}ms, {} bad entries, {} duplicates deleted, {} dense nodes, {} linking rounds, peak memory {} bytes after {}",
            if self.successful { "imported" } else { "failed" },
            self.statistics,
            self.elapsed_ms,
            self.bad_entries,
            self.duplicates_deleted,
            self.dense_nodes,
            self.rounds,
            self.peak_memory_bytes,
            if self.peak_memory_stage.is_empty() { "-" } else { &self.peak_memory_stage },
        )
    }
}

/// Runs the stages of one import against `stores`.
pub struct ImportLogic<'a> {
    stores: &'a BatchingStores,
    input: &'a dyn Input,
    config: ImportConfig,
    collector: &'a dyn Collector,
    monitor: &'a dyn ExecutionMonitor,
    linking_monitor: &'a dyn RelationshipLinkingMonitor,
    schema: Box<dyn SchemaMonitor>,
    id_mapper: Box<dyn IdMapper>,
    cache: NodeRelationshipCache,
    state: ImportState,
    statistics: DataStatistics,
    type_order: Vec<(TypeId, u64)>,
    next_type: usize,
    group_heads: FxHashMap<u64, u64>,
    rounds: u32,
    dense_nodes: u64,
    duplicates_deleted: u64,
    peak_memory: u64,
    peak_memory_stage: String,
    warnings: Vec<SanityWarning>,
    stages: Vec<StageSummary>,
    started: Instant,
}

impl<'a> ImportLogic<'a> {
    /// Prepares an import of `input` into `stores`.
    pub fn new(
        stores: &'a BatchingStores,
        input: &'a dyn Input,
        config: ImportConfig,
        collector: &'a dyn Collector,
        monitor: &'a dyn ExecutionMonitor,
    ) -> Self {
        let schema: Box<dyn SchemaMonitor> = if config.unique.is_empty() {
            Box::new(NoSchemaMonitor)
        } else {
            Box::new(UniquenessMonitor::new(
                stores.tokens(),
                config
                    .unique
                    .iter()
                    .map(|c| (c.label.as_str(), c.property.as_str())),
            ))
        };
        Self {
            stores,
            input,
            id_mapper: id_mapper_for(input.id_type()),
            cache: NodeRelationshipCache::new(config.dense_node_threshold),
            config,
            collector,
            monitor,
            linking_monitor: &NoLinkingMonitor,
            schema,
            state: ImportState::Created,
            statistics: DataStatistics::default(),
            type_order: Vec::new(),
            next_type: 0,
            group_heads: FxHashMap::default(),
            rounds: 0,
            dense_nodes: 0,
            duplicates_deleted: 0,
            peak_memory: 0,
            peak_memory_stage: String::new(),
            warnings: Vec::new(),
            stages: Vec::new(),
            started: Instant::now(),
        }
    }

    /// Sets the observer of linking rounds.
    pub fn with_linking_monitor(mut self, monitor: &'a dyn RelationshipLinkingMonitor) -> Self {
        self.linking_monitor = monitor;
        self
    }

    /// Current state.
    pub fn state(&self) -> ImportState {
        self.state
    }

    /// Statistics gathered so far.
    pub fn statistics(&self) -> &DataStatistics {
        &self.statistics
    }

    /// Node relationship cache; released by defragmentation.
    pub fn node_relationship_cache(&self) -> &NodeRelationshipCache {
        &self.cache
    }

    fn run_step<T>(
        &mut self,
        name: &str,
        from: &[ImportState],
        step: impl FnOnce(&mut Self) -> Result<(T, ImportState)>,
    ) -> Result<T> {
        if !from.contains(&self.state) {
            return Err(ImportError::invalid(format!(
                "{name} cannot run in state {:?}",
                self.state
            )));
        }
        match step(self) {
            Ok((value, next)) => {
                self.state = next;
                self.sample_memory(name, 0);
                Ok(value)
            }
            Err(err) => {
                error!(step = name, error = %err, "import.failed");
                self.state = ImportState::Failed;
                self.release();
                Err(err)
            }
        }
    }

    fn release(&mut self) {
        self.cache.close();
        self.id_mapper.close();
        self.group_heads = FxHashMap::default();
    }

    fn cache_memory(&self) -> u64 {
        self.cache.memory_usage() + self.id_mapper.memory_usage()
    }

    fn sample_memory(&mut self, stage: &str, extra: u64) {
        let usage = self.cache_memory() + extra;
        if usage > self.peak_memory {
            self.peak_memory = usage;
            self.peak_memory_stage = stage.to_owned();
        }
    }

    fn free_memory(&self) -> u64 {
        self.config.max_memory.saturating_sub(self.cache_memory())
    }

    fn pages_per_batch(&self) -> usize {
        self.config.records_per_page_batch_pages
    }

    fn entity_context(&self) -> EntityContext<'_> {
        EntityContext {
            stores: self.stores,
            id_mapper: &*self.id_mapper,
            collector: self.collector,
            schema: &*self.schema,
            id_batch_size: self.config.id_batch_size,
            strict_node_check: self.config.strict_node_check,
        }
    }

    /// Runs the pre-flight sanity checks.
    pub fn initialize(&mut self) -> Result<()> {
        self.run_step("initialize", &[ImportState::Created], |this| {
            let estimates = this.input.estimates()?;
            info!(
                nodes = estimates.number_of_nodes,
                relationships = estimates.number_of_relationships,
                processors = this.config.processors(),
                max_memory = this.config.max_memory,
                "import.initialize"
            );
            this.warnings = sanity::check_memory(&estimates, this.input.id_type(), this.config.max_memory);
            this.warnings.extend(sanity::check_id_space(&estimates, this.stores));
            Ok(((), ImportState::Initialized))
        })
    }

    /// Imports all input nodes.
    pub fn import_nodes(&mut self) -> Result<()> {
        self.run_step("import nodes", &[ImportState::Initialized], |this| {
            let outcome = NodeImportStage::new(
                this.input.nodes()?,
                this.input.groups(),
                this.entity_context(),
                this.config.stage_config(),
            )
            .execute(this.monitor)?;
            this.statistics.nodes = outcome.stats.entities;
            this.statistics.node_properties = outcome.stats.properties;
            this.stages.push(outcome.summary);
            Ok(((), ImportState::NodesImported))
        })
    }

    /// Resolves duplicate input ids and deletes the nodes that lost.
    pub fn prepare_id_mapper(&mut self) -> Result<()> {
        self.run_step("prepare id mapper", &[ImportState::NodesImported], |this| {
            let doomed = prepare_id_mapper(&mut *this.id_mapper, this.collector)?;
            let deleted = DeleteDuplicateNodesStage::new(
                this.stores,
                &*this.schema,
                doomed,
                this.config.stage_config(),
            )
            .execute(this.monitor)?;
            this.duplicates_deleted = deleted;
            this.statistics.nodes = this.statistics.nodes.saturating_sub(deleted);
            Ok(((), ImportState::IdMapperPrepared))
        })
    }

    /// Imports all input relationships, unlinked.
    pub fn import_relationships(&mut self) -> Result<()> {
        self.run_step("import relationships", &[ImportState::IdMapperPrepared], |this| {
            let outcome = RelationshipImportStage::new(
                this.input.relationships()?,
                this.input.groups(),
                this.entity_context(),
                this.config.stage_config(),
            )
            .execute(this.monitor)?;
            this.sample_memory("import relationships", 0);
            this.id_mapper.close();
            this.statistics.relationships = outcome.stats.entities;
            this.statistics.relationship_properties = outcome.stats.properties;
            this.statistics
                .set_type_counts(&outcome.type_counts, this.stores.tokens());
            this.type_order = this.statistics.type_distribution();
            this.stages.push(outcome.summary);
            Ok(((), ImportState::RelationshipsImported))
        })
    }

    /// Counts relationships per node and classifies dense nodes.
    pub fn calculate_node_degrees(&mut self) -> Result<()> {
        self.run_step("node degrees", &[ImportState::RelationshipsImported], |this| {
            this.cache.set_node_count(this.stores.nodes().high_id())?;
            let dense_labels = this
                .config
                .dense_labels
                .iter()
                .filter_map(|name| this.stores.tokens().labels.id_of(name))
                .collect();
            ExplicitlyDenseNodesStage::new(
                this.stores,
                &this.cache,
                dense_labels,
                this.config.stage_config(),
                this.pages_per_batch(),
            )
            .execute(this.monitor)?;
            let summary = NodeDegreeCountStage::new(
                this.stores,
                &this.cache,
                this.config.stage_config(),
                this.pages_per_batch(),
            )
            .execute(this.monitor)?;
            this.cache.counting_completed();
            this.dense_nodes = this.cache.number_of_dense_nodes();
            info!(
                dense_nodes = this.dense_nodes,
                threshold = this.config.dense_node_threshold,
                "import.degrees"
            );
            this.stages.push(summary);
            Ok(((), ImportState::DegreesCalculated))
        })
    }

    /// Runs the linking round starting at type index `from`.
    ///
    /// Returns the index the next round starts at, or `None` once every type is linked.
    pub fn link_relationships(&mut self, from: usize) -> Result<Option<usize>> {
        if from != self.next_type {
            return Err(ImportError::invalid(format!(
                "linking round must start at type {}, not {from}",
                self.next_type
            )));
        }
        self.run_step(
            "link relationships",
            &[ImportState::DegreesCalculated, ImportState::Linking],
            |this| {
                if this.type_order.is_empty() {
                    debug!("import.link.nothing_to_link");
                    return Ok((None, ImportState::Linked));
                }
                let next = this.link_round(from)?;
                this.next_type = next;
                Ok(if next < this.type_order.len() {
                    (Some(next), ImportState::Linking)
                } else {
                    (None, ImportState::Linked)
                })
            },
        )
    }

    fn link_round(&mut self, from: usize) -> Result<usize> {
        let first = from == 0;
        if !first {
            self.cache.set_forward_scan(true, true);
        }
        let (to, entries) = next_set_of_types_that_fit_in_memory(
            &self.type_order,
            from,
            self.free_memory(),
            self.dense_nodes,
        );
        self.cache.set_group_capacity(entries)?;
        let round_number = self.rounds + 1;
        let type_ids: Vec<u32> = self.type_order[from..to].iter().map(|(t, _)| t.0).collect();
        let types: FxHashSet<u32> = type_ids.iter().copied().collect();
        let round = LinkingRound {
            types: &types,
            link_sparse: first,
        };
        info!(
            round = round_number,
            from,
            to,
            types = type_ids.len(),
            group_entries = entries,
            "import.link.round"
        );

        let config = self.config.linking_stage_config();
        let pages = self.pages_per_batch();
        let forward = RelationshipLinkForwardStage::new(self.stores, &self.cache, round, config, pages)
            .execute(self.monitor)?;
        self.stages.push(forward);
        self.linking_monitor
            .forward_linking_completed(round_number, &type_ids);

        if self.dense_nodes > 0 {
            let groups = RelationshipGroupStage::new(
                self.stores,
                &self.cache,
                &mut self.group_heads,
                config,
            )
            .execute(self.monitor)?;
            self.stages.push(groups);
        }
        if first {
            let sparse = SparseNodeFirstRelationshipStage::new(self.stores, &self.cache, config, pages)
                .execute(self.monitor)?;
            self.stages.push(sparse);
        }
        self.sample_memory("link forward", 0);

        self.cache.set_forward_scan(false, true);
        let backward = RelationshipLinkBackwardStage::new(self.stores, &self.cache, round, config, pages)
            .execute(self.monitor)?;
        self.stages.push(backward);
        self.linking_monitor.backward_linking_completed(round_number);
        self.rounds = round_number;
        Ok(to)
    }

    /// Runs linking rounds until every relationship type is linked.
    pub fn link_relationships_of_all_types(&mut self) -> Result<()> {
        let mut from = self.next_type;
        while let Some(next) = self.link_relationships(from)? {
            from = next;
        }
        Ok(())
    }

    /// Rewrites relationship groups contiguously and points dense nodes at them.
    ///
    /// Releases the node relationship cache first.
    pub fn defragment_relationship_groups(&mut self) -> Result<()> {
        self.run_step("defragment groups", &[ImportState::Linked], |this| {
            this.cache.close();
            this.group_heads = FxHashMap::default();
            if this.stores.temp_groups().high_id() == 0 {
                return Ok(((), ImportState::Defragmented));
            }
            let config = this.config.stage_config();
            let pages = this.pages_per_batch();
            let node_count = this.stores.nodes().high_id();
            let mut groups = RelationshipGroupCache::new(node_count, this.free_memory())?;
            let counted = CountGroupsStage::new(this.stores, &groups, config, pages).execute(this.monitor)?;
            this.stages.push(counted);

            let mut from = 0;
            while from < node_count {
                let to = groups.prepare(from);
                let gathered = ScanAndCacheGroupsStage::new(this.stores, &mut groups, (from, to), config, pages)
                    .execute(this.monitor)?;
                this.stages.push(gathered);
                let written = WriteGroupsStage::new(this.stores, &groups, config).execute(this.monitor)?;
                this.stages.push(written);
                this.sample_memory("defragment groups", groups.memory_usage());
                from = to;
            }
            let first_groups = NodeFirstGroupStage::new(this.stores, config, pages).execute(this.monitor)?;
            this.stages.push(first_groups);
            Ok(((), ImportState::Defragmented))
        })
    }

    /// Builds node and relationship counts and the label and type indexes.
    pub fn build_counts_store(&mut self) -> Result<()> {
        self.run_step("build counts", &[ImportState::Defragmented], |this| {
            let labels = NodeLabelsCache::new(this.stores.nodes().high_id())?;
            let config = this.config.stage_config();
            let pages = this.pages_per_batch();
            let nodes = NodeCountsAndLabelIndexBuildStage::new(this.stores, &labels, config, pages)
                .execute(this.monitor)?;
            this.stages.push(nodes);
            this.sample_memory("build counts", labels.memory_usage());
            let relationships = RelationshipCountsAndTypeIndexBuildStage::new(this.stores, &labels, config, pages)
                .execute(this.monitor)?;
            this.stages.push(relationships);
            Ok(((), ImportState::CountsBuilt))
        })
    }

    /// Flushes and persists the stores.
    pub fn success(&mut self) -> Result<()> {
        self.run_step("success", &[ImportState::CountsBuilt], |this| {
            this.stores.success()?;
            Ok(((), ImportState::Succeeded))
        })
    }

    /// Runs every step from [`Self::initialize`] to [`Self::success`].
    pub fn run(&mut self) -> Result<()> {
        self.initialize()?;
        self.import_nodes()?;
        self.prepare_id_mapper()?;
        self.import_relationships()?;
        self.calculate_node_degrees()?;
        self.link_relationships_of_all_types()?;
        self.defragment_relationship_groups()?;
        self.build_counts_store()?;
        self.success()
    }

    /// Releases everything, reports the outcome to the monitor and returns the report.
    ///
    /// Runs whether or not the import succeeded.
    pub fn close(mut self) -> Result<ImportReport> {
        self.release();
        let closed = self.stores.close();
        let successful = self.state == ImportState::Succeeded && closed.is_ok();
        let report = ImportReport {
            successful,
            state: self.state,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            statistics: self.statistics.clone(),
            bad_entries: self.collector.bad_entries(),
            duplicates_deleted: self.duplicates_deleted,
            dense_nodes: self.dense_nodes,
            rounds: self.rounds,
            peak_memory_bytes: self.peak_memory,
            peak_memory_stage: self.peak_memory_stage.clone(),
            warnings: self.warnings.clone(),
            affected_schema: self.schema.affected(),
            stages: std::mem::take(&mut self.stages),
        };
        let summary = report.summary_line();
        info!(successful, summary = %summary, "import.done");
        self.monitor.done(successful, self.started.elapsed(), &summary);
        closed?;
        Ok(report)
    }
}
