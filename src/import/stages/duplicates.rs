//! Id mapper preparation and removal of nodes whose input id was a duplicate.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use crate::idmapping::IdMapper;
use crate::import::collector::Collector;
use crate::import::properties::read_properties;
use crate::import::schema::SchemaMonitor;
use crate::staging::{Batch, ExecutionMonitor, Stage, StageConfig, Step, VecProducer};
use crate::storage::{BatchingStores, IdRangeSource, NodeLabels, NodeRecord, RecordFormat};
use crate::types::Result;

/// Prepares `mapper` for lookups and reports every duplicate input id.
///
/// Returns the node ids that must be deleted, ascending.
pub fn prepare_id_mapper(mapper: &mut dyn IdMapper, collector: &dyn Collector) -> Result<Vec<u64>> {
    if !mapper.needs_preparation() {
        return Ok(Vec::new());
    }
    let duplicates = mapper.prepare()?;
    let mut nodes = Vec::with_capacity(duplicates.len());
    for duplicate in &duplicates {
        collector.collect_duplicate_node(&duplicate.input, duplicate.group, duplicate.duplicate)?;
        nodes.push(duplicate.duplicate);
    }
    nodes.sort_unstable();
    nodes.dedup();
    info!(duplicates = nodes.len(), "import.id_mapper.prepared");
    Ok(nodes)
}

/// Marks duplicate nodes, their property chains and label chains as unused.
///
/// Uniqueness claims of a deleted node are handed back to the schema monitor.
pub struct DeleteDuplicateNodesStage<'a> {
    stores: &'a BatchingStores,
    schema: &'a dyn SchemaMonitor,
    nodes: Vec<u64>,
    config: StageConfig,
}

impl<'a> DeleteDuplicateNodesStage<'a> {
    /// Stage deleting `nodes`.
    pub fn new(
        stores: &'a BatchingStores,
        schema: &'a dyn SchemaMonitor,
        nodes: Vec<u64>,
        config: StageConfig,
    ) -> Self {
        Self {
            stores,
            schema,
            nodes,
            config,
        }
    }

    fn delete(stores: &BatchingStores, schema: &dyn SchemaMonitor, node: u64) -> Result<bool> {
        let record = stores.nodes().get_record(node)?;
        if !record.in_use {
            return Ok(false);
        }
        let labels = stores.node_labels(&record)?;
        let properties = read_properties(stores, record.next_prop)?;
        schema.release_node(node, &labels, &properties);
        stores.delete_property_chain(record.next_prop)?;
        if let NodeLabels::Dynamic(first) = record.labels {
            stores.delete_dynamic_chain(first)?;
        }
        stores.nodes().update_record(&NodeRecord::new(node))?;
        stores.nodes().id_generator().free_id(node);
        Ok(true)
    }

    /// Runs the stage and returns the number of nodes deleted.
    pub fn execute(self, monitor: &dyn ExecutionMonitor) -> Result<u64> {
        if self.nodes.is_empty() {
            return Ok(0);
        }
        let deleted = AtomicU64::new(0);
        let stores = self.stores;
        let schema = self.schema;
        Stage::new("delete duplicate nodes", self.config)
            .add(Step::producer(
                "duplicates",
                VecProducer::new(self.nodes, self.config.batch_size),
            ))
            .add(
                Step::sink("delete", |_worker: usize, batch: &Batch<u64>| {
                    for node in &batch.items {
                        if Self::delete(stores, schema, *node)? {
                            deleted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Ok(())
                })
                .with_workers(self.config.max_processors),
            )
            .execute(monitor)?;
        let deleted = deleted.into_inner();
        info!(deleted, "import.duplicates.deleted");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmapping::HashIdMapper;
    use crate::import::collector::{BadCollector, BadEntryKind};
    use crate::import::importer::{EntityContext, NodeImporter};
    use crate::import::schema::UniquenessMonitor;
    use crate::input::{Groups, InputEntity};
    use crate::staging::SilentMonitor;
    use crate::types::{GroupId, InputId, Value};

    #[test]
    fn later_duplicates_are_reported_and_deleted() -> Result<()> {
        let stores = BatchingStores::in_memory()?;
        let mut mapper = HashIdMapper::new();
        let collector = BadCollector::default();
        let schema = UniquenessMonitor::new(stores.tokens(), [("Person", "email")]);
        let groups = Groups::default();
        {
            let ctx = EntityContext {
                stores: &stores,
                id_mapper: &mapper,
                collector: &collector,
                schema: &schema,
                id_batch_size: 8,
                strict_node_check: false,
            };
            // Two workers: `low` owns ids 0..8, `high` owns 8..16.
            let mut low = NodeImporter::new(ctx);
            let mut high = NodeImporter::new(ctx);
            InputEntity::node("b").replay(&groups, &mut low)?;
            InputEntity::node("a")
                .label("Person")
                .property("email", "late@example.com")
                .replay(&groups, &mut high)?;
            InputEntity::node("a")
                .label("Person")
                .property("email", "early@example.com")
                .replay(&groups, &mut low)?;
            // Refused on the spot: "a" already maps to node 1.
            InputEntity::node("a")
                .property("name", "third".repeat(10))
                .replay(&groups, &mut low)?;
            low.finish();
            high.finish();
        }
        assert_eq!(collector.bad_entries(), 1);
        assert!(!stores.nodes().get_record(2)?.in_use);

        let doomed = prepare_id_mapper(&mut mapper, &collector)?;
        assert_eq!(doomed, vec![8]);
        assert_eq!(mapper.get(&InputId::from("a"), GroupId(0)), Some(1));
        assert_eq!(collector.bad_entries(), 2);
        assert!(collector
            .entries()
            .iter()
            .all(|entry| entry.kind == BadEntryKind::DuplicateNode));

        let doomed_props = stores.nodes().get_record(8)?.next_prop;
        let deleted = DeleteDuplicateNodesStage::new(&stores, &schema, doomed, StageConfig::default())
            .execute(&SilentMonitor)?;
        assert_eq!(deleted, 1);
        assert!(!stores.nodes().get_record(8)?.in_use);
        assert!(!stores.properties().get_record(doomed_props)?.in_use);
        assert!(stores.nodes().get_record(1)?.in_use);

        // The deleted node no longer holds its email, the kept one still does.
        let person = stores.tokens().labels.get_or_create("Person");
        let email = stores.tokens().property_keys.get_or_create("email");
        let late = vec![(email, Value::from("late@example.com"))];
        let early = vec![(email, Value::from("early@example.com"))];
        assert!(schema.check_node(20, &[person], &late).is_ok());
        assert!(schema.check_node(21, &[person], &early).is_err());
        Ok(())
    }
}
