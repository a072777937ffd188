//! Per-worker node and relationship importers.
//!
//! Each importer is an [`InputEntityVisitor`]: it accumulates the fields of the
//! current entity and commits it on `end_of_entity`. Every id and token is
//! resolved and every check runs before the first record is written, so a
//! rejected entity leaves no records behind.

use rustc_hash::FxHashMap;
use serde::Serialize;
use smallvec::SmallVec;

use super::collector::Collector;
use super::properties::PropertyEncoder;
use super::schema::SchemaMonitor;
use crate::idmapping::{ActualIdMapper, IdMapper};
use crate::input::InputEntityVisitor;
use crate::storage::{BatchingIdGetter, BatchingStores, IdRangeSource, NodeRecord, RecordFormat, RelationshipRecord};
use crate::types::{
    EntityError, EntityResult, GroupId, InputId, Rejection, Result, Value, NULL_REF, RESERVED_ID,
};

/// Collaborators shared by all importers of a stage.
#[derive(Clone, Copy)]
pub struct EntityContext<'a> {
    /// Target stores.
    pub stores: &'a BatchingStores,
    /// Input id to node id mapping.
    pub id_mapper: &'a dyn IdMapper,
    /// Sink for rejected entities.
    pub collector: &'a dyn Collector,
    /// Schema checks and touched-token tracking.
    pub schema: &'a dyn SchemaMonitor,
    /// Ids per allocator refill; 0 uses records per page.
    pub id_batch_size: usize,
    /// Verify that relationship endpoints are live node records.
    pub strict_node_check: bool,
}

impl<'a> EntityContext<'a> {
    fn id_getter(&self, source: &'a dyn IdRangeSource, records_per_page: usize) -> BatchingIdGetter<'a> {
        let size = if self.id_batch_size == 0 {
            records_per_page
        } else {
            self.id_batch_size
        };
        BatchingIdGetter::new(source, size)
    }
}

/// Counters of one importer, merged across workers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImporterStats {
    /// Entities committed.
    pub entities: u64,
    /// Property blocks written.
    pub properties: u64,
    /// Entities rejected.
    pub rejected: u64,
    /// Ids reserved but never used, returned to the stores.
    pub freed_ids: u64,
}

impl ImporterStats {
    /// Adds `other` into `self`.
    pub fn merge(&mut self, other: &ImporterStats) {
        self.entities += other.entities;
        self.properties += other.properties;
        self.rejected += other.rejected;
        self.freed_ids += other.freed_ids;
    }
}

/// Imports nodes for one worker.
pub struct NodeImporter<'a> {
    ctx: EntityContext<'a>,
    node_ids: BatchingIdGetter<'a>,
    property_ids: BatchingIdGetter<'a>,
    dynamic_ids: BatchingIdGetter<'a>,
    encoder: PropertyEncoder,
    input_id: Option<(InputId, GroupId)>,
    labels: SmallVec<[u32; 4]>,
    properties: Vec<(u32, Value)>,
    node: Option<u64>,
    stats: ImporterStats,
}

impl<'a> NodeImporter<'a> {
    /// Creates an importer with its own id allocators.
    pub fn new(ctx: EntityContext<'a>) -> Self {
        let stores = ctx.stores;
        Self {
            node_ids: ctx.id_getter(stores.nodes().id_generator(), stores.nodes().records_per_page()),
            property_ids: ctx.id_getter(
                stores.properties().id_generator(),
                stores.properties().records_per_page(),
            ),
            dynamic_ids: ctx.id_getter(stores.dynamic().id_generator(), stores.dynamic().records_per_page()),
            ctx,
            encoder: PropertyEncoder::new(),
            input_id: None,
            labels: SmallVec::new(),
            properties: Vec::new(),
            node: None,
            stats: ImporterStats::default(),
        }
    }

    fn actual_node_id(&self) -> EntityResult<u64> {
        let (input, _) = self
            .input_id
            .as_ref()
            .ok_or_else(|| Rejection::Malformed("node without id in actual id mode".into()))?;
        let node = ActualIdMapper::node_id(input)
            .ok_or_else(|| Rejection::Malformed(format!("'{input}' is not a node id")))?;
        if node == RESERVED_ID || node > self.ctx.stores.nodes().id_generator().max_id() {
            return Err(Rejection::Malformed(format!("node id {node} is not addressable")).into());
        }
        Ok(node)
    }

    fn rollback(&self, node: u64) -> Result<()> {
        let nodes = self.ctx.stores.nodes();
        nodes.update_record(&NodeRecord::new(node))?;
        nodes.id_generator().free_id(node);
        Ok(())
    }

    fn commit(&mut self) -> EntityResult<()> {
        let stores = self.ctx.stores;
        let actual = self.ctx.id_mapper.uses_actual_ids();
        let node = if actual {
            self.actual_node_id()?
        } else {
            self.node_ids.next_id()?
        };
        self.node = Some(node);

        if let Some((input, group)) = &self.input_id {
            if !self.ctx.id_mapper.put(input, *group, node)? {
                if !actual {
                    self.rollback(node)?;
                }
                return Err(Rejection::DuplicateNode.into());
            }
        }
        if let Err(reason) = self.ctx.schema.check_node(node, &self.labels, &self.properties) {
            if let Some((input, group)) = &self.input_id {
                self.ctx.id_mapper.release(input, *group, node)?;
            }
            if !actual {
                self.rollback(node)?;
            }
            return Err(reason.into());
        }

        let next_prop = self.encoder.write(
            stores,
            &self.properties,
            &mut self.property_ids,
            &mut self.dynamic_ids,
        )?;
        let labels = stores.encode_labels(&self.labels, &mut self.dynamic_ids)?;
        let record = NodeRecord {
            id: node,
            in_use: true,
            dense: false,
            labels,
            next_rel: NULL_REF,
            next_prop,
        };
        stores.nodes().update_record(&record)?;
        for label in &self.labels {
            self.ctx.schema.touched_label(*label);
        }
        self.stats.properties += self.encoder.last_block_count() as u64;
        Ok(())
    }

    fn reset(&mut self) {
        self.input_id = None;
        self.labels.clear();
        self.properties.clear();
        self.node = None;
    }

    /// Returns unused ids to the stores and hands back the counters.
    pub fn finish(&mut self) -> ImporterStats {
        self.stats.freed_ids += self.node_ids.free_unused()
            + self.property_ids.free_unused()
            + self.dynamic_ids.free_unused();
        std::mem::take(&mut self.stats)
    }
}

impl InputEntityVisitor for NodeImporter<'_> {
    fn id(&mut self, id: &InputId, group: GroupId) -> Result<()> {
        self.input_id = Some((id.clone(), group));
        Ok(())
    }

    fn labels(&mut self, labels: &[String]) -> Result<()> {
        for name in labels {
            let label = self.ctx.stores.tokens().labels.get_or_create(name);
            if !self.labels.contains(&label) {
                self.labels.push(label);
            }
        }
        Ok(())
    }

    fn property(&mut self, key: &str, value: &Value) -> Result<()> {
        if !value.is_null() {
            let key = self.ctx.stores.tokens().property_keys.get_or_create(key);
            self.properties.push((key, value.clone()));
        }
        Ok(())
    }

    fn end_of_entity(&mut self) -> Result<()> {
        let outcome = self.commit();
        let result = match outcome {
            Ok(()) => {
                self.stats.entities += 1;
                Ok(())
            }
            Err(EntityError::Rejected(reason)) => {
                self.stats.rejected += 1;
                let input = self.input_id.as_ref();
                match (&reason, input, self.node) {
                    (Rejection::DuplicateNode, Some((id, group)), Some(node)) => {
                        self.ctx.collector.collect_duplicate_node(id, *group, node)
                    }
                    _ => self.ctx.collector.collect_entity_violating_constraint(
                        input.map(|(id, _)| id),
                        self.node,
                        &reason,
                    ),
                }
            }
            Err(EntityError::Fatal(err)) => Err(err),
        };
        self.reset();
        result
    }
}

/// Imports relationships for one worker.
pub struct RelationshipImporter<'a> {
    ctx: EntityContext<'a>,
    relationship_ids: BatchingIdGetter<'a>,
    property_ids: BatchingIdGetter<'a>,
    dynamic_ids: BatchingIdGetter<'a>,
    encoder: PropertyEncoder,
    start: Option<(InputId, GroupId)>,
    end: Option<(InputId, GroupId)>,
    type_name: Option<String>,
    properties: Vec<(u32, Value)>,
    stats: ImporterStats,
    type_counts: FxHashMap<u32, u64>,
}

impl<'a> RelationshipImporter<'a> {
    /// Creates an importer with its own id allocators.
    pub fn new(ctx: EntityContext<'a>) -> Self {
        let stores = ctx.stores;
        Self {
            relationship_ids: ctx.id_getter(
                stores.relationships().id_generator(),
                stores.relationships().records_per_page(),
            ),
            property_ids: ctx.id_getter(
                stores.properties().id_generator(),
                stores.properties().records_per_page(),
            ),
            dynamic_ids: ctx.id_getter(stores.dynamic().id_generator(), stores.dynamic().records_per_page()),
            ctx,
            encoder: PropertyEncoder::new(),
            start: None,
            end: None,
            type_name: None,
            properties: Vec::new(),
            stats: ImporterStats::default(),
            type_counts: FxHashMap::default(),
        }
    }

    fn resolve(&self, endpoint: Option<&(InputId, GroupId)>) -> Result<Option<u64>> {
        let Some((input, group)) = endpoint else {
            return Ok(None);
        };
        let Some(node) = self.ctx.id_mapper.get(input, *group) else {
            return Ok(None);
        };
        if self.ctx.strict_node_check && !self.ctx.stores.nodes().get_record(node)?.in_use {
            return Ok(None);
        }
        Ok(Some(node))
    }

    fn commit(&mut self) -> EntityResult<()> {
        let start = self
            .resolve(self.start.as_ref())?
            .ok_or(Rejection::MissingStartNode)?;
        let end = self
            .resolve(self.end.as_ref())?
            .ok_or(Rejection::MissingEndNode)?;
        let name = self.type_name.as_deref().ok_or(Rejection::MissingType)?;
        let stores = self.ctx.stores;
        let type_id = stores.tokens().relationship_types.get_or_create(name);

        let id = self.relationship_ids.next_id()?;
        let next_prop = self.encoder.write(
            stores,
            &self.properties,
            &mut self.property_ids,
            &mut self.dynamic_ids,
        )?;
        let mut record = RelationshipRecord::new(id);
        record.in_use = true;
        record.first_node = start;
        record.second_node = end;
        record.type_id = type_id;
        record.next_prop = next_prop;
        stores.relationships().update_record(&record)?;

        *self.type_counts.entry(type_id).or_default() += 1;
        self.ctx.schema.touched_type(type_id);
        self.stats.properties += self.encoder.last_block_count() as u64;
        Ok(())
    }

    fn reset(&mut self) {
        self.start = None;
        self.end = None;
        self.type_name = None;
        self.properties.clear();
    }

    /// Returns unused ids to the stores and hands back counters and per-type counts.
    pub fn finish(&mut self) -> (ImporterStats, FxHashMap<u32, u64>) {
        self.stats.freed_ids += self.relationship_ids.free_unused()
            + self.property_ids.free_unused()
            + self.dynamic_ids.free_unused();
        (
            std::mem::take(&mut self.stats),
            std::mem::take(&mut self.type_counts),
        )
    }
}

impl InputEntityVisitor for RelationshipImporter<'_> {
    fn start_id(&mut self, id: &InputId, group: GroupId) -> Result<()> {
        self.start = Some((id.clone(), group));
        Ok(())
    }

    fn end_id(&mut self, id: &InputId, group: GroupId) -> Result<()> {
        self.end = Some((id.clone(), group));
        Ok(())
    }

    fn relationship_type(&mut self, name: &str) -> Result<()> {
        self.type_name = Some(name.to_owned());
        Ok(())
    }

    fn property(&mut self, key: &str, value: &Value) -> Result<()> {
        if !value.is_null() {
            let key = self.ctx.stores.tokens().property_keys.get_or_create(key);
            self.properties.push((key, value.clone()));
        }
        Ok(())
    }

    fn end_of_entity(&mut self) -> Result<()> {
        let result = match self.commit() {
            Ok(()) => {
                self.stats.entities += 1;
                Ok(())
            }
            Err(EntityError::Rejected(reason)) => {
                self.stats.rejected += 1;
                self.ctx.collector.collect_bad_relationship(
                    self.start.as_ref().map(|(id, _)| id),
                    self.type_name.as_deref(),
                    self.end.as_ref().map(|(id, _)| id),
                    &reason,
                )
            }
            Err(EntityError::Fatal(err)) => Err(err),
        };
        self.reset();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmapping::HashIdMapper;
    use crate::import::collector::BadCollector;
    use crate::import::schema::{NoSchemaMonitor, UniquenessMonitor};
    use crate::input::{Groups, InputEntity};

    fn context<'a>(
        stores: &'a BatchingStores,
        mapper: &'a dyn IdMapper,
        collector: &'a dyn Collector,
        schema: &'a dyn SchemaMonitor,
    ) -> EntityContext<'a> {
        EntityContext {
            stores,
            id_mapper: mapper,
            collector,
            schema,
            id_batch_size: 4,
            strict_node_check: false,
        }
    }

    #[test]
    fn rejected_relationship_writes_nothing() -> Result<()> {
        let stores = BatchingStores::in_memory()?;
        let mut mapper = HashIdMapper::new();
        let collector = BadCollector::default();
        let groups = Groups::default();
        {
            let ctx = context(&stores, &mapper, &collector, &NoSchemaMonitor);
            let mut nodes = NodeImporter::new(ctx);
            InputEntity::node("a").replay(&groups, &mut nodes)?;
            nodes.finish();
        }
        mapper.prepare()?;
        let ctx = context(&stores, &mapper, &collector, &NoSchemaMonitor);
        let mut rels = RelationshipImporter::new(ctx);
        InputEntity::relationship("a", "R", "missing")
            .property("weight", 3i64)
            .property("note", "x".repeat(200))
            .replay(&groups, &mut rels)?;
        let (stats, counts) = rels.finish();
        assert_eq!(stats.entities, 0);
        assert_eq!(stats.rejected, 1);
        assert!(counts.is_empty());
        assert_eq!(stores.relationships().high_id(), 0);
        assert_eq!(stores.properties().high_id(), 0);
        assert_eq!(stores.dynamic().high_id(), 0);
        assert_eq!(collector.entries()[0].reason, "end node not found");
        Ok(())
    }

    #[test]
    fn constraint_violation_rolls_back_the_node() -> Result<()> {
        let stores = BatchingStores::in_memory()?;
        let mapper = HashIdMapper::new();
        let collector = BadCollector::default();
        let schema = UniquenessMonitor::new(stores.tokens(), [("User", "email")]);
        let groups = Groups::default();
        let ctx = context(&stores, &mapper, &collector, &schema);
        let mut nodes = NodeImporter::new(ctx);
        InputEntity::node("a").label("User").property("email", "e@x").replay(&groups, &mut nodes)?;
        InputEntity::node("b").label("User").property("email", "e@x").replay(&groups, &mut nodes)?;
        let stats = nodes.finish();
        assert_eq!(stats.entities, 1);
        assert_eq!(stats.rejected, 1);
        assert!(stores.nodes().get_record(0)?.in_use);
        assert!(!stores.nodes().get_record(1)?.in_use);
        assert_eq!(stores.nodes().id_generator().freed_ids()[0], 1);
        assert_eq!(mapper.get(&InputId::from("b"), GroupId(0)), None);
        assert_eq!(collector.bad_entries(), 1);
        Ok(())
    }
}
