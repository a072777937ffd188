//! Mapping from input node ids to store node ids.
//!
//! Nodes are put concurrently while importing nodes. The lowest node id wins an
//! input id: a put whose id already maps to a lower node is refused on the
//! spot. Before relationships are imported the mapper is prepared once, which
//! resolves the remaining duplicates, those put ahead of a lower node, and
//! returns them for deletion. After preparation the mapper is read-only.

mod actual;
mod hash;

pub use actual::ActualIdMapper;
pub use hash::HashIdMapper;

use crate::input::IdType;
use crate::types::{GroupId, InputId, Result};

/// Input id seen for more than one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DuplicateNode {
    /// The input id.
    pub input: InputId,
    /// Its id group.
    pub group: GroupId,
    /// Node that keeps the id.
    pub kept: u64,
    /// Node to delete.
    pub duplicate: u64,
}

/// Input id to node id lookup.
pub trait IdMapper: Send + Sync {
    /// Records that `input` in `group` was imported as `node`.
    ///
    /// Returns false when the mapper rejects the id right away as a duplicate.
    fn put(&self, input: &InputId, group: GroupId, node: u64) -> Result<bool>;
    /// Undoes an accepted [`IdMapper::put`] of a node that was rejected afterwards.
    fn release(&self, input: &InputId, group: GroupId, node: u64) -> Result<()>;
    /// Whether [`IdMapper::prepare`] must run before lookups.
    fn needs_preparation(&self) -> bool;
    /// Resolves duplicates. Called once after all nodes were put.
    fn prepare(&mut self) -> Result<Vec<DuplicateNode>>;
    /// Node id of `input` in `group`.
    fn get(&self, input: &InputId, group: GroupId) -> Option<u64>;
    /// Whether input ids are node ids.
    fn uses_actual_ids(&self) -> bool {
        false
    }
    /// Bytes held.
    fn memory_usage(&self) -> u64;
    /// Releases memory.
    fn close(&mut self);
}

/// Mapper suited for `id_type`.
pub fn id_mapper_for(id_type: IdType) -> Box<dyn IdMapper> {
    match id_type {
        IdType::String | IdType::Integer => Box::new(HashIdMapper::new()),
        IdType::Actual => Box::new(ActualIdMapper::new()),
    }
}

/// Bytes a mapper for `id_type` needs for `nodes` input ids, before string payloads.
pub fn memory_estimation(id_type: IdType, nodes: u64) -> u64 {
    match id_type {
        IdType::String | IdType::Integer => nodes * HashIdMapper::ENTRY_SIZE,
        IdType::Actual => nodes * 8,
    }
}
