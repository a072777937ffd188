use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use super::{DuplicateNode, IdMapper};
use crate::types::{GroupId, InputId, Result};

const SHARDS: usize = 64;

/// Mapper for inputs whose ids already are node ids. Only remembers which ids exist.
pub struct ActualIdMapper {
    shards: Vec<Mutex<FxHashSet<u64>>>,
}

impl Default for ActualIdMapper {
    fn default() -> Self {
        Self::new()
    }
}

fn as_node(input: &InputId) -> Option<u64> {
    match input {
        InputId::Int(v) => u64::try_from(*v).ok(),
        InputId::Str(s) => s.trim().parse().ok(),
    }
}

impl ActualIdMapper {
    /// Creates an empty mapper.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(FxHashSet::default())).collect(),
        }
    }

    /// Node id named by `input`, if it is a valid one.
    pub fn node_id(input: &InputId) -> Option<u64> {
        as_node(input)
    }
}

impl IdMapper for ActualIdMapper {
    fn put(&self, _input: &InputId, _group: GroupId, node: u64) -> Result<bool> {
        Ok(self.shards[node as usize % SHARDS].lock().insert(node))
    }

    fn release(&self, _input: &InputId, _group: GroupId, node: u64) -> Result<()> {
        self.shards[node as usize % SHARDS].lock().remove(&node);
        Ok(())
    }

    fn needs_preparation(&self) -> bool {
        false
    }

    fn prepare(&mut self) -> Result<Vec<DuplicateNode>> {
        Ok(Vec::new())
    }

    fn get(&self, input: &InputId, _group: GroupId) -> Option<u64> {
        let node = as_node(input)?;
        self.shards[node as usize % SHARDS]
            .lock()
            .contains(&node)
            .then_some(node)
    }

    fn uses_actual_ids(&self) -> bool {
        true
    }

    fn memory_usage(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.lock().capacity() as u64 * 8)
            .sum()
    }

    fn close(&mut self) {
        for shard in &mut self.shards {
            *shard.get_mut() = FxHashSet::default();
        }
    }
}
