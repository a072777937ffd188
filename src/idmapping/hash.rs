use std::hash::{Hash, Hasher};
use std::mem::size_of;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use smallvec::SmallVec;
use tracing::debug;

use super::{DuplicateNode, IdMapper};
use crate::types::{GroupId, InputId, Result};

const SHARDS: usize = 64;

type Key = (GroupId, InputId);
type Nodes = SmallVec<[u64; 1]>;

/// Sharded hash map from `(group, input id)` to node ids.
pub struct HashIdMapper {
    shards: Vec<Mutex<FxHashMap<Key, Nodes>>>,
    prepared: bool,
}

impl Default for HashIdMapper {
    fn default() -> Self {
        Self::new()
    }
}

fn shard_of(key: &Key) -> usize {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARDS
}

impl HashIdMapper {
    /// Bytes per mapped id, excluding string payloads.
    pub const ENTRY_SIZE: u64 = (size_of::<Key>() + size_of::<Nodes>()) as u64;

    /// Creates an empty mapper.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(FxHashMap::default())).collect(),
            prepared: false,
        }
    }

    /// Number of distinct input ids.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Whether no id was put.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdMapper for HashIdMapper {
    fn put(&self, input: &InputId, group: GroupId, node: u64) -> Result<bool> {
        let key = (group, input.clone());
        let shard = shard_of(&key);
        let mut shard = self.shards[shard].lock();
        let nodes = shard.entry(key).or_default();
        if nodes.iter().any(|existing| *existing < node) {
            return Ok(false);
        }
        nodes.push(node);
        Ok(true)
    }

    fn release(&self, input: &InputId, group: GroupId, node: u64) -> Result<()> {
        let key = (group, input.clone());
        let mut shard = self.shards[shard_of(&key)].lock();
        if let Some(nodes) = shard.get_mut(&key) {
            nodes.retain(|existing| *existing != node);
            if nodes.is_empty() {
                shard.remove(&key);
            }
        }
        Ok(())
    }

    fn needs_preparation(&self) -> bool {
        !self.prepared
    }

    fn prepare(&mut self) -> Result<Vec<DuplicateNode>> {
        let mut duplicates = Vec::new();
        for shard in &mut self.shards {
            for ((group, input), nodes) in shard.get_mut().iter_mut() {
                if nodes.len() < 2 {
                    continue;
                }
                nodes.sort_unstable();
                let kept = nodes[0];
                duplicates.extend(nodes[1..].iter().map(|duplicate| DuplicateNode {
                    input: input.clone(),
                    group: *group,
                    kept,
                    duplicate: *duplicate,
                }));
                nodes.truncate(1);
            }
        }
        duplicates.sort_unstable_by_key(|d| d.duplicate);
        self.prepared = true;
        debug!(duplicates = duplicates.len(), "idmapper.prepared");
        Ok(duplicates)
    }

    fn get(&self, input: &InputId, group: GroupId) -> Option<u64> {
        let key = (group, input.clone());
        let shard = self.shards[shard_of(&key)].lock();
        shard.get(&key).and_then(|nodes| nodes.iter().min().copied())
    }

    fn memory_usage(&self) -> u64 {
        self.shards
            .iter()
            .map(|shard| {
                let shard = shard.lock();
                let keys: u64 = shard
                    .keys()
                    .map(|(_, id)| match id {
                        InputId::Str(s) => s.capacity() as u64,
                        InputId::Int(_) => 0,
                    })
                    .sum();
                shard.capacity() as u64 * (size_of::<Key>() + size_of::<Nodes>()) as u64 + keys
            })
            .sum()
    }

    fn close(&mut self) {
        for shard in &mut self.shards {
            *shard.get_mut() = FxHashMap::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_node_wins_and_others_are_duplicates() -> Result<()> {
        let mut mapper = HashIdMapper::new();
        let a = InputId::from("a");
        assert!(mapper.put(&a, GroupId(0), 7)?);
        assert!(mapper.put(&a, GroupId(0), 3)?);
        assert!(!mapper.put(&a, GroupId(0), 8)?);
        mapper.put(&a, GroupId(1), 9)?;
        mapper.put(&InputId::Int(5), GroupId(0), 4)?;
        assert!(mapper.needs_preparation());
        let duplicates = mapper.prepare()?;
        assert_eq!(
            duplicates,
            vec![DuplicateNode {
                input: a.clone(),
                group: GroupId(0),
                kept: 3,
                duplicate: 7
            }]
        );
        assert_eq!(mapper.get(&a, GroupId(0)), Some(3));
        assert_eq!(mapper.get(&a, GroupId(1)), Some(9));
        assert_eq!(mapper.get(&InputId::Int(5), GroupId(0)), Some(4));
        assert_eq!(mapper.get(&InputId::from("zz"), GroupId(0)), None);
        assert_eq!(mapper.len(), 3);
        Ok(())
    }

    #[test]
    fn released_puts_leave_no_trace() -> Result<()> {
        let mut mapper = HashIdMapper::new();
        let a = InputId::from("a");
        assert!(mapper.put(&a, GroupId(0), 4)?);
        mapper.release(&a, GroupId(0), 4)?;
        assert_eq!(mapper.get(&a, GroupId(0)), None);
        assert!(mapper.is_empty());
        assert!(mapper.put(&a, GroupId(0), 6)?);
        assert!(mapper.prepare()?.is_empty());
        assert_eq!(mapper.get(&a, GroupId(0)), Some(6));
        Ok(())
    }

    #[test]
    fn concurrent_puts_are_all_visible() -> Result<()> {
        let mut mapper = HashIdMapper::new();
        std::thread::scope(|scope| {
            for worker in 0..4u64 {
                let mapper = &mapper;
                scope.spawn(move || {
                    for i in 0..1000u64 {
                        let node = worker * 1000 + i;
                        mapper.put(&InputId::Int(node as i64), GroupId(0), node).unwrap();
                    }
                });
            }
        });
        assert!(mapper.prepare()?.is_empty());
        assert_eq!(mapper.get(&InputId::Int(3999), GroupId(0)), Some(3999));
        Ok(())
    }
}
