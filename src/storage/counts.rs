use std::collections::BTreeMap;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Key of a relationship count. `None` means "any".
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationshipCountKey {
    /// Label of the start node.
    pub start_label: Option<u32>,
    /// Relationship type.
    pub type_id: Option<u32>,
    /// Label of the end node.
    pub end_label: Option<u32>,
}

/// Local node count accumulator of one worker, keyed by label (`None` = all nodes).
pub type NodeCounts = FxHashMap<Option<u32>, u64>;

/// Local relationship count accumulator of one worker.
pub type RelationshipCounts = FxHashMap<RelationshipCountKey, u64>;

/// Aggregate node and relationship counts.
#[derive(Default)]
pub struct CountsStore {
    nodes: Mutex<NodeCounts>,
    relationships: Mutex<RelationshipCounts>,
}

/// Persisted form of [`CountsStore`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CountsSnapshot {
    /// `(label, count)` pairs; `None` is the total.
    pub nodes: Vec<(Option<u32>, u64)>,
    /// `(key, count)` pairs.
    pub relationships: Vec<(RelationshipCountKey, u64)>,
}

impl CountsStore {
    /// Folds a worker's node counts in.
    pub fn add_node_counts(&self, counts: &NodeCounts) {
        let mut nodes = self.nodes.lock();
        for (key, count) in counts {
            *nodes.entry(*key).or_default() += count;
        }
    }

    /// Folds a worker's relationship counts in.
    pub fn add_relationship_counts(&self, counts: &RelationshipCounts) {
        let mut rels = self.relationships.lock();
        for (key, count) in counts {
            *rels.entry(*key).or_default() += count;
        }
    }

    /// Nodes carrying `label`, or all nodes for `None`.
    pub fn node_count(&self, label: Option<u32>) -> u64 {
        self.nodes.lock().get(&label).copied().unwrap_or(0)
    }

    /// Relationships matching the key.
    pub fn relationship_count(
        &self,
        start_label: Option<u32>,
        type_id: Option<u32>,
        end_label: Option<u32>,
    ) -> u64 {
        let key = RelationshipCountKey {
            start_label,
            type_id,
            end_label,
        };
        self.relationships.lock().get(&key).copied().unwrap_or(0)
    }

    /// Sorted copy of all counts.
    pub fn snapshot(&self) -> CountsSnapshot {
        let mut nodes: Vec<_> = self.nodes.lock().iter().map(|(k, v)| (*k, *v)).collect();
        nodes.sort();
        let mut relationships: Vec<_> = self
            .relationships
            .lock()
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        relationships.sort();
        CountsSnapshot {
            nodes,
            relationships,
        }
    }
}

/// Token to entity index, e.g. label to node ids.
#[derive(Default)]
pub struct TokenIndex {
    entries: Mutex<BTreeMap<u32, Vec<u64>>>,
}

impl TokenIndex {
    /// Adds entity ids under `token`.
    pub fn add(&self, token: u32, ids: &[u64]) {
        if ids.is_empty() {
            return;
        }
        self.entries
            .lock()
            .entry(token)
            .or_default()
            .extend_from_slice(ids);
    }

    /// Sorted entity ids under `token`.
    pub fn entities(&self, token: u32) -> Vec<u64> {
        let mut ids = self
            .entries
            .lock()
            .get(&token)
            .cloned()
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Sorted copy of the whole index.
    pub fn snapshot(&self) -> BTreeMap<u32, Vec<u64>> {
        let mut entries = self.entries.lock().clone();
        for ids in entries.values_mut() {
            ids.sort_unstable();
        }
        entries
    }
}
