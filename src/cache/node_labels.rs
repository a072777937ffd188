use std::mem::size_of;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::types::{ImportError, Result};

type Labels = SmallVec<[u32; 2]>;

/// Label ids per node, filled once while scanning nodes and read while counting relationships.
pub struct NodeLabelsCache {
    labels: RwLock<Vec<Labels>>,
}

impl NodeLabelsCache {
    /// Creates an empty cache for `node_count` nodes.
    pub fn new(node_count: u64) -> Result<Self> {
        let len = usize::try_from(node_count)
            .map_err(|_| ImportError::invalid(format!("node count {node_count} too large")))?;
        Ok(Self {
            labels: RwLock::new(vec![Labels::new(); len]),
        })
    }

    /// Bytes needed for `node_count` nodes with few labels each.
    pub fn memory_estimation(node_count: u64) -> u64 {
        node_count * size_of::<Labels>() as u64
    }

    /// Stores the labels of a batch of nodes.
    pub fn put_all<'a>(&self, entries: impl IntoIterator<Item = (u64, &'a [u32])>) -> Result<()> {
        let mut labels = self.labels.write();
        for (node, node_labels) in entries {
            let slot = labels.get_mut(node as usize).ok_or_else(|| {
                ImportError::invalid(format!("node {node} outside label cache"))
            })?;
            *slot = node_labels.iter().copied().collect();
        }
        Ok(())
    }

    /// Labels of `node`, empty for unknown nodes.
    pub fn get(&self, node: u64) -> Labels {
        self.labels
            .read()
            .get(node as usize)
            .cloned()
            .unwrap_or_default()
    }

    /// Approximate bytes held.
    pub fn memory_usage(&self) -> u64 {
        let labels = self.labels.read();
        labels.len() as u64 * size_of::<Labels>() as u64
            + labels
                .iter()
                .filter(|l| l.spilled())
                .map(|l| (l.capacity() * 4) as u64)
                .sum::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_returns_labels() -> Result<()> {
        let cache = NodeLabelsCache::new(3)?;
        cache.put_all([(0, &[1u32, 2][..]), (2, &[7, 8, 9][..])])?;
        assert_eq!(cache.get(0).as_slice(), &[1, 2]);
        assert!(cache.get(1).is_empty());
        assert_eq!(cache.get(2).as_slice(), &[7, 8, 9]);
        assert!(cache.get(10).is_empty());
        assert!(cache.put_all([(3, &[1u32][..])]).is_err());
        Ok(())
    }
}
