//! Bounded cache used to rewrite relationship groups owner by owner.
//!
//! Linking writes groups in the order types are linked, so the groups of one
//! node end up scattered over the scratch store. Defragmentation counts groups
//! per owner, then repeatedly selects the widest node range whose groups fit in
//! memory, caches them sorted by type while scanning the scratch store
//! backwards, and writes them out consecutively.

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use crate::storage::RelationshipGroupRecord;
use crate::types::{ImportError, Result, NULL_REF};

/// Not yet seen in the current reverse scan.
const UNSEEN: u64 = NULL_REF - 1;

/// Group data kept per cached slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachedGroup {
    /// Relationship type.
    pub type_id: u32,
    /// Chain heads indexed by direction.
    pub first: [u64; 3],
}

const CACHED_GROUP_SIZE: u64 = size_of::<CachedGroup>() as u64;

/// Per-owner group counts plus a window of cached groups.
pub struct RelationshipGroupCache {
    group_counts: Vec<AtomicU32>,
    capacity: u64,
    from: u64,
    to: u64,
    offsets: Vec<usize>,
    filled: Vec<u32>,
    expected_next: Vec<u64>,
    slots: Vec<CachedGroup>,
}

impl RelationshipGroupCache {
    /// Creates a cache for `node_count` owners allowed to hold `max_memory` bytes of groups.
    pub fn new(node_count: u64, max_memory: u64) -> Result<Self> {
        let len = usize::try_from(node_count)
            .map_err(|_| ImportError::invalid(format!("node count {node_count} too large")))?;
        Ok(Self {
            group_counts: (0..len).map(|_| AtomicU32::new(0)).collect(),
            capacity: (max_memory / CACHED_GROUP_SIZE).max(1),
            from: 0,
            to: 0,
            offsets: Vec::new(),
            filled: Vec::new(),
            expected_next: Vec::new(),
            slots: Vec::new(),
        })
    }

    /// Counts one group owned by `owner`. Safe to call from many threads.
    pub fn increment_group_count(&self, owner: u64) -> Result<()> {
        let counter = self.group_counts.get(owner as usize).ok_or_else(|| {
            ImportError::corruption(format!("group owner {owner} is not a node"))
        })?;
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Groups counted for `owner`.
    pub fn group_count(&self, owner: u64) -> u32 {
        self.group_counts
            .get(owner as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Number of owners tracked.
    pub fn node_count(&self) -> u64 {
        self.group_counts.len() as u64
    }

    /// Selects the owners `[from, to)` whose groups fit in the cache and returns `to`.
    ///
    /// At least one owner with groups is always selected, even if its groups
    /// alone exceed the capacity.
    pub fn prepare(&mut self, from: u64) -> u64 {
        let nodes = self.node_count();
        let mut to = from;
        let mut total = 0u64;
        while to < nodes {
            let count = self.group_count(to) as u64;
            if total > 0 && total + count > self.capacity {
                break;
            }
            total += count;
            to += 1;
        }
        let width = (to - from) as usize;
        self.from = from;
        self.to = to;
        self.offsets.clear();
        self.offsets.reserve(width + 1);
        let mut offset = 0usize;
        for node in from..to {
            self.offsets.push(offset);
            offset += self.group_count(node) as usize;
        }
        self.offsets.push(offset);
        self.filled = vec![0; width];
        self.expected_next = vec![UNSEEN; width];
        self.slots = vec![
            CachedGroup {
                type_id: u32::MAX,
                first: [NULL_REF; 3],
            };
            offset
        ];
        debug!(from, to, groups = offset, "group_cache.prepare");
        to
    }

    /// Caches `group` if its owner is in the prepared range.
    ///
    /// Groups must arrive in descending id order. Each owner's chain must be
    /// strictly decreasing and visit exactly the groups that were counted.
    pub fn put(&mut self, group: &RelationshipGroupRecord) -> Result<bool> {
        if group.owner < self.from || group.owner >= self.to {
            return Ok(false);
        }
        let index = (group.owner - self.from) as usize;
        let expected = self.expected_next[index];
        if expected != UNSEEN && expected != group.id {
            return Err(ImportError::corruption(format!(
                "group chain of node {} expected group {expected}, found {}",
                group.owner, group.id
            )));
        }
        if group.next != NULL_REF && group.next >= group.id {
            return Err(ImportError::corruption(format!(
                "group {} of node {} points forward to {}",
                group.id, group.owner, group.next
            )));
        }
        self.expected_next[index] = group.next;

        let start = self.offsets[index];
        let capacity = self.offsets[index + 1] - start;
        let filled = self.filled[index] as usize;
        if filled >= capacity {
            return Err(ImportError::corruption(format!(
                "node {} has more groups than the {capacity} counted",
                group.owner
            )));
        }
        let region = &mut self.slots[start..start + filled + 1];
        let position = match region[..filled].binary_search_by_key(&group.type_id, |g| g.type_id) {
            Ok(_) => {
                return Err(ImportError::corruption(format!(
                    "node {} has two groups of type {}",
                    group.owner, group.type_id
                )))
            }
            Err(position) => position,
        };
        region.copy_within(position..filled, position + 1);
        region[position] = CachedGroup {
            type_id: group.type_id,
            first: group.first,
        };
        self.filled[index] += 1;
        Ok(true)
    }

    /// Verifies that every chain of the range was seen completely.
    pub fn verify_range(&self) -> Result<()> {
        for (index, node) in (self.from..self.to).enumerate() {
            let expected = self.expected_next[index];
            if expected != UNSEEN && expected != NULL_REF {
                return Err(ImportError::corruption(format!(
                    "group chain of node {node} is missing group {expected}"
                )));
            }
            let counted = self.offsets[index + 1] - self.offsets[index];
            if self.filled[index] as usize != counted {
                return Err(ImportError::corruption(format!(
                    "node {node} has {} groups cached, {counted} counted",
                    self.filled[index]
                )));
            }
        }
        Ok(())
    }

    /// Owners of the prepared range with their groups sorted by type.
    pub fn groups(&self) -> impl Iterator<Item = (u64, &[CachedGroup])> + '_ {
        (self.from..self.to).enumerate().filter_map(move |(index, node)| {
            let start = self.offsets[index];
            let end = start + self.filled[index] as usize;
            (end > start).then(|| (node, &self.slots[start..end]))
        })
    }

    /// Bytes held by counts and the cached window.
    pub fn memory_usage(&self) -> u64 {
        self.group_counts.len() as u64 * size_of::<AtomicU32>() as u64
            + self.slots.len() as u64 * CACHED_GROUP_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: u64, owner: u64, type_id: u32, next: u64) -> RelationshipGroupRecord {
        RelationshipGroupRecord {
            id,
            in_use: true,
            type_id,
            owner,
            next,
            first: [id * 10, NULL_REF, NULL_REF],
        }
    }

    #[test]
    fn ranges_respect_capacity_but_always_progress() {
        let mut cache = RelationshipGroupCache::new(4, CACHED_GROUP_SIZE * 2).unwrap();
        for owner in [0, 0, 1, 2, 2, 2] {
            cache.increment_group_count(owner).unwrap();
        }
        assert_eq!(cache.prepare(0), 1);
        assert_eq!(cache.prepare(1), 2);
        assert_eq!(cache.prepare(2), 3);
        assert_eq!(cache.prepare(3), 4);
    }

    #[test]
    fn groups_are_sorted_by_type() -> Result<()> {
        let mut cache = RelationshipGroupCache::new(2, 1 << 20)?;
        for _ in 0..3 {
            cache.increment_group_count(1)?;
        }
        cache.prepare(0);
        // Written in order 0 (type 5), 1 (type 2), 2 (type 9), each pointing at the previous.
        assert!(cache.put(&group(2, 1, 9, 1))?);
        assert!(cache.put(&group(1, 1, 2, 0))?);
        assert!(cache.put(&group(0, 1, 5, NULL_REF))?);
        cache.verify_range()?;
        let cached: Vec<_> = cache.groups().collect();
        assert_eq!(cached.len(), 1);
        let types: Vec<u32> = cached[0].1.iter().map(|g| g.type_id).collect();
        assert_eq!(types, vec![2, 5, 9]);
        Ok(())
    }

    #[test]
    fn broken_chains_are_corruption() -> Result<()> {
        let mut cache = RelationshipGroupCache::new(1, 1 << 20)?;
        cache.increment_group_count(0)?;
        cache.increment_group_count(0)?;
        cache.prepare(0);
        cache.put(&group(5, 0, 1, 2))?;
        let err = cache.put(&group(3, 0, 2, NULL_REF)).unwrap_err();
        assert!(matches!(err, ImportError::Corruption(_)));
        Ok(())
    }

    #[test]
    fn duplicate_types_are_corruption() -> Result<()> {
        let mut cache = RelationshipGroupCache::new(1, 1 << 20)?;
        cache.increment_group_count(0)?;
        cache.increment_group_count(0)?;
        cache.prepare(0);
        cache.put(&group(1, 0, 4, 0))?;
        assert!(cache.put(&group(0, 0, 4, NULL_REF)).is_err());
        Ok(())
    }

    #[test]
    fn missing_tail_is_detected() -> Result<()> {
        let mut cache = RelationshipGroupCache::new(1, 1 << 20)?;
        cache.increment_group_count(0)?;
        cache.increment_group_count(0)?;
        cache.prepare(0);
        cache.put(&group(1, 0, 4, 0))?;
        assert!(cache.verify_range().is_err());
        Ok(())
    }
}
