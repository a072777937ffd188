//! Per-node degree and relationship chain state used while linking relationships.
//!
//! The cache goes through two phases. While counting, [`NodeRelationshipCache::increment_count`]
//! accumulates degrees under striped locks. Once counting completes nodes are
//! classified dense (degree at or above the threshold, or explicitly marked) or
//! sparse, and linking scans call [`NodeRelationshipCache::get_and_put_relationship`]
//! to swap chain heads. Sparse nodes keep a single relationship pointer; dense
//! nodes point at a chain of group entries, one per relationship type linked in
//! the current round.
//!
//! Change tracking avoids clearing the whole cache between the forward and the
//! backward scan: a node's change bit is "set" during a forward scan and
//! "cleared" during a backward scan, so flipping it means "first visit in this
//! scan".

use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::types::{Direction, ImportError, Result, TypeId, MAX_RELATIONSHIP_ID, NULL_REF};

/// Marker for "no relationship" / "no group entry" in cache slots.
pub const EMPTY: u64 = NULL_REF;

const COUNT_MASK: u32 = 0x0FFF_FFFF;
const DENSE_CHANGED: u32 = 0x8000_0000;
const SPARSE_CHANGED: u32 = 0x4000_0000;
const BIG_COUNT: u32 = 0x2000_0000;
const EXPLICITLY_DENSE: u32 = 0x1000_0000;

const LOCK_STRIPES: usize = 1024;
const LOCK_MASK: u64 = (LOCK_STRIPES - 1) as u64;

/// Nodes per change-tracking chunk.
pub const CHUNK_SIZE: u64 = 1_000_000;
const CHUNK_SPARSE: u8 = 0b01;
const CHUNK_DENSE: u8 = 0b10;

/// Which nodes an operation applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NodeType(u8);

impl NodeType {
    /// Sparse nodes only.
    pub const SPARSE: NodeType = NodeType(0b01);
    /// Dense nodes only.
    pub const DENSE: NodeType = NodeType(0b10);
    /// Every node.
    pub const ALL: NodeType = NodeType(0b11);

    /// Includes sparse nodes.
    pub fn includes_sparse(self) -> bool {
        self.0 & Self::SPARSE.0 != 0
    }

    /// Includes dense nodes.
    pub fn includes_dense(self) -> bool {
        self.0 & Self::DENSE.0 != 0
    }

    /// Whether a node with the given density matches.
    pub fn matches(self, dense: bool) -> bool {
        if dense {
            self.includes_dense()
        } else {
            self.includes_sparse()
        }
    }
}

/// Chain state of one (dense node, relationship type) pair.
struct GroupEntry {
    type_id: AtomicU32,
    next: AtomicU64,
    heads: [AtomicU64; 3],
    counts: [AtomicU32; 3],
}

impl GroupEntry {
    fn empty() -> Self {
        Self {
            type_id: AtomicU32::new(u32::MAX),
            next: AtomicU64::new(EMPTY),
            heads: [
                AtomicU64::new(EMPTY),
                AtomicU64::new(EMPTY),
                AtomicU64::new(EMPTY),
            ],
            counts: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
        }
    }

    fn reset(&self, type_id: u32) {
        self.type_id.store(type_id, Ordering::Relaxed);
        self.next.store(EMPTY, Ordering::Relaxed);
        for (head, count) in self.heads.iter().zip(&self.counts) {
            head.store(EMPTY, Ordering::Relaxed);
            count.store(0, Ordering::Relaxed);
        }
    }
}

/// Bytes one group entry occupies; the unit of linking memory admission.
pub const GROUP_ENTRY_SIZE: u64 = size_of::<GroupEntry>() as u64;

/// Read-only view of a group entry handed to group visitors.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GroupView {
    /// Relationship type.
    pub type_id: u32,
    /// Chain heads indexed by [`Direction::index`].
    pub heads: [u64; 3],
    /// Chain lengths indexed by [`Direction::index`].
    pub counts: [u32; 3],
}

#[derive(Default)]
struct RelGroupCache {
    entries: Vec<GroupEntry>,
    next_free: AtomicU64,
}

impl RelGroupCache {
    fn with_capacity(entries: usize) -> Self {
        Self {
            entries: (0..entries).map(|_| GroupEntry::empty()).collect(),
            next_free: AtomicU64::new(0),
        }
    }

    fn allocate(&self, type_id: u32) -> Result<u64> {
        let index = self.next_free.fetch_add(1, Ordering::Relaxed);
        let entry = self.entries.get(index as usize).ok_or_else(|| {
            ImportError::invalid(format!(
                "relationship group cache capacity {} exceeded",
                self.entries.len()
            ))
        })?;
        entry.reset(type_id);
        Ok(index)
    }

    fn entry(&self, index: u64) -> Result<&GroupEntry> {
        self.entries
            .get(index as usize)
            .ok_or_else(|| ImportError::corruption(format!("group entry {index} out of bounds")))
    }

    fn find_or_allocate(&self, first: u64, type_id: u32) -> Result<u64> {
        let mut index = first;
        loop {
            let entry = self.entry(index)?;
            if entry.type_id.load(Ordering::Relaxed) == type_id {
                return Ok(index);
            }
            let next = entry.next.load(Ordering::Relaxed);
            if next == EMPTY {
                let allocated = self.allocate(type_id)?;
                entry.next.store(allocated, Ordering::Relaxed);
                return Ok(allocated);
            }
            index = next;
        }
    }

    fn find(&self, first: u64, type_id: u32) -> Result<Option<&GroupEntry>> {
        let mut index = first;
        while index != EMPTY {
            let entry = self.entry(index)?;
            if entry.type_id.load(Ordering::Relaxed) == type_id {
                return Ok(Some(entry));
            }
            index = entry.next.load(Ordering::Relaxed);
        }
        Ok(None)
    }

    fn clear_relationship_ids(&self) {
        let used = (self.next_free.load(Ordering::Relaxed) as usize).min(self.entries.len());
        for entry in &self.entries[..used] {
            for head in &entry.heads {
                head.store(EMPTY, Ordering::Relaxed);
            }
        }
    }

    fn used(&self) -> u64 {
        self.next_free
            .load(Ordering::Relaxed)
            .min(self.entries.len() as u64)
    }
}

/// Degree and chain-head cache for every node of the import.
pub struct NodeRelationshipCache {
    dense_threshold: u32,
    ids: Vec<AtomicU64>,
    counts: Vec<AtomicU32>,
    big_counts: Mutex<FxHashMap<u64, u64>>,
    locks: Vec<Mutex<()>>,
    chunk_changed: Vec<AtomicU8>,
    groups: RelGroupCache,
    forward: AtomicBool,
    dense_nodes: u64,
    counting_completed: bool,
}

impl NodeRelationshipCache {
    /// Creates an empty cache; call [`Self::set_node_count`] before use.
    pub fn new(dense_threshold: u32) -> Self {
        Self {
            dense_threshold,
            ids: Vec::new(),
            counts: Vec::new(),
            big_counts: Mutex::new(FxHashMap::default()),
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            chunk_changed: Vec::new(),
            groups: RelGroupCache::default(),
            forward: AtomicBool::new(true),
            dense_nodes: 0,
            counting_completed: false,
        }
    }

    /// Bytes per node the cache needs, for memory estimation up front.
    pub fn memory_estimation(node_count: u64) -> u64 {
        node_count * (size_of::<AtomicU64>() + size_of::<AtomicU32>()) as u64
            + node_count.div_ceil(CHUNK_SIZE)
    }

    /// Worst-case group cache bytes to link `relationships` of one type across `dense_nodes`.
    ///
    /// A type with `r` relationships touches at most `2r` nodes, so it cannot
    /// need more group entries than `min(dense_nodes, 2r)`.
    pub fn calculate_max_memory_usage(dense_nodes: u64, relationships: u64) -> u64 {
        dense_nodes.min(relationships.saturating_mul(2)) * GROUP_ENTRY_SIZE
    }

    /// Allocates per-node slots for `node_count` nodes.
    pub fn set_node_count(&mut self, node_count: u64) -> Result<()> {
        let len = usize::try_from(node_count)
            .map_err(|_| ImportError::invalid(format!("node count {node_count} too large")))?;
        self.ids = (0..len).map(|_| AtomicU64::new(EMPTY)).collect();
        self.counts = (0..len).map(|_| AtomicU32::new(0)).collect();
        self.chunk_changed = (0..node_count.div_ceil(CHUNK_SIZE))
            .map(|_| AtomicU8::new(0))
            .collect();
        self.big_counts.lock().clear();
        self.dense_nodes = 0;
        self.counting_completed = false;
        debug!(node_count, "cache.node_count");
        Ok(())
    }

    /// Number of nodes the cache was sized for.
    pub fn node_count(&self) -> u64 {
        self.ids.len() as u64
    }

    /// Dense threshold.
    pub fn dense_threshold(&self) -> u32 {
        self.dense_threshold
    }

    fn slot(&self, node: u64) -> Result<usize> {
        if node >= self.ids.len() as u64 {
            return Err(ImportError::invalid(format!(
                "node {node} outside cache of {} nodes",
                self.ids.len()
            )));
        }
        Ok(node as usize)
    }

    /// Adds one to the degree of `node`. Safe to call from many threads.
    pub fn increment_count(&self, node: u64) -> Result<()> {
        let slot = self.slot(node)?;
        let _stripe = self.locks[(node & LOCK_MASK) as usize].lock();
        let cell = &self.counts[slot];
        let bits = cell.load(Ordering::Relaxed);
        if bits & BIG_COUNT != 0 {
            *self.big_counts.lock().entry(node).or_default() += 1;
            return Ok(());
        }
        let count = bits & COUNT_MASK;
        if count == COUNT_MASK {
            self.big_counts.lock().insert(node, count as u64 + 1);
            cell.store((bits & !COUNT_MASK) | BIG_COUNT, Ordering::Relaxed);
        } else {
            cell.store((bits & !COUNT_MASK) | (count + 1), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Forces `node` to be treated as dense regardless of its degree.
    ///
    /// Must be called before [`NodeRelationshipCache::counting_completed`]. Safe to
    /// interleave with [`NodeRelationshipCache::increment_count`].
    pub fn mark_as_explicitly_dense(&self, node: u64) -> Result<()> {
        let slot = self.slot(node)?;
        let _stripe = self.locks[(node & LOCK_MASK) as usize].lock();
        self.counts[slot].fetch_or(EXPLICITLY_DENSE, Ordering::Relaxed);
        Ok(())
    }

    fn degree_of(&self, slot: usize, bits: u32) -> u64 {
        if bits & BIG_COUNT != 0 {
            self.big_counts
                .lock()
                .get(&(slot as u64))
                .copied()
                .unwrap_or(0)
        } else {
            (bits & COUNT_MASK) as u64
        }
    }

    /// Total degree of `node`; a loop counts once.
    pub fn degree(&self, node: u64) -> Result<u64> {
        let slot = self.slot(node)?;
        Ok(self.degree_of(slot, self.counts[slot].load(Ordering::Relaxed)))
    }

    fn is_dense_bits(&self, slot: usize, bits: u32) -> bool {
        bits & EXPLICITLY_DENSE != 0 || self.degree_of(slot, bits) >= self.dense_threshold as u64
    }

    /// Whether `node` is dense: explicitly marked, or degree at or above the threshold.
    pub fn is_dense(&self, node: u64) -> Result<bool> {
        let slot = self.slot(node)?;
        Ok(self.is_dense_bits(slot, self.counts[slot].load(Ordering::Relaxed)))
    }

    /// Ends the counting phase and classifies nodes.
    pub fn counting_completed(&mut self) {
        let mut dense = 0;
        for slot in 0..self.counts.len() {
            if self.is_dense_bits(slot, self.counts[slot].load(Ordering::Relaxed)) {
                dense += 1;
            }
        }
        self.dense_nodes = dense;
        self.counting_completed = true;
        debug!(dense_nodes = dense, threshold = self.dense_threshold, "cache.counting_completed");
    }

    /// Dense nodes found by [`Self::counting_completed`].
    pub fn number_of_dense_nodes(&self) -> u64 {
        self.dense_nodes
    }

    /// Sizes the group cache for the next linking round.
    pub fn set_group_capacity(&mut self, entries: u64) -> Result<()> {
        let entries = usize::try_from(entries)
            .map_err(|_| ImportError::invalid("group cache capacity too large"))?;
        self.groups = RelGroupCache::with_capacity(entries);
        Ok(())
    }

    /// Switches between forward and backward scanning.
    ///
    /// Going forward with `dense_nodes` discards the group entries of the previous
    /// round. Going backward keeps entries and counts but clears chain heads so
    /// the backward scan can rebuild `prev` pointers.
    pub fn set_forward_scan(&mut self, forward: bool, dense_nodes: bool) {
        if *self.forward.get_mut() == forward {
            return;
        }
        if dense_nodes {
            if forward {
                for (chunk, flags) in self.chunk_changed.iter().enumerate() {
                    if flags.load(Ordering::Relaxed) & CHUNK_DENSE == 0 {
                        continue;
                    }
                    let from = chunk as u64 * CHUNK_SIZE;
                    let to = (from + CHUNK_SIZE).min(self.ids.len() as u64);
                    for slot in from as usize..to as usize {
                        if self.is_dense_bits(slot, self.counts[slot].load(Ordering::Relaxed)) {
                            self.ids[slot].store(EMPTY, Ordering::Relaxed);
                        }
                    }
                    flags.fetch_and(!CHUNK_DENSE, Ordering::Relaxed);
                }
                self.groups = RelGroupCache::default();
            } else {
                self.groups.clear_relationship_ids();
            }
        }
        *self.forward.get_mut() = forward;
        debug!(forward, dense_nodes, "cache.scan_direction");
    }

    /// Whether the cache is in forward scan mode.
    pub fn is_forward_scan(&self) -> bool {
        self.forward.load(Ordering::Relaxed)
    }

    /// Flips the change bit selected by `mask`; true when this is the first visit of the scan.
    fn mark_as_changed(&self, slot: usize, mask: u32) -> bool {
        let forward = self.forward.load(Ordering::Relaxed);
        let bits = self.counts[slot].load(Ordering::Relaxed);
        let flipped = (bits & mask != 0) != forward;
        if flipped {
            self.counts[slot].fetch_xor(mask, Ordering::Relaxed);
        }
        flipped
    }

    fn mark_chunk_as_changed(&self, node: u64, dense: bool) {
        let mask = if dense { CHUNK_DENSE } else { CHUNK_SPARSE };
        let chunk = &self.chunk_changed[(node / CHUNK_SIZE) as usize];
        if chunk.load(Ordering::Relaxed) & mask == 0 {
            chunk.fetch_or(mask, Ordering::Relaxed);
        }
    }

    /// Makes `rel` the new head of the chain of `node` and returns the previous head.
    ///
    /// For a dense node the chain is the one of `type_id` in `direction`, and
    /// `increment_count` also counts the relationship in that chain. For a sparse
    /// node the first visit in a scan returns [`EMPTY`].
    ///
    /// Callers must not touch the same node from two threads at once.
    pub fn get_and_put_relationship(
        &self,
        node: u64,
        type_id: TypeId,
        direction: Direction,
        rel: u64,
        increment_count: bool,
    ) -> Result<u64> {
        if rel > MAX_RELATIONSHIP_ID {
            return Err(ImportError::invalid(format!(
                "relationship id {rel} exceeds {MAX_RELATIONSHIP_ID}"
            )));
        }
        let slot = self.slot(node)?;
        let dense = self.is_dense_bits(slot, self.counts[slot].load(Ordering::Relaxed));
        let first_visit = self.mark_as_changed(slot, if dense { DENSE_CHANGED } else { SPARSE_CHANGED });
        self.mark_chunk_as_changed(node, dense);
        if dense {
            let mut first = self.ids[slot].load(Ordering::Relaxed);
            if first == EMPTY {
                first = self.groups.allocate(type_id.0)?;
                self.ids[slot].store(first, Ordering::Relaxed);
            }
            let index = self.groups.find_or_allocate(first, type_id.0)?;
            let entry = self.groups.entry(index)?;
            let previous = entry.heads[direction.index()].swap(rel, Ordering::Relaxed);
            if increment_count {
                entry.counts[direction.index()].fetch_add(1, Ordering::Relaxed);
            }
            return Ok(previous);
        }
        let existing = self.ids[slot].swap(rel, Ordering::Relaxed);
        Ok(if first_visit { EMPTY } else { existing })
    }

    /// Length of the chain a relationship of `node` belongs to.
    ///
    /// Sparse nodes have a single chain holding their whole degree.
    pub fn get_count(&self, node: u64, type_id: TypeId, direction: Direction) -> Result<u64> {
        let slot = self.slot(node)?;
        let bits = self.counts[slot].load(Ordering::Relaxed);
        if !self.is_dense_bits(slot, bits) {
            return Ok(self.degree_of(slot, bits));
        }
        let first = self.ids[slot].load(Ordering::Relaxed);
        if first == EMPTY {
            return Ok(0);
        }
        Ok(self
            .groups
            .find(first, type_id.0)?
            .map(|entry| entry.counts[direction.index()].load(Ordering::Relaxed) as u64)
            .unwrap_or(0))
    }

    /// First relationship of a sparse node, or [`EMPTY`].
    pub fn first_relationship(&self, node: u64) -> Result<u64> {
        let slot = self.slot(node)?;
        Ok(self.ids[slot].load(Ordering::Relaxed))
    }

    /// Visits the group entries of a dense node that hold at least one chain head.
    pub fn visit_groups(&self, node: u64, mut visitor: impl FnMut(GroupView) -> Result<()>) -> Result<()> {
        let slot = self.slot(node)?;
        let mut index = self.ids[slot].load(Ordering::Relaxed);
        while index != EMPTY {
            let entry = self.groups.entry(index)?;
            let heads = [
                entry.heads[0].load(Ordering::Relaxed),
                entry.heads[1].load(Ordering::Relaxed),
                entry.heads[2].load(Ordering::Relaxed),
            ];
            if heads.iter().any(|h| *h != EMPTY) {
                visitor(GroupView {
                    type_id: entry.type_id.load(Ordering::Relaxed),
                    heads,
                    counts: [
                        entry.counts[0].load(Ordering::Relaxed),
                        entry.counts[1].load(Ordering::Relaxed),
                        entry.counts[2].load(Ordering::Relaxed),
                    ],
                })?;
            }
            index = entry.next.load(Ordering::Relaxed);
        }
        Ok(())
    }

    /// Visits nodes of `node_types` in `[from, to)` changed by the current forward scan.
    ///
    /// The visitor gets the node id and its relationship or group-entry pointer.
    pub fn visit_changed_nodes(
        &self,
        node_types: NodeType,
        from: u64,
        to: u64,
        mut visitor: impl FnMut(u64, u64) -> Result<()>,
    ) -> Result<()> {
        let forward = self.forward.load(Ordering::Relaxed);
        let to = to.min(self.ids.len() as u64);
        let mut node = from;
        while node < to {
            let chunk = node / CHUNK_SIZE;
            let chunk_end = ((chunk + 1) * CHUNK_SIZE).min(to);
            let flags = self.chunk_changed[chunk as usize].load(Ordering::Relaxed);
            let chunk_relevant = (node_types.includes_dense() && flags & CHUNK_DENSE != 0)
                || (node_types.includes_sparse() && flags & CHUNK_SPARSE != 0);
            if !chunk_relevant {
                node = chunk_end;
                continue;
            }
            while node < chunk_end {
                let slot = node as usize;
                let bits = self.counts[slot].load(Ordering::Relaxed);
                let dense = self.is_dense_bits(slot, bits);
                let mask = if dense { DENSE_CHANGED } else { SPARSE_CHANGED };
                let changed = (bits & mask != 0) == forward;
                let id = self.ids[slot].load(Ordering::Relaxed);
                if changed && id != EMPTY && node_types.matches(dense) {
                    visitor(node, id)?;
                }
                node += 1;
            }
        }
        Ok(())
    }

    /// Group entries allocated in the current round.
    pub fn group_entries_in_use(&self) -> u64 {
        self.groups.used()
    }

    /// Bytes currently held by the cache.
    pub fn memory_usage(&self) -> u64 {
        self.ids.len() as u64 * size_of::<AtomicU64>() as u64
            + self.counts.len() as u64 * size_of::<AtomicU32>() as u64
            + self.chunk_changed.len() as u64
            + self.groups.entries.len() as u64 * GROUP_ENTRY_SIZE
            + self.big_counts.lock().len() as u64 * 16
    }

    /// Releases all memory.
    pub fn close(&mut self) {
        self.ids = Vec::new();
        self.counts = Vec::new();
        self.chunk_changed = Vec::new();
        self.groups = RelGroupCache::default();
        self.big_counts.lock().clear();
    }

    /// Whether degree counting has completed.
    pub fn is_counting_completed(&self) -> bool {
        self.counting_completed
    }
}

/// Greedily picks the relationship types to link in one round.
///
/// `types` are `(type, relationship count)` pairs ordered by descending count.
/// Starting at `from`, types are admitted while their cumulative worst-case
/// group cache memory stays within `free_memory`. The first type of a round is
/// always admitted, so every call makes progress. Returns the exclusive end index
/// and the number of group entries the admitted types may need.
pub fn next_set_of_types_that_fit_in_memory(
    types: &[(TypeId, u64)],
    from: usize,
    free_memory: u64,
    dense_nodes: u64,
) -> (usize, u64) {
    let mut used = 0u64;
    let mut entries = 0u64;
    let mut to = from;
    while to < types.len() {
        let relationships = types[to].1;
        let cost = NodeRelationshipCache::calculate_max_memory_usage(dense_nodes, relationships);
        if to > from && used.saturating_add(cost) > free_memory {
            break;
        }
        used = used.saturating_add(cost);
        entries += dense_nodes.min(relationships.saturating_mul(2));
        to += 1;
    }
    (to, entries)
}
