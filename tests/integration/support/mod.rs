//! Helpers shared by the import integration tests.
#![allow(dead_code)]

use sombra_import::{
    import::{BadCollector, ImportReport},
    input::Input,
    staging::SilentMonitor,
    storage::{BatchingStores, NodeRecord, RecordFormat, RelationshipGroupRecord, RelationshipRecord},
    types::{Direction, Result, NULL_REF},
    batch_importer, ImportConfig,
};

/// Small batches and few workers so that tiny inputs still cross batch boundaries.
pub fn test_config() -> ImportConfig {
    ImportConfig::default()
        .batch_size(3)
        .max_processors(3)
        .id_batch_size(4)
}

/// Runs a whole import into memory.
pub fn import(input: &dyn Input, config: ImportConfig) -> Result<(BatchingStores, BadCollector, ImportReport)> {
    let stores = BatchingStores::in_memory()?;
    let collector = BadCollector::new(config.bad_tolerance, 1_000);
    let report = batch_importer(config).do_import(input, &stores, &collector, &SilentMonitor)?;
    Ok((stores, collector, report))
}

/// Every in-use record of a store.
pub fn live_records<R: RecordFormat>(store: &sombra_import::storage::RecordStore<R>) -> Result<Vec<R>> {
    let mut records = Vec::new();
    store.read_records(0, store.high_id() as usize, &mut records)?;
    records.retain(|r| r.in_use());
    Ok(records)
}

/// Node record `id`.
pub fn node(stores: &BatchingStores, id: u64) -> Result<NodeRecord> {
    stores.nodes().get_record(id)
}

/// Groups of a dense node, following the final group chain.
pub fn groups_of(stores: &BatchingStores, node: &NodeRecord) -> Result<Vec<RelationshipGroupRecord>> {
    let mut groups = Vec::new();
    let mut next = node.next_rel;
    while node.dense && next != NULL_REF {
        let group = stores.groups().get_record(next)?;
        assert!(group.in_use, "group {next} of node {} is not in use", node.id);
        assert_eq!(group.owner, node.id);
        next = group.next;
        groups.push(group);
    }
    Ok(groups)
}

/// Relationship ids of one chain, following `next` pointers from `head`.
pub fn walk_next(stores: &BatchingStores, node: u64, head: u64) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    let mut next = head;
    while next != NULL_REF {
        let rel = stores.relationships().get_record(next)?;
        assert!(rel.in_use, "relationship {next} in chain of node {node} is not in use");
        ids.push(rel.id);
        next = rel.next_for(node);
    }
    Ok(ids)
}

/// Relationship ids of one chain, following `prev` pointers from `tail` up to the chain head.
pub fn walk_prev(stores: &BatchingStores, node: u64, tail: u64) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    let mut current = tail;
    loop {
        let rel: RelationshipRecord = stores.relationships().get_record(current)?;
        ids.push(rel.id);
        if rel.first_in_chain_for(node) {
            return Ok(ids);
        }
        current = rel.prev_for(node);
    }
}

/// Heads of every chain of `node`: one for a sparse node, one per group and direction for a dense node.
pub fn chain_heads(stores: &BatchingStores, node: &NodeRecord) -> Result<Vec<u64>> {
    if !node.dense {
        return Ok(if node.next_rel == NULL_REF { Vec::new() } else { vec![node.next_rel] });
    }
    let mut heads = Vec::new();
    for group in groups_of(stores, node)? {
        for direction in [Direction::Outgoing, Direction::Incoming, Direction::Loop] {
            let head = group.first(direction);
            if head != NULL_REF {
                heads.push(head);
            }
        }
    }
    Ok(heads)
}

/// All relationship ids reachable from `node`, sorted.
pub fn relationships_of(stores: &BatchingStores, node: &NodeRecord) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for head in chain_heads(stores, node)? {
        ids.extend(walk_next(stores, node.id, head)?);
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Relationship ids touching `node`, found by scanning the whole store.
pub fn relationships_touching(stores: &BatchingStores, node: u64) -> Result<Vec<u64>> {
    let mut ids: Vec<u64> = live_records(stores.relationships())?
        .into_iter()
        .filter(|r| r.first_node == node || r.second_node == node)
        .map(|r| r.id)
        .collect();
    ids.sort_unstable();
    Ok(ids)
}

/// Verifies that every chain of every live node is consistent in both directions.
pub fn assert_chains_consistent(stores: &BatchingStores) -> Result<()> {
    for node in live_records(stores.nodes())? {
        assert_eq!(
            relationships_of(stores, &node)?,
            relationships_touching(stores, node.id)?,
            "chains of node {} do not cover its relationships",
            node.id
        );
        for head in chain_heads(stores, &node)? {
            let forward = walk_next(stores, node.id, head)?;
            let rel = stores.relationships().get_record(head)?;
            assert!(rel.first_in_chain_for(node.id), "head {head} of node {} not flagged", node.id);
            assert_eq!(rel.prev_for(node.id), forward.len() as u64, "chain length of node {}", node.id);
            let tail = *forward.last().expect("chains are never empty");
            let mut backward = walk_prev(stores, node.id, tail)?;
            backward.reverse();
            assert_eq!(forward, backward, "chain of node {} differs between directions", node.id);
        }
    }
    Ok(())
}
