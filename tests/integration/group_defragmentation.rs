#![allow(missing_docs)]

mod support;

use std::collections::BTreeMap;

use sombra_import::{
    import::{BadCollector, ImportLogic},
    input::{IdType, InMemoryInput, InputEntity},
    staging::SilentMonitor,
    storage::{BatchingStores, RelationshipGroupRecord},
    types::{Result, NULL_REF},
    ImportConfig,
};

use support::{assert_chains_consistent, groups_of, live_records, test_config};

/// Every node links to the next few nodes with a type derived from the distance.
fn mesh_input(nodes: i64) -> InMemoryInput {
    let mut relationships = Vec::new();
    for start in 0..nodes {
        for distance in 1..=5i64 {
            let end = (start + distance) % nodes;
            relationships.push(InputEntity::relationship(start, format!("D{distance}"), end));
        }
    }
    InMemoryInput::new((0..nodes).map(InputEntity::node).collect(), relationships, IdType::Actual)
}

fn owner_types(groups: &[RelationshipGroupRecord]) -> BTreeMap<(u64, u32), usize> {
    let mut pairs = BTreeMap::new();
    for group in groups {
        *pairs.entry((group.owner, group.type_id)).or_default() += 1;
    }
    pairs
}

fn defragment(config: ImportConfig) -> Result<()> {
    let input = mesh_input(16);
    let stores = BatchingStores::in_memory()?;
    let collector = BadCollector::default();
    let mut logic = ImportLogic::new(&stores, &input, config, &collector, &SilentMonitor);
    logic.initialize()?;
    logic.import_nodes()?;
    logic.prepare_id_mapper()?;
    logic.import_relationships()?;
    logic.calculate_node_degrees()?;
    logic.link_relationships_of_all_types()?;

    let scattered = live_records(stores.temp_groups())?;
    assert!(!scattered.is_empty());
    let before = owner_types(&scattered);
    assert!(before.values().all(|count| *count == 1));

    logic.defragment_relationship_groups()?;
    let written = live_records(stores.groups())?;
    assert_eq!(owner_types(&written), before);

    let mut seen = 0;
    for node in live_records(stores.nodes())? {
        if !node.dense {
            continue;
        }
        let groups = groups_of(&stores, &node)?;
        assert_eq!(groups.first().map(|g| g.id), Some(node.next_rel));
        for pair in groups.windows(2) {
            assert_eq!(pair[1].id, pair[0].id + 1, "groups of node {} are not contiguous", node.id);
            assert!(pair[0].type_id < pair[1].type_id);
        }
        assert_eq!(groups.last().map(|g| g.next), Some(NULL_REF));
        seen += groups.len();
    }
    assert_eq!(seen, written.len());

    logic.build_counts_store()?;
    logic.success()?;
    assert!(logic.close()?.successful);
    assert_chains_consistent(&stores)
}

#[test]
fn defragmentation_preserves_owner_type_pairs() -> Result<()> {
    defragment(test_config().dense_node_threshold(4))
}

#[test]
fn defragmentation_in_many_small_ranges() -> Result<()> {
    defragment(test_config().dense_node_threshold(4).max_memory(1))
}

#[test]
fn sparse_only_imports_write_no_groups() -> Result<()> {
    let input = mesh_input(8);
    let (stores, _collector, _report) = support::import(&input, test_config())?;
    assert!(live_records(stores.groups())?.is_empty());
    assert_chains_consistent(&stores)
}
