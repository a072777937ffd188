#![allow(missing_docs)]

mod support;

use parking_lot::Mutex;
use proptest::prelude::*;
use sombra_import::{
    import::{BadCollector, ParallelBatchImporter, RelationshipLinkingMonitor},
    input::{IdType, InMemoryInput, InputEntity},
    staging::SilentMonitor,
    storage::BatchingStores,
    types::Result,
};

use support::{assert_chains_consistent, groups_of, import, node, test_config};

#[derive(Default)]
struct RecordingLinkingMonitor {
    forward: Mutex<Vec<(u32, Vec<u32>)>>,
    backward: Mutex<Vec<u32>>,
}

impl RelationshipLinkingMonitor for RecordingLinkingMonitor {
    fn forward_linking_completed(&self, round: u32, types: &[u32]) {
        self.forward.lock().push((round, types.to_vec()));
    }

    fn backward_linking_completed(&self, round: u32) {
        self.backward.lock().push(round);
    }
}

/// Three hubs with thirty leaves over four types of decreasing frequency.
fn hubs_input() -> InMemoryInput {
    let mut nodes: Vec<InputEntity> = (0..3i64).map(|h| InputEntity::node(h).label("Hub")).collect();
    let mut relationships = Vec::new();
    for i in 0..30i64 {
        nodes.push(InputEntity::node(3 + i).label("Leaf"));
        let kind = match i {
            0..=11 => "W",
            12..=20 => "X",
            21..=26 => "Y",
            _ => "Z",
        };
        relationships.push(InputEntity::relationship(i % 3, kind, 3 + i));
    }
    relationships.push(InputEntity::relationship(0i64, "Z", 0i64));
    InMemoryInput::new(nodes, relationships, IdType::Actual)
}

#[test]
fn tight_memory_links_one_type_per_round() -> Result<()> {
    let input = hubs_input();
    let stores = BatchingStores::in_memory()?;
    let collector = BadCollector::default();
    let linking = RecordingLinkingMonitor::default();
    let config = test_config().dense_node_threshold(3).max_memory(1);
    let report = ParallelBatchImporter::new(config).do_import_with_linking_monitor(
        &input,
        &stores,
        &collector,
        &SilentMonitor,
        &linking,
    )?;
    assert!(report.successful);
    assert_eq!(report.rounds, 4);
    assert_eq!(report.dense_nodes, 3);

    let types = &stores.tokens().relationship_types;
    let id = |name: &str| types.id_of(name).expect("type registered");
    let forward = linking.forward.lock().clone();
    assert_eq!(
        forward,
        vec![
            (1, vec![id("W")]),
            (2, vec![id("X")]),
            (3, vec![id("Y")]),
            (4, vec![id("Z")]),
        ]
    );
    assert_eq!(*linking.backward.lock(), vec![1, 2, 3, 4]);

    for hub in 0..3u64 {
        let record = node(&stores, hub)?;
        assert!(record.dense);
        let groups = groups_of(&stores, &record)?;
        assert_eq!(groups.len(), 4, "groups of hub {hub}");
        assert!(groups.windows(2).all(|pair| pair[0].type_id < pair[1].type_id));
    }
    assert_chains_consistent(&stores)
}

#[test]
fn ample_memory_links_everything_in_one_round() -> Result<()> {
    let (stores, _collector, report) = import(&hubs_input(), test_config().dense_node_threshold(3))?;
    assert_eq!(report.rounds, 1);
    assert_chains_consistent(&stores)
}

#[test]
fn graph_without_relationships_needs_no_round() -> Result<()> {
    let input = InMemoryInput::new(
        (0..5i64).map(InputEntity::node).collect(),
        Vec::new(),
        IdType::Actual,
    );
    let (stores, _collector, report) = import(&input, test_config())?;
    assert!(report.successful);
    assert_eq!(report.rounds, 0);
    assert_eq!(stores.counts().node_count(None), 5);
    Ok(())
}

fn graph_strategy() -> impl Strategy<Value = (i64, Vec<(i64, u8, i64)>)> {
    (2i64..24).prop_flat_map(|nodes| {
        let edge = (0..nodes, 0u8..4, 0..nodes);
        (Just(nodes), prop::collection::vec(edge, 0..120))
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn chains_walk_the_same_relationships_both_ways(
        (nodes, edges) in graph_strategy(),
        threshold in 1u32..8,
        tight in any::<bool>(),
    ) {
        let input = InMemoryInput::new(
            (0..nodes).map(InputEntity::node).collect(),
            edges
                .iter()
                .map(|(start, kind, end)| InputEntity::relationship(*start, format!("T{kind}"), *end))
                .collect(),
            IdType::Actual,
        );
        let mut config = test_config().dense_node_threshold(threshold);
        if tight {
            config = config.max_memory(1);
        }
        let (stores, _collector, report) = import(&input, config).expect("import succeeds");
        prop_assert!(report.successful);
        prop_assert_eq!(report.statistics.relationships, edges.len() as u64);
        assert_chains_consistent(&stores).expect("chains readable");
    }
}
