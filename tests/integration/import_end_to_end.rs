#![allow(missing_docs)]

mod support;

use sombra_import::{
    import::{properties::read_properties, BadCollector, Collector, ImportLogic, ImportState},
    input::{IdType, InMemoryInput, InputEntity},
    staging::{CapturingMonitor, SilentMonitor},
    storage::BatchingStores,
    types::{Result, Value, NULL_REF},
    ImportConfig, ImporterKind,
};

use support::{assert_chains_consistent, groups_of, import, live_records, node, relationships_of, test_config};

fn chain_input(n: i64) -> InMemoryInput {
    let nodes = (0..n)
        .map(|i| InputEntity::node(i).label(if i % 2 == 0 { "A" } else { "B" }))
        .collect();
    let relationships = (1..n).map(|i| InputEntity::relationship(i - 1, "R", i)).collect();
    InMemoryInput::new(nodes, relationships, IdType::Actual)
}

#[test]
fn chain_degrees_are_known_before_the_cache_is_released() -> Result<()> {
    let input = chain_input(12);
    let stores = BatchingStores::in_memory()?;
    let collector = BadCollector::default();
    let mut logic = ImportLogic::new(&stores, &input, test_config(), &collector, &SilentMonitor);
    logic.initialize()?;
    logic.import_nodes()?;
    logic.prepare_id_mapper()?;
    logic.import_relationships()?;
    logic.calculate_node_degrees()?;
    logic.link_relationships_of_all_types()?;
    assert_eq!(logic.state(), ImportState::Linked);

    let cache = logic.node_relationship_cache();
    for i in 0..12 {
        let expected = if i == 0 || i == 11 { 1 } else { 2 };
        assert_eq!(cache.degree(i)?, expected, "degree of node {i}");
        assert!(!cache.is_dense(i)?);
    }

    logic.defragment_relationship_groups()?;
    logic.build_counts_store()?;
    logic.success()?;
    let report = logic.close()?;
    assert!(report.successful);
    assert_eq!(report.state, ImportState::Succeeded);
    assert_eq!(report.rounds, 1);
    assert_chains_consistent(&stores)
}

#[test]
fn chain_import_builds_counts_and_indexes() -> Result<()> {
    let (stores, collector, report) = import(&chain_input(10), test_config())?;
    assert_eq!(collector.bad_entries(), 0);
    assert_eq!(report.statistics.nodes, 10);
    assert_eq!(report.statistics.relationships, 9);
    assert_eq!(report.statistics.types.len(), 1);
    assert_eq!(report.statistics.types[0].name.as_deref(), Some("R"));

    let tokens = stores.tokens();
    let a = tokens.labels.id_of("A").expect("label A");
    let b = tokens.labels.id_of("B").expect("label B");
    let r = tokens.relationship_types.id_of("R").expect("type R");
    let counts = stores.counts();
    assert_eq!(counts.node_count(None), 10);
    assert_eq!(counts.node_count(Some(a)), 5);
    assert_eq!(counts.node_count(Some(b)), 5);
    assert_eq!(counts.relationship_count(None, Some(r), None), 9);
    assert_eq!(counts.relationship_count(Some(a), Some(r), None), 5);
    assert_eq!(counts.relationship_count(None, Some(r), Some(a)), 4);
    assert_eq!(stores.label_index().entities(a), vec![0, 2, 4, 6, 8]);
    assert_eq!(stores.type_index().entities(r).len(), 9);

    for i in 0..10u64 {
        let record = node(&stores, i)?;
        assert!(record.in_use);
        assert!(!record.dense);
        assert_eq!(relationships_of(&stores, &record)?.len(), if i == 0 || i == 9 { 1 } else { 2 });
    }
    assert_chains_consistent(&stores)
}

#[test]
fn properties_and_string_ids_round_trip() -> Result<()> {
    let long_bio = "likes long walks ".repeat(20);
    let nodes = vec![
        InputEntity::node("alice").label("Person").property("name", "Alice").property("bio", long_bio.as_str()),
        InputEntity::node("bob").label("Person").property("name", "Bob").property("age", 41i64),
        InputEntity::node("acme").label("Company").property("name", "Acme"),
    ];
    let relationships = vec![
        InputEntity::relationship("alice", "KNOWS", "bob").property("since", 2001i64),
        InputEntity::relationship("bob", "WORKS_AT", "acme"),
        InputEntity::relationship("alice", "WORKS_AT", "acme").property("remote", true),
    ];
    let input = InMemoryInput::new(nodes, relationships, IdType::String);
    let (stores, _collector, report) = import(&input, test_config())?;
    assert_eq!(report.statistics.nodes, 3);
    assert_eq!(report.statistics.relationships, 3);
    assert_eq!(report.statistics.properties(), 7);

    let keys = &stores.tokens().property_keys;
    let name = keys.id_of("name").expect("name key");
    let bio = keys.id_of("bio").expect("bio key");
    let mut names = Vec::new();
    for record in live_records(stores.nodes())? {
        let properties = read_properties(&stores, record.next_prop)?;
        for (key, value) in &properties {
            if *key == name {
                names.push(value.clone());
            }
            if *key == bio {
                assert_eq!(value, &Value::Str(long_bio.clone()));
            }
        }
    }
    names.sort_by_key(|v| v.to_string());
    assert_eq!(
        names,
        vec![Value::from("Acme"), Value::from("Alice"), Value::from("Bob")]
    );

    let since = keys.id_of("since").expect("since key");
    let knows = stores.tokens().relationship_types.id_of("KNOWS").expect("KNOWS");
    let rels = live_records(stores.relationships())?;
    let knows_rel = rels.iter().find(|r| r.type_id == knows).expect("KNOWS relationship");
    assert_eq!(
        read_properties(&stores, knows_rel.next_prop)?.to_vec(),
        vec![(since, Value::Int(2001))]
    );
    assert_chains_consistent(&stores)
}

#[test]
fn dense_hub_gets_one_group_per_type() -> Result<()> {
    let mut nodes = vec![InputEntity::node(0i64).label("Hub")];
    let mut relationships = Vec::new();
    for leaf in 1..=12i64 {
        nodes.push(InputEntity::node(leaf).label("Leaf"));
        let kind = if leaf % 3 == 0 { "FOLLOWS" } else { "LIKES" };
        relationships.push(InputEntity::relationship(leaf, kind, 0i64));
        if leaf % 4 == 0 {
            relationships.push(InputEntity::relationship(0i64, "LIKES", leaf));
        }
    }
    relationships.push(InputEntity::relationship(0i64, "SELF", 0i64));
    let input = InMemoryInput::new(nodes, relationships, IdType::Actual);
    let (stores, _collector, report) = import(&input, test_config().dense_node_threshold(5))?;
    assert_eq!(report.dense_nodes, 1);

    let hub = node(&stores, 0)?;
    assert!(hub.dense);
    let groups = groups_of(&stores, &hub)?;
    let types: Vec<u32> = groups.iter().map(|g| g.type_id).collect();
    let mut sorted = types.clone();
    sorted.sort_unstable();
    assert_eq!(types, sorted);
    assert_eq!(groups.len(), 3);
    for pair in groups.windows(2) {
        assert_eq!(pair[0].next, pair[1].id);
    }
    assert_eq!(groups.last().map(|g| g.next), Some(NULL_REF));

    let self_type = stores.tokens().relationship_types.id_of("SELF").expect("SELF");
    let self_group = groups.iter().find(|g| g.type_id == self_type).expect("SELF group");
    assert_ne!(self_group.first[2], NULL_REF);
    assert_eq!(self_group.first[0], NULL_REF);
    assert_eq!(relationships_of(&stores, &hub)?.len(), 12 + 3 + 1);
    assert_chains_consistent(&stores)
}

#[test]
fn dense_labels_make_low_degree_nodes_dense() -> Result<()> {
    let mut nodes = vec![InputEntity::node(0i64).label("Hub")];
    let mut relationships = Vec::new();
    for leaf in 1..=4i64 {
        nodes.push(InputEntity::node(leaf).label("Leaf"));
        let kind = if leaf % 2 == 0 { "FOLLOWS" } else { "LIKES" };
        relationships.push(InputEntity::relationship(leaf, kind, 0i64));
    }
    relationships.push(InputEntity::relationship(1i64, "LIKES", 2i64));
    let input = InMemoryInput::new(nodes, relationships, IdType::Actual);
    let config = test_config().dense_node_threshold(1_000).dense_label("Hub");
    let (stores, _collector, report) = import(&input, config)?;
    assert_eq!(report.dense_nodes, 1);

    let hub = node(&stores, 0)?;
    assert!(hub.dense);
    assert_eq!(groups_of(&stores, &hub)?.len(), 2);
    assert_eq!(relationships_of(&stores, &hub)?.len(), 4);
    for leaf in 1..=4u64 {
        assert!(!node(&stores, leaf)?.dense);
    }
    assert_chains_consistent(&stores)
}

#[test]
fn sequential_and_parallel_importers_agree() -> Result<()> {
    let input = chain_input(40);
    let (parallel, _, parallel_report) = import(&input, test_config().dense_node_threshold(2))?;
    let (sequential, _, sequential_report) =
        import(&input, test_config().dense_node_threshold(2).importer(ImporterKind::Sequential))?;
    assert_eq!(parallel_report.statistics, sequential_report.statistics);
    assert_eq!(parallel.counts().snapshot().nodes, sequential.counts().snapshot().nodes);
    assert_eq!(
        parallel.counts().snapshot().relationships,
        sequential.counts().snapshot().relationships
    );
    assert_chains_consistent(&parallel)?;
    assert_chains_consistent(&sequential)
}

#[test]
fn monitor_sees_every_stage_and_the_outcome() -> Result<()> {
    let input = chain_input(6);
    let stores = BatchingStores::in_memory()?;
    let collector = BadCollector::default();
    let monitor = CapturingMonitor::default();
    let mut logic = ImportLogic::new(&stores, &input, ImportConfig::default(), &collector, &monitor);
    logic.run()?;
    let report = logic.close()?;
    let names: Vec<String> = monitor.stages().into_iter().map(|(name, healthy)| {
        assert!(healthy);
        name
    }).collect();
    assert_eq!(names.first().map(String::as_str), Some("nodes"));
    assert!(names.iter().any(|n| n == "relationships"));
    assert!(names.iter().any(|n| n == "link forward"));
    assert!(names.iter().any(|n| n == "link backward"));
    assert_eq!(monitor.outcome(), Some(true));
    assert_eq!(report.stages.len(), names.len());
    Ok(())
}

#[test]
fn steps_must_run_in_order() -> Result<()> {
    let input = chain_input(3);
    let stores = BatchingStores::in_memory()?;
    let collector = BadCollector::default();
    let mut logic = ImportLogic::new(&stores, &input, test_config(), &collector, &SilentMonitor);
    assert!(logic.import_relationships().is_err());
    assert_eq!(logic.state(), ImportState::Created);
    logic.initialize()?;
    assert!(logic.initialize().is_err());
    let report = logic.close()?;
    assert!(!report.successful);
    Ok(())
}
