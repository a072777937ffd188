#![allow(missing_docs)]

mod support;

use sombra_import::{
    import::{BadEntryKind, Collector},
    input::{IdType, InMemoryInput, InputEntity},
    types::{ImportError, Result},
    ImporterKind,
};

use support::{assert_chains_consistent, import, live_records, test_config};

#[test]
fn unresolved_relationships_write_nothing() -> Result<()> {
    let nodes = vec![InputEntity::node("a"), InputEntity::node("b")];
    let relationships = vec![
        InputEntity::relationship("a", "LINKS", "b").property("weight", 3i64),
        InputEntity::relationship("a", "LINKS", "ghost").property("weight", 7i64),
        InputEntity::relationship("ghost", "LINKS", "b").property("weight", 9i64),
        InputEntity::untyped_relationship("a", "b").property("weight", 11i64),
    ];
    let input = InMemoryInput::new(nodes, relationships, IdType::String);
    let (stores, collector, report) = import(&input, test_config())?;

    assert!(report.successful);
    assert_eq!(report.bad_entries, 3);
    assert_eq!(report.statistics.relationships, 1);
    assert_eq!(live_records(stores.relationships())?.len(), 1);
    assert_eq!(live_records(stores.properties())?.len(), 1);

    let mut reasons: Vec<String> = collector
        .entries()
        .into_iter()
        .map(|entry| {
            assert_eq!(entry.kind, BadEntryKind::Relationship);
            entry.reason
        })
        .collect();
    reasons.sort();
    assert_eq!(
        reasons,
        vec!["end node not found", "relationship type missing", "start node not found"]
    );
    assert_chains_consistent(&stores)
}

#[test]
fn duplicate_input_ids_keep_one_node() -> Result<()> {
    let nodes = vec![
        InputEntity::node("x").property("n", 1i64),
        InputEntity::node("y").property("n", 2i64),
        InputEntity::node("x").property("n", 3i64).label("Late"),
    ];
    let relationships = vec![InputEntity::relationship("x", "TO", "y")];
    let input = InMemoryInput::new(nodes, relationships, IdType::String);
    let (stores, collector, report) = import(&input, test_config())?;

    // Refused on the spot or deleted later, depending on which worker saw it first.
    assert!(report.duplicates_deleted <= 1);
    assert_eq!(report.statistics.nodes, 2);
    assert_eq!(collector.bad_entries(), 1);
    assert_eq!(collector.entries()[0].kind, BadEntryKind::DuplicateNode);

    let live = live_records(stores.nodes())?;
    assert_eq!(live.len(), 2);
    assert_eq!(live_records(stores.properties())?.len(), 2);

    let rels = live_records(stores.relationships())?;
    assert_eq!(rels.len(), 1);
    assert!(live.iter().any(|n| n.id == rels[0].first_node));
    assert!(live.iter().any(|n| n.id == rels[0].second_node));
    assert_chains_consistent(&stores)
}

#[test]
fn uniqueness_violations_are_rolled_back() -> Result<()> {
    let nodes = vec![
        InputEntity::node(1i64).label("Person").property("email", "a@example.com"),
        InputEntity::node(2i64).label("Person").property("email", "a@example.com"),
        InputEntity::node(3i64).label("Person").property("email", "b@example.com"),
    ];
    let input = InMemoryInput::new(nodes, Vec::new(), IdType::Integer);
    let (stores, collector, report) = import(&input, test_config().unique("Person", "email"))?;

    assert_eq!(report.statistics.nodes, 2);
    assert_eq!(collector.bad_entries(), 1);
    let entry = &collector.entries()[0];
    assert_eq!(entry.kind, BadEntryKind::Violation);
    assert!(entry.reason.starts_with("constraint violation"));
    assert_eq!(live_records(stores.nodes())?.len(), 2);
    assert_eq!(live_records(stores.properties())?.len(), 2);

    let person = stores.tokens().labels.id_of("Person").expect("Person label");
    assert_eq!(stores.counts().node_count(Some(person)), 2);
    assert!(report.affected_schema.labels.contains(&person));
    Ok(())
}

/// Two users sharing an input id, with different emails.
fn users_with_duplicate_id(first: InputEntity, second: InputEntity) -> Vec<InputEntity> {
    vec![
        first.label("User").property("email", "x@example.com"),
        second.label("User").property("email", "y@example.com"),
    ]
}

#[test]
fn rejected_actual_id_duplicate_leaves_its_value_free() -> Result<()> {
    let mut nodes = users_with_duplicate_id(InputEntity::node(1i64), InputEntity::node(1i64));
    nodes.push(InputEntity::node(2i64).label("User").property("email", "y@example.com"));
    let input = InMemoryInput::new(nodes, Vec::new(), IdType::Actual);
    let config = test_config()
        .id_type(IdType::Actual)
        .importer(ImporterKind::Sequential)
        .unique("User", "email");
    let (stores, collector, report) = import(&input, config)?;

    assert_eq!(collector.bad_entries(), 1);
    assert_eq!(collector.entries()[0].kind, BadEntryKind::DuplicateNode);
    assert_eq!(report.statistics.nodes, 2);
    assert!(stores.nodes().get_record(1)?.in_use);
    assert!(stores.nodes().get_record(2)?.in_use);
    Ok(())
}

#[test]
fn rejected_input_id_duplicate_leaves_its_value_free() -> Result<()> {
    let mut nodes = users_with_duplicate_id(InputEntity::node("u"), InputEntity::node("u"));
    nodes.push(InputEntity::node("v").label("User").property("email", "y@example.com"));
    let relationships = vec![InputEntity::relationship("v", "FOLLOWS", "u")];
    let input = InMemoryInput::new(nodes, relationships, IdType::String);
    let config = test_config()
        .importer(ImporterKind::Sequential)
        .unique("User", "email");
    let (stores, collector, report) = import(&input, config)?;

    assert_eq!(collector.bad_entries(), 1);
    assert_eq!(collector.entries()[0].kind, BadEntryKind::DuplicateNode);
    assert_eq!(report.duplicates_deleted, 0);
    assert_eq!(report.statistics.nodes, 2);
    assert_eq!(live_records(stores.nodes())?.len(), 2);
    assert_eq!(live_records(stores.relationships())?.len(), 1);
    assert_chains_consistent(&stores)
}

#[test]
fn exceeding_the_tolerance_fails_the_import() {
    let nodes = vec![InputEntity::node(1i64)];
    let relationships = (10..20i64)
        .map(|missing| InputEntity::relationship(1i64, "TO", missing))
        .collect();
    let input = InMemoryInput::new(nodes, relationships, IdType::Integer);
    match import(&input, test_config().bad_tolerance(Some(2))) {
        Err(ImportError::TooManyBadEntries { tolerance }) => assert_eq!(tolerance, 2),
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("import succeeded past its tolerance"),
    }
}
