//! Input sources the importer reads nodes and relationships from.
//!
//! An [`Input`] hands out restartable, single-pass iterators of chunks. Each
//! chunk is a list of [`InputEntity`] values that importers replay through the
//! [`InputEntityVisitor`] callbacks.

pub mod csv;
mod entity;
mod groups;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use entity::{InputEntity, InputEntityVisitor};
pub use groups::Groups;

use crate::types::{InputId, Result, Value};

/// One chunk of entities read from a source.
pub type InputChunk = Vec<InputEntity>;

/// How input node ids map to store ids.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum IdType {
    /// Arbitrary strings, mapped through a hash id mapper.
    #[default]
    String,
    /// Integers, mapped through a hash id mapper.
    Integer,
    /// Integers used verbatim as node ids.
    Actual,
}

/// Single pass over the nodes or relationships of an input.
pub trait InputIterator: Send {
    /// Appends up to `max` entities to `chunk`. Returns false once exhausted.
    fn next_chunk(&mut self, chunk: &mut InputChunk, max: usize) -> Result<bool>;
}

/// Rough size of an input, used for memory sanity checks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Estimates {
    /// Nodes.
    pub number_of_nodes: u64,
    /// Relationships.
    pub number_of_relationships: u64,
    /// Node properties.
    pub number_of_node_properties: u64,
    /// Relationship properties.
    pub number_of_relationship_properties: u64,
    /// Node label assignments.
    pub number_of_node_labels: u64,
    /// Approximate bytes of node property values.
    pub size_of_node_properties: u64,
    /// Approximate bytes of relationship property values.
    pub size_of_relationship_properties: u64,
}

fn value_size(value: &Value) -> u64 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 8,
        Value::Str(s) => s.len() as u64,
        Value::Bytes(b) => b.len() as u64,
    }
}

impl Estimates {
    /// Exact figures for entities held in memory.
    pub fn of(nodes: &[InputEntity], relationships: &[InputEntity]) -> Self {
        let mut estimates = Estimates {
            number_of_nodes: nodes.len() as u64,
            number_of_relationships: relationships.len() as u64,
            ..Estimates::default()
        };
        for node in nodes {
            estimates.number_of_node_labels += node.labels.len() as u64;
            estimates.number_of_node_properties += node.properties.len() as u64;
            estimates.size_of_node_properties +=
                node.properties.iter().map(|(_, v)| value_size(v)).sum::<u64>();
        }
        for rel in relationships {
            estimates.number_of_relationship_properties += rel.properties.len() as u64;
            estimates.size_of_relationship_properties +=
                rel.properties.iter().map(|(_, v)| value_size(v)).sum::<u64>();
        }
        estimates
    }
}

/// Source of nodes and relationships for an import.
pub trait Input: Send + Sync {
    /// Fresh iterator over all nodes.
    fn nodes(&self) -> Result<Box<dyn InputIterator + '_>>;
    /// Fresh iterator over all relationships.
    fn relationships(&self) -> Result<Box<dyn InputIterator + '_>>;
    /// How node ids are interpreted.
    fn id_type(&self) -> IdType;
    /// Id groups referenced by the entities.
    fn groups(&self) -> &Groups;
    /// Size estimates.
    fn estimates(&self) -> Result<Estimates>;
}

/// Input held entirely in memory.
pub struct InMemoryInput {
    nodes: Arc<Vec<InputEntity>>,
    relationships: Arc<Vec<InputEntity>>,
    id_type: IdType,
    groups: Groups,
}

impl InMemoryInput {
    /// Creates an input from entity lists.
    pub fn new(nodes: Vec<InputEntity>, relationships: Vec<InputEntity>, id_type: IdType) -> Self {
        Self {
            nodes: Arc::new(nodes),
            relationships: Arc::new(relationships),
            id_type,
            groups: Groups::default(),
        }
    }

    /// Nodes with ids `0..n` labeled alternately `A` and `B`, linked in a chain by `R`.
    pub fn chain(n: u64) -> Self {
        let nodes = (0..n as i64)
            .map(|i| InputEntity::node(i).label(if i % 2 == 0 { "A" } else { "B" }))
            .collect();
        let relationships = (1..n as i64)
            .map(|i| InputEntity::relationship(i - 1, "R", i))
            .collect();
        Self::new(nodes, relationships, IdType::Integer)
    }
}

struct SliceIterator {
    items: Arc<Vec<InputEntity>>,
    position: usize,
}

impl InputIterator for SliceIterator {
    fn next_chunk(&mut self, chunk: &mut InputChunk, max: usize) -> Result<bool> {
        let end = (self.position + max.max(1)).min(self.items.len());
        if self.position >= end {
            return Ok(false);
        }
        chunk.extend_from_slice(&self.items[self.position..end]);
        self.position = end;
        Ok(true)
    }
}

impl Input for InMemoryInput {
    fn nodes(&self) -> Result<Box<dyn InputIterator + '_>> {
        Ok(Box::new(SliceIterator {
            items: Arc::clone(&self.nodes),
            position: 0,
        }))
    }

    fn relationships(&self) -> Result<Box<dyn InputIterator + '_>> {
        Ok(Box::new(SliceIterator {
            items: Arc::clone(&self.relationships),
            position: 0,
        }))
    }

    fn id_type(&self) -> IdType {
        self.id_type
    }

    fn groups(&self) -> &Groups {
        &self.groups
    }

    fn estimates(&self) -> Result<Estimates> {
        Ok(Estimates::of(&self.nodes, &self.relationships))
    }
}

/// Parses a textual id according to `id_type`.
pub fn parse_input_id(raw: &str, id_type: IdType) -> std::result::Result<InputId, String> {
    match id_type {
        IdType::String => Ok(InputId::Str(raw.to_owned())),
        IdType::Integer | IdType::Actual => raw
            .trim()
            .parse::<i64>()
            .map(InputId::Int)
            .map_err(|_| format!("'{raw}' is not an integer id")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_input_is_restartable() -> Result<()> {
        let input = InMemoryInput::chain(5);
        for _ in 0..2 {
            let mut iter = input.relationships()?;
            let mut chunk = Vec::new();
            let mut total = 0;
            while iter.next_chunk(&mut chunk, 3)? {
                total += chunk.len();
                chunk.clear();
            }
            assert_eq!(total, 4);
        }
        let estimates = input.estimates()?;
        assert_eq!(estimates.number_of_nodes, 5);
        assert_eq!(estimates.number_of_node_labels, 5);
        Ok(())
    }

    #[test]
    fn integer_ids_must_parse() {
        assert_eq!(parse_input_id("17", IdType::Integer), Ok(InputId::Int(17)));
        assert!(parse_input_id("x", IdType::Actual).is_err());
        assert_eq!(parse_input_id("x", IdType::String), Ok(InputId::Str("x".into())));
    }
}
