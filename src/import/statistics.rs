use std::fmt;

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::storage::TokenHolders;
use crate::types::TypeId;

/// Relationships imported for one type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RelationshipTypeCount {
    /// Type token.
    pub type_id: u32,
    /// Type name, when known.
    pub name: Option<String>,
    /// Relationships of this type.
    pub count: u64,
}

/// Totals gathered while importing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DataStatistics {
    /// Nodes written and kept.
    pub nodes: u64,
    /// Property blocks written for nodes.
    pub node_properties: u64,
    /// Relationships written.
    pub relationships: u64,
    /// Property blocks written for relationships.
    pub relationship_properties: u64,
    /// Per-type counts, most frequent first, ties by type id.
    pub types: Vec<RelationshipTypeCount>,
}

impl DataStatistics {
    /// Replaces the type distribution with `counts`.
    pub fn set_type_counts(&mut self, counts: &FxHashMap<u32, u64>, tokens: &TokenHolders) {
        let mut types: Vec<RelationshipTypeCount> = counts
            .iter()
            .map(|(type_id, count)| RelationshipTypeCount {
                type_id: *type_id,
                name: tokens.relationship_types.name_of(*type_id),
                count: *count,
            })
            .collect();
        types.sort_by(|a, b| b.count.cmp(&a.count).then(a.type_id.cmp(&b.type_id)));
        self.types = types;
    }

    /// `(type, count)` pairs in linking order.
    pub fn type_distribution(&self) -> Vec<(TypeId, u64)> {
        self.types.iter().map(|t| (TypeId(t.type_id), t.count)).collect()
    }

    /// Property blocks written in total.
    pub fn properties(&self) -> u64 {
        self.node_properties + self.relationship_properties
    }
}

impl fmt::Display for DataStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} nodes, {} relationships, {} properties",
            self.nodes,
            self.relationships,
            self.properties()
        )?;
        if !self.types.is_empty() {
            f.write_str(" [")?;
            for (i, t) in self.types.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                match &t.name {
                    Some(name) => write!(f, "{name}: {}", t.count)?,
                    None => write!(f, "#{}: {}", t.type_id, t.count)?,
                }
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types_are_ordered_by_count_then_id() {
        let tokens = TokenHolders::default();
        let knows = tokens.relationship_types.get_or_create("KNOWS");
        let likes = tokens.relationship_types.get_or_create("LIKES");
        let owns = tokens.relationship_types.get_or_create("OWNS");
        let counts: FxHashMap<u32, u64> = [(knows, 3), (likes, 9), (owns, 3)].into_iter().collect();
        let mut stats = DataStatistics {
            nodes: 4,
            relationships: 15,
            ..DataStatistics::default()
        };
        stats.set_type_counts(&counts, &tokens);
        let order: Vec<u32> = stats.types.iter().map(|t| t.type_id).collect();
        assert_eq!(order, vec![likes, knows, owns]);
        assert_eq!(
            stats.to_string(),
            "4 nodes, 15 relationships, 0 properties [LIKES: 9, KNOWS: 3, OWNS: 3]"
        );
    }
}
