use std::collections::BTreeSet;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::storage::TokenHolders;
use crate::types::{Rejection, Value};

/// Labels and relationship types an import wrote to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AffectedSchema {
    /// Label tokens seen on imported nodes.
    pub labels: BTreeSet<u32>,
    /// Relationship type tokens seen on imported relationships.
    pub relationship_types: BTreeSet<u32>,
}

/// Schema collaborator consulted by the importers.
pub trait SchemaMonitor: Send + Sync {
    /// Decides whether a node may be committed. Called before anything is written.
    fn check_node(&self, _node: u64, _labels: &[u32], _properties: &[(u32, Value)]) -> Result<(), Rejection> {
        Ok(())
    }
    /// Drops whatever `node` claimed in [`SchemaMonitor::check_node`]; the node will not be kept.
    fn release_node(&self, _node: u64, _labels: &[u32], _properties: &[(u32, Value)]) {}
    /// A committed node carried `label`.
    fn touched_label(&self, _label: u32) {}
    /// A committed relationship had `type_id`.
    fn touched_type(&self, _type_id: u32) {}
    /// Schema elements touched so far.
    fn affected(&self) -> AffectedSchema {
        AffectedSchema::default()
    }
}

/// Monitor that accepts everything and tracks nothing.
#[derive(Default)]
pub struct NoSchemaMonitor;

impl SchemaMonitor for NoSchemaMonitor {}

type Claim = (u32, u32, Vec<u8>);

/// Enforces `(label, property)` uniqueness and tracks touched tokens.
#[derive(Default)]
pub struct UniquenessMonitor {
    constraints: Vec<(u32, u32)>,
    seen: Mutex<FxHashMap<Claim, u64>>,
    affected: Mutex<AffectedSchema>,
}

impl UniquenessMonitor {
    /// Creates a monitor for constraints given by name, registering their tokens.
    pub fn new<'a>(tokens: &TokenHolders, constraints: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let constraints = constraints
            .into_iter()
            .map(|(label, key)| {
                (
                    tokens.labels.get_or_create(label),
                    tokens.property_keys.get_or_create(key),
                )
            })
            .collect();
        Self {
            constraints,
            ..Self::default()
        }
    }
}

impl UniquenessMonitor {
    fn claims(&self, labels: &[u32], properties: &[(u32, Value)]) -> Vec<Claim> {
        let mut claims = Vec::new();
        for (label, key) in &self.constraints {
            if !labels.contains(label) {
                continue;
            }
            if let Some((_, value)) = properties.iter().find(|(k, _)| k == key) {
                claims.push((*label, *key, value.key_bytes()));
            }
        }
        claims
    }
}

impl SchemaMonitor for UniquenessMonitor {
    fn check_node(&self, node: u64, labels: &[u32], properties: &[(u32, Value)]) -> Result<(), Rejection> {
        let claims = self.claims(labels, properties);
        if claims.is_empty() {
            return Ok(());
        }
        let mut seen = self.seen.lock();
        if let Some((label, key, _)) = claims.iter().find(|claim| seen.contains_key(*claim)) {
            return Err(Rejection::ConstraintViolation(format!(
                "label {label} already has a node with property {key} of that value"
            )));
        }
        seen.extend(claims.into_iter().map(|claim| (claim, node)));
        Ok(())
    }

    fn release_node(&self, node: u64, labels: &[u32], properties: &[(u32, Value)]) {
        let claims = self.claims(labels, properties);
        if claims.is_empty() {
            return;
        }
        let mut seen = self.seen.lock();
        for claim in claims {
            if seen.get(&claim) == Some(&node) {
                seen.remove(&claim);
            }
        }
    }

    fn touched_label(&self, label: u32) {
        self.affected.lock().labels.insert(label);
    }

    fn touched_type(&self, type_id: u32) {
        self.affected.lock().relationship_types.insert(type_id);
    }

    fn affected(&self) -> AffectedSchema {
        self.affected.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_node_with_same_value_is_rejected() {
        let tokens = TokenHolders::default();
        let monitor = UniquenessMonitor::new(&tokens, [("Person", "email")]);
        let person = tokens.labels.id_of("Person").unwrap();
        let email = tokens.property_keys.id_of("email").unwrap();
        let props = vec![(email, Value::from("a@x"))];
        assert!(monitor.check_node(0, &[person], &props).is_ok());
        assert!(matches!(
            monitor.check_node(1, &[person], &props),
            Err(Rejection::ConstraintViolation(_))
        ));
        // Other labels are unconstrained.
        assert!(monitor.check_node(2, &[person + 1], &props).is_ok());
        monitor.touched_label(person);
        assert!(monitor.affected().labels.contains(&person));
    }

    #[test]
    fn released_values_can_be_claimed_again() {
        let tokens = TokenHolders::default();
        let monitor = UniquenessMonitor::new(&tokens, [("Person", "email")]);
        let person = tokens.labels.id_of("Person").unwrap();
        let email = tokens.property_keys.id_of("email").unwrap();
        let props = vec![(email, Value::from("a@x"))];
        assert!(monitor.check_node(4, &[person], &props).is_ok());
        // Only the holder can give a value up.
        monitor.release_node(9, &[person], &props);
        assert!(monitor.check_node(9, &[person], &props).is_err());
        monitor.release_node(4, &[person], &props);
        assert!(monitor.check_node(9, &[person], &props).is_ok());
    }
}
