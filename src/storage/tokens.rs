use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

#[derive(Default)]
struct TokenTable {
    by_name: FxHashMap<String, u32>,
    names: Vec<String>,
}

/// Name to id registry of one token kind.
#[derive(Default)]
pub struct TokenHolder {
    inner: RwLock<TokenTable>,
}

impl TokenHolder {
    /// Builds a holder with pre-existing names, ids assigned in order.
    pub fn with_names(names: impl IntoIterator<Item = String>) -> Self {
        let holder = Self::default();
        for name in names {
            holder.get_or_create(&name);
        }
        holder
    }

    /// Returns the id of `name`, creating it on first sight.
    pub fn get_or_create(&self, name: &str) -> u32 {
        if let Some(id) = self.inner.read().by_name.get(name) {
            return *id;
        }
        let mut table = self.inner.write();
        if let Some(id) = table.by_name.get(name) {
            return *id;
        }
        let id = table.names.len() as u32;
        table.names.push(name.to_owned());
        table.by_name.insert(name.to_owned(), id);
        id
    }

    /// Id of an existing token.
    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.inner.read().by_name.get(name).copied()
    }

    /// Name of an existing token.
    pub fn name_of(&self, id: u32) -> Option<String> {
        self.inner.read().names.get(id as usize).cloned()
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    /// Returns true when no token exists yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All names ordered by id.
    pub fn names(&self) -> Vec<String> {
        self.inner.read().names.clone()
    }
}

/// Label, relationship type and property key registries.
#[derive(Default)]
pub struct TokenHolders {
    /// Label tokens.
    pub labels: TokenHolder,
    /// Relationship type tokens.
    pub relationship_types: TokenHolder,
    /// Property key tokens.
    pub property_keys: TokenHolder,
}

/// Persisted form of [`TokenHolders`].
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenSnapshot {
    /// Label names ordered by id.
    pub labels: Vec<String>,
    /// Relationship type names ordered by id.
    pub relationship_types: Vec<String>,
    /// Property key names ordered by id.
    pub property_keys: Vec<String>,
}

impl TokenHolders {
    /// Captures every registry.
    pub fn snapshot(&self) -> TokenSnapshot {
        TokenSnapshot {
            labels: self.labels.names(),
            relationship_types: self.relationship_types.names(),
            property_keys: self.property_keys.names(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn concurrent_creation_yields_one_id_per_name() {
        let holder = Arc::new(TokenHolder::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let holder = Arc::clone(&holder);
                thread::spawn(move || {
                    ["KNOWS", "LIKES", "KNOWS", "OWNS"]
                        .iter()
                        .map(|name| holder.get_or_create(name))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(holder.len(), 3);
        let knows = holder.id_of("KNOWS").unwrap();
        assert_eq!(holder.name_of(knows).as_deref(), Some("KNOWS"));
    }
}
