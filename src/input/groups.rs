use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::types::{GroupId, ImportError, Result};

/// Registry of named input id spaces. The unnamed global group is always id 0.
#[derive(Debug)]
pub struct Groups {
    by_name: RwLock<FxHashMap<String, GroupId>>,
}

impl Default for Groups {
    fn default() -> Self {
        let mut by_name = FxHashMap::default();
        by_name.insert(String::new(), GroupId(0));
        Self {
            by_name: RwLock::new(by_name),
        }
    }
}

impl Groups {
    /// Id of `name`, registering it on first use. `None` is the global group.
    pub fn resolve(&self, name: Option<&str>) -> Result<GroupId> {
        let name = name.unwrap_or("");
        if let Some(id) = self.by_name.read().get(name) {
            return Ok(*id);
        }
        let mut by_name = self.by_name.write();
        if let Some(id) = by_name.get(name) {
            return Ok(*id);
        }
        let next = u16::try_from(by_name.len())
            .map_err(|_| ImportError::invalid(format!("too many id groups, cannot add {name}")))?;
        by_name.insert(name.to_owned(), GroupId(next));
        Ok(GroupId(next))
    }

    /// Name of a registered group.
    pub fn name_of(&self, id: GroupId) -> Option<String> {
        self.by_name
            .read()
            .iter()
            .find(|(_, g)| **g == id)
            .map(|(name, _)| name.clone())
    }

    /// Number of registered groups, the global one included.
    pub fn len(&self) -> usize {
        self.by_name.read().len()
    }

    /// Never true; the global group always exists.
    pub fn is_empty(&self) -> bool {
        self.by_name.read().is_empty()
    }
}
