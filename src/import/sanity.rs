//! Advisory checks run before an import starts. They log, never fail.

use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{NodeLabelsCache, NodeRelationshipCache};
use crate::idmapping;
use crate::input::{Estimates, IdType};
use crate::storage::BatchingStores;
use crate::storage::record::BLOCKS_PER_PROPERTY_RECORD;

/// Free memory above this multiple of the requirement is reported as abundant.
const ABUNDANT_FACTOR: u64 = 10;

/// Finding of a pre-flight check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SanityWarning {
    /// Estimated cache memory exceeds the budget.
    InsufficientMemory {
        /// Estimated bytes.
        required: u64,
        /// Configured budget.
        available: u64,
    },
    /// The budget is far beyond what the import needs.
    AbundantMemory {
        /// Estimated bytes.
        required: u64,
        /// Configured budget.
        available: u64,
    },
    /// The estimated entity count exceeds what a store can address.
    IdSpaceExceeded {
        /// Store name.
        store: &'static str,
        /// Estimated ids.
        required: u64,
        /// Highest addressable id.
        max_id: u64,
    },
}

impl fmt::Display for SanityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SanityWarning::InsufficientMemory { required, available } => write!(
                f,
                "estimated {required} bytes of cache memory exceed the {available} byte budget"
            ),
            SanityWarning::AbundantMemory { required, available } => write!(
                f,
                "{available} byte budget is far above the estimated {required} bytes"
            ),
            SanityWarning::IdSpaceExceeded {
                store,
                required,
                max_id,
            } => write!(f, "{store} store needs {required} ids but addresses at most {max_id}"),
        }
    }
}

/// Bytes the caches of an import of `estimates` need at their peak.
pub fn required_memory(estimates: &Estimates, id_type: IdType) -> u64 {
    let nodes = estimates.number_of_nodes;
    NodeRelationshipCache::memory_estimation(nodes)
        + idmapping::memory_estimation(id_type, nodes)
        + NodeLabelsCache::memory_estimation(nodes)
}

/// Compares estimated cache memory with `max_memory`.
pub fn check_memory(estimates: &Estimates, id_type: IdType, max_memory: u64) -> Vec<SanityWarning> {
    let required = required_memory(estimates, id_type);
    let mut warnings = Vec::new();
    if required > max_memory {
        warn!(required, available = max_memory, "import.sanity.insufficient_memory");
        warnings.push(SanityWarning::InsufficientMemory {
            required,
            available: max_memory,
        });
    } else if required > 0 && max_memory / required > ABUNDANT_FACTOR {
        info!(required, available = max_memory, "import.sanity.abundant_memory");
        warnings.push(SanityWarning::AbundantMemory {
            required,
            available: max_memory,
        });
    }
    warnings
}

/// Compares estimated entity counts with the id space of each store.
pub fn check_id_space(estimates: &Estimates, stores: &BatchingStores) -> Vec<SanityWarning> {
    let property_records = (estimates.number_of_node_properties
        + estimates.number_of_relationship_properties)
        .div_ceil(BLOCKS_PER_PROPERTY_RECORD as u64);
    let checks = [
        (
            "node",
            estimates.number_of_nodes,
            stores.nodes().id_generator().max_id(),
        ),
        (
            "relationship",
            estimates.number_of_relationships,
            stores.relationships().id_generator().max_id(),
        ),
        (
            "property",
            property_records,
            stores.properties().id_generator().max_id(),
        ),
    ];
    let mut warnings = Vec::new();
    for (store, required, max_id) in checks {
        if required > max_id {
            warn!(store, required, max_id, "import.sanity.id_space");
            warnings.push(SanityWarning::IdSpaceExceeded {
                store,
                required,
                max_id,
            });
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_findings_depend_on_the_budget() {
        let estimates = Estimates {
            number_of_nodes: 1_000_000,
            ..Estimates::default()
        };
        let required = required_memory(&estimates, IdType::Integer);
        assert!(matches!(
            check_memory(&estimates, IdType::Integer, required / 2)[..],
            [SanityWarning::InsufficientMemory { .. }]
        ));
        assert!(check_memory(&estimates, IdType::Integer, required * 2).is_empty());
        assert!(matches!(
            check_memory(&estimates, IdType::Integer, required * 100)[..],
            [SanityWarning::AbundantMemory { .. }]
        ));
    }

    #[test]
    fn id_space_is_checked_per_store() {
        let stores = BatchingStores::in_memory().unwrap();
        let estimates = Estimates {
            number_of_nodes: u64::MAX,
            number_of_relationships: 10,
            ..Estimates::default()
        };
        let warnings = check_id_space(&estimates, &stores);
        assert_eq!(warnings.len(), 1);
        assert!(matches!(warnings[0], SanityWarning::IdSpaceExceeded { store: "node", .. }));
    }
}
