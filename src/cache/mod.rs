//! In-memory caches that carry state between import stages.

mod group_cache;
mod node_labels;
mod node_relationship;

pub use group_cache::{CachedGroup, RelationshipGroupCache};
pub use node_labels::NodeLabelsCache;
pub use node_relationship::{
    next_set_of_types_that_fit_in_memory, GroupView, NodeRelationshipCache, NodeType, CHUNK_SIZE,
    EMPTY, GROUP_ENTRY_SIZE,
};
