use std::fmt;

use serde::{Deserialize, Serialize};

/// Sentinel stored in every record pointer that points nowhere.
pub const NULL_REF: u64 = u64::MAX;

/// Id that is never handed out by an id generator.
///
/// Legacy readers treat `0xFFFF_FFFF` as a "no record" marker, so it stays unused.
pub const RESERVED_ID: u64 = u32::MAX as u64;

/// Largest relationship id the node relationship cache can hold in its 48-bit slots.
pub const MAX_RELATIONSHIP_ID: u64 = (1 << 48) - 2;

/// Label token id.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct LabelId(pub u32);

/// Relationship type token id.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct TypeId(pub u32);

/// Property key token id.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct PropId(pub u32);

/// Input id space. Ids only have to be unique within their group.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct GroupId(pub u16);

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PropId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for LabelId {
    fn from(value: u32) -> Self {
        LabelId(value)
    }
}

impl From<u32> for TypeId {
    fn from(value: u32) -> Self {
        TypeId(value)
    }
}

impl From<u32> for PropId {
    fn from(value: u32) -> Self {
        PropId(value)
    }
}

/// Identifier of a node as it appears in the input source.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum InputId {
    /// Textual id.
    Str(String),
    /// Numeric id.
    Int(i64),
}

impl fmt::Display for InputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputId::Str(s) => write!(f, "{s}"),
            InputId::Int(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for InputId {
    fn from(value: &str) -> Self {
        InputId::Str(value.to_owned())
    }
}

impl From<String> for InputId {
    fn from(value: String) -> Self {
        InputId::Str(value)
    }
}

impl From<i64> for InputId {
    fn from(value: i64) -> Self {
        InputId::Int(value)
    }
}

/// Side of a relationship as seen from one of its nodes.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum Direction {
    /// The node is the start node.
    Outgoing,
    /// The node is the end node.
    Incoming,
    /// The node is both start and end node.
    Loop,
}

impl Direction {
    /// All directions in slot order.
    pub const ALL: [Direction; 3] = [Direction::Outgoing, Direction::Incoming, Direction::Loop];

    /// Slot index used by group records and group cache entries.
    pub fn index(self) -> usize {
        match self {
            Direction::Outgoing => 0,
            Direction::Incoming => 1,
            Direction::Loop => 2,
        }
    }

    /// Direction of a relationship endpoint.
    pub fn of(start: u64, end: u64, node: u64) -> Direction {
        if start == end {
            Direction::Loop
        } else if node == start {
            Direction::Outgoing
        } else {
            Direction::Incoming
        }
    }
}
