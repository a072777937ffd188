//! Fixed-size record formats of the node, relationship, group, property and dynamic stores.

use std::fmt;

use smallvec::SmallVec;

use crate::primitives::bytes::{RecordReader, RecordWriter};
use crate::types::{Direction, ImportError, PropId, Result, NULL_REF};

/// Binary layout of one record kind.
pub trait RecordFormat: Clone + Send + Sync + fmt::Debug + 'static {
    /// Encoded record size in bytes.
    const SIZE: usize;
    /// Store name used in logs and errors.
    const STORE: &'static str;

    /// A clean, not-in-use record carrying `id`.
    fn new(id: u64) -> Self;
    /// Record id.
    fn id(&self) -> u64;
    /// Whether the record holds live data.
    fn in_use(&self) -> bool;
    /// Marks the record as live or free.
    fn set_in_use(&mut self, in_use: bool);
    /// Writes the record into `dst`, which is exactly [`Self::SIZE`] bytes.
    fn encode(&self, dst: &mut [u8]);
    /// Reads a record from `src`, which is exactly [`Self::SIZE`] bytes.
    fn decode(id: u64, src: &[u8]) -> Result<Self>;
}

const IN_USE: u8 = 0b0000_0001;

/// Inline label slots in a node record.
pub const INLINE_LABELS: usize = 4;

/// Labels of a node: inline, or spilled into a dynamic record chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeLabels {
    /// Up to [`INLINE_LABELS`] label ids stored in the record.
    Inline(SmallVec<[u32; INLINE_LABELS]>),
    /// First dynamic record of a chain holding the label ids.
    Dynamic(u64),
}

impl Default for NodeLabels {
    fn default() -> Self {
        NodeLabels::Inline(SmallVec::new())
    }
}

/// Node record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    /// Record id.
    pub id: u64,
    /// Live flag.
    pub in_use: bool,
    /// Whether `next_rel` points at a relationship group instead of a relationship.
    pub dense: bool,
    /// Node labels.
    pub labels: NodeLabels,
    /// First relationship, or first relationship group when dense.
    pub next_rel: u64,
    /// First property record.
    pub next_prop: u64,
}

const NODE_DENSE: u8 = 0b0000_0010;
const NODE_DYNAMIC_LABELS: u8 = 0b0000_0100;

impl RecordFormat for NodeRecord {
    const SIZE: usize = 40;
    const STORE: &'static str = "node";

    fn new(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            dense: false,
            labels: NodeLabels::default(),
            next_rel: NULL_REF,
            next_prop: NULL_REF,
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    fn encode(&self, dst: &mut [u8]) {
        let mut w = RecordWriter::new(dst);
        let mut flags = 0u8;
        if self.in_use {
            flags |= IN_USE;
        }
        if self.dense {
            flags |= NODE_DENSE;
        }
        match &self.labels {
            NodeLabels::Inline(labels) => {
                w.put_u8(flags);
                w.put_u8(labels.len() as u8);
                w.skip(2);
                for slot in 0..INLINE_LABELS {
                    w.put_u32(labels.get(slot).copied().unwrap_or(0));
                }
            }
            NodeLabels::Dynamic(first) => {
                w.put_u8(flags | NODE_DYNAMIC_LABELS);
                w.put_u8(0);
                w.skip(2);
                w.put_u64(*first);
                w.skip(8);
            }
        }
        w.put_u64(self.next_rel);
        w.put_u64(self.next_prop);
    }

    fn decode(id: u64, src: &[u8]) -> Result<Self> {
        let mut r = RecordReader::new(src);
        let flags = r.get_u8()?;
        let count = r.get_u8()? as usize;
        r.skip(2)?;
        let labels = if flags & NODE_DYNAMIC_LABELS != 0 {
            let first = r.get_u64()?;
            r.skip(8)?;
            NodeLabels::Dynamic(first)
        } else {
            if count > INLINE_LABELS {
                return Err(ImportError::corruption(format!(
                    "node {id} claims {count} inline labels"
                )));
            }
            let mut labels = SmallVec::new();
            for slot in 0..INLINE_LABELS {
                let label = r.get_u32()?;
                if slot < count {
                    labels.push(label);
                }
            }
            NodeLabels::Inline(labels)
        };
        Ok(Self {
            id,
            in_use: flags & IN_USE != 0,
            dense: flags & NODE_DENSE != 0,
            labels,
            next_rel: r.get_u64()?,
            next_prop: r.get_u64()?,
        })
    }
}

/// Relationship record, a member of two doubly linked chains.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationshipRecord {
    /// Record id.
    pub id: u64,
    /// Live flag.
    pub in_use: bool,
    /// Start node.
    pub first_node: u64,
    /// End node.
    pub second_node: u64,
    /// Relationship type token.
    pub type_id: u32,
    /// Previous relationship in the start node chain, or the chain length when first in chain.
    pub first_prev: u64,
    /// Next relationship in the start node chain.
    pub first_next: u64,
    /// Previous relationship in the end node chain, or the chain length when first in chain.
    pub second_prev: u64,
    /// Next relationship in the end node chain.
    pub second_next: u64,
    /// First property record.
    pub next_prop: u64,
    /// Head of the start node chain.
    pub first_in_first_chain: bool,
    /// Head of the end node chain.
    pub first_in_second_chain: bool,
}

const REL_FIRST_IN_FIRST: u8 = 0b0000_0010;
const REL_FIRST_IN_SECOND: u8 = 0b0000_0100;

impl RelationshipRecord {
    /// Whether start and end node are the same.
    pub fn is_loop(&self) -> bool {
        self.first_node == self.second_node
    }

    /// Next pointer in the chain of `node`.
    pub fn next_for(&self, node: u64) -> u64 {
        if node == self.first_node {
            self.first_next
        } else {
            self.second_next
        }
    }

    /// Prev pointer in the chain of `node`.
    pub fn prev_for(&self, node: u64) -> u64 {
        if node == self.first_node {
            self.first_prev
        } else {
            self.second_prev
        }
    }

    /// Whether this record heads the chain of `node`.
    pub fn first_in_chain_for(&self, node: u64) -> bool {
        if node == self.first_node {
            self.first_in_first_chain
        } else {
            self.first_in_second_chain
        }
    }

    /// Sets the next pointer for `node`; a loop updates both sides.
    pub fn set_next_for(&mut self, node: u64, next: u64) {
        if node == self.first_node {
            self.first_next = next;
        }
        if node == self.second_node {
            self.second_next = next;
        }
    }

    /// Sets the prev pointer and chain-head flag for `node`; a loop updates both sides.
    pub fn set_prev_for(&mut self, node: u64, prev: u64, first_in_chain: bool) {
        if node == self.first_node {
            self.first_prev = prev;
            self.first_in_first_chain = first_in_chain;
        }
        if node == self.second_node {
            self.second_prev = prev;
            self.first_in_second_chain = first_in_chain;
        }
    }
}

impl RecordFormat for RelationshipRecord {
    const SIZE: usize = 64;
    const STORE: &'static str = "relationship";

    fn new(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            first_node: NULL_REF,
            second_node: NULL_REF,
            type_id: 0,
            first_prev: NULL_REF,
            first_next: NULL_REF,
            second_prev: NULL_REF,
            second_next: NULL_REF,
            next_prop: NULL_REF,
            first_in_first_chain: false,
            first_in_second_chain: false,
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    fn encode(&self, dst: &mut [u8]) {
        let mut w = RecordWriter::new(dst);
        let mut flags = 0u8;
        if self.in_use {
            flags |= IN_USE;
        }
        if self.first_in_first_chain {
            flags |= REL_FIRST_IN_FIRST;
        }
        if self.first_in_second_chain {
            flags |= REL_FIRST_IN_SECOND;
        }
        w.put_u8(flags);
        w.skip(3);
        w.put_u32(self.type_id);
        w.put_u64(self.first_node);
        w.put_u64(self.second_node);
        w.put_u64(self.first_prev);
        w.put_u64(self.first_next);
        w.put_u64(self.second_prev);
        w.put_u64(self.second_next);
        w.put_u64(self.next_prop);
    }

    fn decode(id: u64, src: &[u8]) -> Result<Self> {
        let mut r = RecordReader::new(src);
        let flags = r.get_u8()?;
        r.skip(3)?;
        Ok(Self {
            id,
            in_use: flags & IN_USE != 0,
            first_in_first_chain: flags & REL_FIRST_IN_FIRST != 0,
            first_in_second_chain: flags & REL_FIRST_IN_SECOND != 0,
            type_id: r.get_u32()?,
            first_node: r.get_u64()?,
            second_node: r.get_u64()?,
            first_prev: r.get_u64()?,
            first_next: r.get_u64()?,
            second_prev: r.get_u64()?,
            second_next: r.get_u64()?,
            next_prop: r.get_u64()?,
        })
    }
}

/// Per node, per type record holding the heads of the out, in and loop chains of a dense node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationshipGroupRecord {
    /// Record id.
    pub id: u64,
    /// Live flag.
    pub in_use: bool,
    /// Relationship type token.
    pub type_id: u32,
    /// Owning node.
    pub owner: u64,
    /// Next group of the same owner.
    pub next: u64,
    /// Chain heads indexed by [`Direction::index`].
    pub first: [u64; 3],
}

impl RelationshipGroupRecord {
    /// Chain head for `direction`.
    pub fn first(&self, direction: Direction) -> u64 {
        self.first[direction.index()]
    }

    /// Sets the chain head for `direction`.
    pub fn set_first(&mut self, direction: Direction, rel: u64) {
        self.first[direction.index()] = rel;
    }
}

impl RecordFormat for RelationshipGroupRecord {
    const SIZE: usize = 48;
    const STORE: &'static str = "relationship_group";

    fn new(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            type_id: 0,
            owner: NULL_REF,
            next: NULL_REF,
            first: [NULL_REF; 3],
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    fn encode(&self, dst: &mut [u8]) {
        let mut w = RecordWriter::new(dst);
        w.put_u8(if self.in_use { IN_USE } else { 0 });
        w.skip(3);
        w.put_u32(self.type_id);
        w.put_u64(self.owner);
        w.put_u64(self.next);
        for head in self.first {
            w.put_u64(head);
        }
    }

    fn decode(id: u64, src: &[u8]) -> Result<Self> {
        let mut r = RecordReader::new(src);
        let flags = r.get_u8()?;
        r.skip(3)?;
        let type_id = r.get_u32()?;
        let owner = r.get_u64()?;
        let next = r.get_u64()?;
        let first = [r.get_u64()?, r.get_u64()?, r.get_u64()?];
        Ok(Self {
            id,
            in_use: flags & IN_USE != 0,
            type_id,
            owner,
            next,
            first,
        })
    }
}

/// Encoding of a property block payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PropertyKind {
    /// Boolean stored in the payload.
    Bool = 1,
    /// Integer stored in the payload.
    Int = 2,
    /// Float bits stored in the payload.
    Float = 3,
    /// String of at most eight bytes stored in the payload.
    ShortStr = 4,
    /// String in a dynamic record chain; payload is the first record id.
    Str = 5,
    /// Byte array of at most eight bytes stored in the payload.
    ShortBytes = 6,
    /// Byte array in a dynamic record chain; payload is the first record id.
    Bytes = 7,
}

impl PropertyKind {
    fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            1 => PropertyKind::Bool,
            2 => PropertyKind::Int,
            3 => PropertyKind::Float,
            4 => PropertyKind::ShortStr,
            5 => PropertyKind::Str,
            6 => PropertyKind::ShortBytes,
            7 => PropertyKind::Bytes,
            other => {
                return Err(ImportError::corruption(format!(
                    "unknown property kind {other}"
                )))
            }
        })
    }

    /// Whether the payload references a dynamic record chain.
    pub fn is_dynamic(self) -> bool {
        matches!(self, PropertyKind::Str | PropertyKind::Bytes)
    }
}

/// One key/value slot of a property record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PropertyBlock {
    /// Property key token.
    pub key: PropId,
    /// Payload encoding.
    pub kind: PropertyKind,
    /// Byte length of short inline payloads.
    pub inline_len: u8,
    /// Inline value or dynamic record id.
    pub payload: u64,
}

/// Blocks per property record.
pub const BLOCKS_PER_PROPERTY_RECORD: usize = 4;

/// Property record, a member of an entity's property chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyRecord {
    /// Record id.
    pub id: u64,
    /// Live flag.
    pub in_use: bool,
    /// Previous record in the chain.
    pub prev: u64,
    /// Next record in the chain.
    pub next: u64,
    /// Property blocks.
    pub blocks: SmallVec<[PropertyBlock; BLOCKS_PER_PROPERTY_RECORD]>,
}

impl RecordFormat for PropertyRecord {
    const SIZE: usize = 88;
    const STORE: &'static str = "property";

    fn new(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            prev: NULL_REF,
            next: NULL_REF,
            blocks: SmallVec::new(),
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    fn encode(&self, dst: &mut [u8]) {
        let mut w = RecordWriter::new(dst);
        w.put_u8(if self.in_use { IN_USE } else { 0 });
        w.put_u8(self.blocks.len() as u8);
        w.skip(6);
        w.put_u64(self.prev);
        w.put_u64(self.next);
        for block in &self.blocks {
            w.put_u32(block.key.0);
            w.put_u8(block.kind as u8);
            w.put_u8(block.inline_len);
            w.skip(2);
            w.put_u64(block.payload);
        }
    }

    fn decode(id: u64, src: &[u8]) -> Result<Self> {
        let mut r = RecordReader::new(src);
        let flags = r.get_u8()?;
        let count = r.get_u8()? as usize;
        r.skip(6)?;
        let prev = r.get_u64()?;
        let next = r.get_u64()?;
        if count > BLOCKS_PER_PROPERTY_RECORD {
            return Err(ImportError::corruption(format!(
                "property record {id} claims {count} blocks"
            )));
        }
        let in_use = flags & IN_USE != 0;
        let mut blocks = SmallVec::new();
        for _ in 0..count {
            let key = PropId(r.get_u32()?);
            let kind = PropertyKind::from_u8(r.get_u8()?)?;
            let inline_len = r.get_u8()?;
            r.skip(2)?;
            let payload = r.get_u64()?;
            blocks.push(PropertyBlock {
                key,
                kind,
                inline_len,
                payload,
            });
        }
        Ok(Self {
            id,
            in_use,
            prev,
            next,
            blocks,
        })
    }
}

/// Bytes of payload per dynamic record.
pub const DYNAMIC_DATA_SIZE: usize = 112;

/// Dynamic record, one link of a chain holding a string, byte array or label list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DynamicRecord {
    /// Record id.
    pub id: u64,
    /// Live flag.
    pub in_use: bool,
    /// Next record of the chain.
    pub next: u64,
    /// Payload bytes, at most [`DYNAMIC_DATA_SIZE`].
    pub data: Vec<u8>,
}

impl RecordFormat for DynamicRecord {
    const SIZE: usize = 128;
    const STORE: &'static str = "dynamic";

    fn new(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            next: NULL_REF,
            data: Vec::new(),
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    fn encode(&self, dst: &mut [u8]) {
        let mut w = RecordWriter::new(dst);
        w.put_u8(if self.in_use { IN_USE } else { 0 });
        w.skip(3);
        w.put_u32(self.data.len() as u32);
        w.put_u64(self.next);
        w.put_bytes(&self.data);
    }

    fn decode(id: u64, src: &[u8]) -> Result<Self> {
        let mut r = RecordReader::new(src);
        let flags = r.get_u8()?;
        r.skip(3)?;
        let len = r.get_u32()? as usize;
        let next = r.get_u64()?;
        if len > DYNAMIC_DATA_SIZE {
            return Err(ImportError::corruption(format!(
                "dynamic record {id} claims {len} bytes"
            )));
        }
        Ok(Self {
            id,
            in_use: flags & IN_USE != 0,
            next,
            data: r.get_bytes(len)?.to_vec(),
        })
    }
}
