use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, info};

use super::counts::{CountsStore, TokenIndex};
use super::id_batch::BatchingIdGetter;
use super::record::{
    DynamicRecord, NodeLabels, NodeRecord, PropertyRecord, RecordFormat, RelationshipGroupRecord,
    RelationshipRecord, DYNAMIC_DATA_SIZE, INLINE_LABELS,
};
use super::store::RecordStore;
use super::tokens::TokenHolders;
use crate::primitives::io::{FileIo, MemFileIo, StdFileIo};
use crate::types::{ImportError, Result, MAX_RELATIONSHIP_ID, NULL_REF};

const NODE_MAX_ID: u64 = (1 << 35) - 1;
const GROUP_MAX_ID: u64 = (1 << 35) - 1;
const PROPERTY_MAX_ID: u64 = (1 << 36) - 1;
const DYNAMIC_MAX_ID: u64 = (1 << 36) - 1;

const NODE_FILE: &str = "nodes.store";
const RELATIONSHIP_FILE: &str = "relationships.store";
const GROUP_FILE: &str = "relationship_groups.store";
const TEMP_GROUP_FILE: &str = "relationship_groups.tmp";
const PROPERTY_FILE: &str = "properties.store";
const DYNAMIC_FILE: &str = "dynamic.store";
const TOKENS_FILE: &str = "tokens.json";
const COUNTS_FILE: &str = "counts.json";
const LABEL_INDEX_FILE: &str = "label_index.json";
const TYPE_INDEX_FILE: &str = "relationship_type_index.json";

/// Every store written by an import, plus tokens, counts and token indexes.
pub struct BatchingStores {
    dir: Option<PathBuf>,
    nodes: RecordStore<NodeRecord>,
    relationships: RecordStore<RelationshipRecord>,
    groups: RecordStore<RelationshipGroupRecord>,
    temp_groups: RecordStore<RelationshipGroupRecord>,
    properties: RecordStore<PropertyRecord>,
    dynamic: RecordStore<DynamicRecord>,
    tokens: TokenHolders,
    counts: CountsStore,
    label_index: TokenIndex,
    type_index: TokenIndex,
}

fn open_file(dir: &Path, name: &str) -> Result<Arc<dyn FileIo>> {
    Ok(Arc::new(StdFileIo::open(dir.join(name))?))
}

fn mem_file() -> Arc<dyn FileIo> {
    Arc::new(MemFileIo::new())
}

impl BatchingStores {
    /// Creates empty stores inside `dir`. Refuses to import into existing data.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        for name in [NODE_FILE, RELATIONSHIP_FILE, PROPERTY_FILE] {
            let path = dir.join(name);
            if path.exists() && fs::metadata(&path)?.len() > 0 {
                return Err(ImportError::invalid(format!(
                    "{} already contains store data",
                    dir.display()
                )));
            }
        }
        let stores = Self {
            dir: Some(dir.to_path_buf()),
            nodes: RecordStore::open(open_file(dir, NODE_FILE)?, NODE_MAX_ID)?,
            relationships: RecordStore::open(
                open_file(dir, RELATIONSHIP_FILE)?,
                MAX_RELATIONSHIP_ID,
            )?,
            groups: RecordStore::open(open_file(dir, GROUP_FILE)?, GROUP_MAX_ID)?,
            temp_groups: RecordStore::open(open_file(dir, TEMP_GROUP_FILE)?, GROUP_MAX_ID)?,
            properties: RecordStore::open(open_file(dir, PROPERTY_FILE)?, PROPERTY_MAX_ID)?,
            dynamic: RecordStore::open(open_file(dir, DYNAMIC_FILE)?, DYNAMIC_MAX_ID)?,
            tokens: TokenHolders::default(),
            counts: CountsStore::default(),
            label_index: TokenIndex::default(),
            type_index: TokenIndex::default(),
        };
        info!(dir = %dir.display(), "stores.create");
        Ok(stores)
    }

    /// Creates stores backed entirely by memory.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            dir: None,
            nodes: RecordStore::open(mem_file(), NODE_MAX_ID)?,
            relationships: RecordStore::open(mem_file(), MAX_RELATIONSHIP_ID)?,
            groups: RecordStore::open(mem_file(), GROUP_MAX_ID)?,
            temp_groups: RecordStore::open(mem_file(), GROUP_MAX_ID)?,
            properties: RecordStore::open(mem_file(), PROPERTY_MAX_ID)?,
            dynamic: RecordStore::open(mem_file(), DYNAMIC_MAX_ID)?,
            tokens: TokenHolders::default(),
            counts: CountsStore::default(),
            label_index: TokenIndex::default(),
            type_index: TokenIndex::default(),
        })
    }

    /// Node store.
    pub fn nodes(&self) -> &RecordStore<NodeRecord> {
        &self.nodes
    }

    /// Relationship store.
    pub fn relationships(&self) -> &RecordStore<RelationshipRecord> {
        &self.relationships
    }

    /// Final relationship group store.
    pub fn groups(&self) -> &RecordStore<RelationshipGroupRecord> {
        &self.groups
    }

    /// Scratch group store written during linking and drained by defragmentation.
    pub fn temp_groups(&self) -> &RecordStore<RelationshipGroupRecord> {
        &self.temp_groups
    }

    /// Property store.
    pub fn properties(&self) -> &RecordStore<PropertyRecord> {
        &self.properties
    }

    /// Dynamic record store for long strings, byte arrays and label lists.
    pub fn dynamic(&self) -> &RecordStore<DynamicRecord> {
        &self.dynamic
    }

    /// Token registries.
    pub fn tokens(&self) -> &TokenHolders {
        &self.tokens
    }

    /// Counts store.
    pub fn counts(&self) -> &CountsStore {
        &self.counts
    }

    /// Label to node index.
    pub fn label_index(&self) -> &TokenIndex {
        &self.label_index
    }

    /// Relationship type to relationship index.
    pub fn type_index(&self) -> &TokenIndex {
        &self.type_index
    }

    /// Writes `bytes` as a chain of dynamic records and returns the first id.
    pub fn write_dynamic_chain(
        &self,
        bytes: &[u8],
        ids: &mut BatchingIdGetter<'_>,
    ) -> Result<u64> {
        let chunks: Vec<&[u8]> = if bytes.is_empty() {
            vec![&[][..]]
        } else {
            bytes.chunks(DYNAMIC_DATA_SIZE).collect()
        };
        let mut record_ids = Vec::with_capacity(chunks.len());
        for _ in 0..chunks.len() {
            record_ids.push(ids.next_id()?);
        }
        let mut records = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            records.push(DynamicRecord {
                id: record_ids[i],
                in_use: true,
                next: record_ids.get(i + 1).copied().unwrap_or(NULL_REF),
                data: chunk.to_vec(),
            });
        }
        self.dynamic.update_records(&records)?;
        Ok(record_ids[0])
    }

    /// Reads a dynamic record chain back into one buffer.
    pub fn read_dynamic_chain(&self, first: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut next = first;
        let mut hops = 0u64;
        while next != NULL_REF {
            let record = self.dynamic.get_record(next)?;
            if !record.in_use {
                return Err(ImportError::corruption(format!(
                    "dynamic chain hits unused record {next}"
                )));
            }
            out.extend_from_slice(&record.data);
            next = record.next;
            hops += 1;
            if hops > self.dynamic.high_id() {
                return Err(ImportError::corruption("dynamic chain cycles"));
            }
        }
        Ok(out)
    }

    /// Marks a dynamic chain as unused.
    pub fn delete_dynamic_chain(&self, first: u64) -> Result<()> {
        let mut next = first;
        while next != NULL_REF {
            let mut record = self.dynamic.get_record(next)?;
            if !record.in_use {
                break;
            }
            next = record.next;
            record.in_use = false;
            self.dynamic.update_record(&record)?;
        }
        Ok(())
    }

    /// Encodes node labels, spilling into the dynamic store past the inline capacity.
    pub fn encode_labels(
        &self,
        labels: &[u32],
        ids: &mut BatchingIdGetter<'_>,
    ) -> Result<NodeLabels> {
        if labels.len() <= INLINE_LABELS {
            return Ok(NodeLabels::Inline(labels.iter().copied().collect()));
        }
        let mut bytes = Vec::with_capacity(labels.len() * 4);
        for label in labels {
            bytes.extend_from_slice(&label.to_le_bytes());
        }
        Ok(NodeLabels::Dynamic(self.write_dynamic_chain(&bytes, ids)?))
    }

    /// Label ids of `node`, resolving a dynamic label chain when needed.
    pub fn node_labels(&self, node: &NodeRecord) -> Result<SmallVec<[u32; INLINE_LABELS]>> {
        match &node.labels {
            NodeLabels::Inline(labels) => Ok(labels.clone()),
            NodeLabels::Dynamic(first) => {
                let bytes = self.read_dynamic_chain(*first)?;
                if bytes.len() % 4 != 0 {
                    return Err(ImportError::corruption(format!(
                        "label chain of node {} has {} bytes",
                        node.id,
                        bytes.len()
                    )));
                }
                Ok(bytes
                    .chunks_exact(4)
                    .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
                    .collect())
            }
        }
    }

    /// Marks a property chain and its dynamic values as unused.
    pub fn delete_property_chain(&self, first: u64) -> Result<u64> {
        let mut next = first;
        let mut deleted = 0;
        while next != NULL_REF {
            let mut record = self.properties.get_record(next)?;
            if !record.in_use {
                break;
            }
            for block in &record.blocks {
                if block.kind.is_dynamic() {
                    self.delete_dynamic_chain(block.payload)?;
                }
            }
            next = record.next;
            record.in_use = false;
            self.properties.update_record(&record)?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Flushes all stores and persists tokens, counts and token indexes.
    pub fn success(&self) -> Result<()> {
        self.nodes.flush()?;
        self.relationships.flush()?;
        self.groups.flush()?;
        self.properties.flush()?;
        self.dynamic.flush()?;
        if let Some(dir) = &self.dir {
            write_json(&dir.join(TOKENS_FILE), &self.tokens.snapshot())?;
            write_json(&dir.join(COUNTS_FILE), &self.counts.snapshot())?;
            write_json(&dir.join(LABEL_INDEX_FILE), &self.label_index.snapshot())?;
            write_json(&dir.join(TYPE_INDEX_FILE), &self.type_index.snapshot())?;
            debug!(dir = %dir.display(), "stores.persisted");
        }
        Ok(())
    }

    /// Releases temporary files.
    pub fn close(&self) -> Result<()> {
        if let Some(dir) = &self.dir {
            let temp = dir.join(TEMP_GROUP_FILE);
            if temp.exists() {
                fs::remove_file(temp)?;
            }
        }
        Ok(())
    }

    /// Directory of a file-backed import.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn long_label_lists_spill_and_read_back() -> Result<()> {
        let stores = BatchingStores::in_memory()?;
        let mut ids = BatchingIdGetter::new(stores.dynamic().id_generator(), 8);
        let labels: Vec<u32> = (0..40).collect();
        let encoded = stores.encode_labels(&labels, &mut ids)?;
        assert!(matches!(encoded, NodeLabels::Dynamic(_)));
        let mut node = NodeRecord::new(0);
        node.labels = encoded;
        assert_eq!(stores.node_labels(&node)?.to_vec(), labels);
        Ok(())
    }

    #[test]
    fn create_refuses_non_empty_directory() -> Result<()> {
        let dir = tempdir()?;
        {
            let stores = BatchingStores::create(dir.path())?;
            let mut node = stores.nodes().new_record(0);
            node.in_use = true;
            stores.nodes().update_record(&node)?;
            stores.success()?;
            stores.close()?;
        }
        assert!(dir.path().join(TOKENS_FILE).exists());
        assert!(!dir.path().join(TEMP_GROUP_FILE).exists());
        assert!(BatchingStores::create(dir.path()).is_err());
        Ok(())
    }
}
