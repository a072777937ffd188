//! Encoding of property values into property record chains.

use smallvec::SmallVec;

use crate::storage::record::BLOCKS_PER_PROPERTY_RECORD;
use crate::storage::{BatchingIdGetter, BatchingStores, PropertyBlock, PropertyKind, PropertyRecord};
use crate::types::{ImportError, PropId, Result, Value, NULL_REF};

const INLINE_BYTES: usize = 8;

fn inline_payload(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; INLINE_BYTES];
    raw[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}

/// Reusable scratch space turning an entity's properties into a property chain.
#[derive(Default)]
pub struct PropertyEncoder {
    blocks: Vec<PropertyBlock>,
    records: Vec<PropertyRecord>,
}

impl PropertyEncoder {
    /// Creates an encoder with empty scratch space.
    pub fn new() -> Self {
        Self::default()
    }

    fn encode_block(
        stores: &BatchingStores,
        key: PropId,
        value: &Value,
        dynamic_ids: &mut BatchingIdGetter<'_>,
    ) -> Result<Option<PropertyBlock>> {
        let block = |kind, inline_len: usize, payload| PropertyBlock {
            key,
            kind,
            inline_len: inline_len as u8,
            payload,
        };
        Ok(Some(match value {
            Value::Null => return Ok(None),
            Value::Bool(v) => block(PropertyKind::Bool, 0, *v as u64),
            Value::Int(v) => block(PropertyKind::Int, 0, *v as u64),
            Value::Float(v) => block(PropertyKind::Float, 0, v.to_bits()),
            Value::Str(s) if s.len() <= INLINE_BYTES => {
                block(PropertyKind::ShortStr, s.len(), inline_payload(s.as_bytes()))
            }
            Value::Str(s) => block(
                PropertyKind::Str,
                0,
                stores.write_dynamic_chain(s.as_bytes(), dynamic_ids)?,
            ),
            Value::Bytes(b) if b.len() <= INLINE_BYTES => {
                block(PropertyKind::ShortBytes, b.len(), inline_payload(b))
            }
            Value::Bytes(b) => block(
                PropertyKind::Bytes,
                0,
                stores.write_dynamic_chain(b, dynamic_ids)?,
            ),
        }))
    }

    /// Writes `properties` as a chain and returns its first record id, or
    /// [`NULL_REF`] when nothing had to be stored. Null values are skipped.
    pub fn write(
        &mut self,
        stores: &BatchingStores,
        properties: &[(u32, Value)],
        property_ids: &mut BatchingIdGetter<'_>,
        dynamic_ids: &mut BatchingIdGetter<'_>,
    ) -> Result<u64> {
        self.blocks.clear();
        for (key, value) in properties {
            if let Some(block) = Self::encode_block(stores, PropId(*key), value, dynamic_ids)? {
                self.blocks.push(block);
            }
        }
        if self.blocks.is_empty() {
            return Ok(NULL_REF);
        }
        self.records.clear();
        for chunk in self.blocks.chunks(BLOCKS_PER_PROPERTY_RECORD) {
            let id = property_ids.next_id()?;
            let prev = self.records.last().map(|r| r.id).unwrap_or(NULL_REF);
            if let Some(last) = self.records.last_mut() {
                last.next = id;
            }
            self.records.push(PropertyRecord {
                id,
                in_use: true,
                prev,
                next: NULL_REF,
                blocks: chunk.iter().copied().collect(),
            });
        }
        stores.properties().update_records(&self.records)?;
        Ok(self.records[0].id)
    }

    /// Number of blocks written by the last [`Self::write`].
    pub fn last_block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// Decodes one property block back into a value.
pub fn decode_block(stores: &BatchingStores, block: &PropertyBlock) -> Result<Value> {
    let inline = |len: u8| -> Result<Vec<u8>> {
        let len = len as usize;
        if len > INLINE_BYTES {
            return Err(ImportError::corruption(format!("inline length {len}")));
        }
        Ok(block.payload.to_le_bytes()[..len].to_vec())
    };
    Ok(match block.kind {
        PropertyKind::Bool => Value::Bool(block.payload != 0),
        PropertyKind::Int => Value::Int(block.payload as i64),
        PropertyKind::Float => Value::Float(f64::from_bits(block.payload)),
        PropertyKind::ShortStr => Value::Str(
            String::from_utf8(inline(block.inline_len)?)
                .map_err(|_| ImportError::corruption("inline string is not UTF-8"))?,
        ),
        PropertyKind::Str => Value::Str(
            String::from_utf8(stores.read_dynamic_chain(block.payload)?)
                .map_err(|_| ImportError::corruption("string chain is not UTF-8"))?,
        ),
        PropertyKind::ShortBytes => Value::Bytes(inline(block.inline_len)?),
        PropertyKind::Bytes => Value::Bytes(stores.read_dynamic_chain(block.payload)?),
    })
}

/// Reads a whole property chain as `(key, value)` pairs.
pub fn read_properties(stores: &BatchingStores, first: u64) -> Result<SmallVec<[(u32, Value); 4]>> {
    let mut out = SmallVec::new();
    let mut next = first;
    let mut hops = 0u64;
    while next != NULL_REF {
        let record = stores.properties().get_record(next)?;
        if !record.in_use {
            return Err(ImportError::corruption(format!(
                "property chain hits unused record {next}"
            )));
        }
        for block in &record.blocks {
            out.push((block.key.0, decode_block(stores, block)?));
        }
        next = record.next;
        hops += 1;
        if hops > stores.properties().high_id() {
            return Err(ImportError::corruption("property chain cycles"));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_split_every_four_blocks_and_skip_nulls() -> Result<()> {
        let stores = BatchingStores::in_memory()?;
        let mut property_ids = BatchingIdGetter::new(stores.properties().id_generator(), 8);
        let mut dynamic_ids = BatchingIdGetter::new(stores.dynamic().id_generator(), 8);
        let long = "x".repeat(300);
        let properties = vec![
            (0, Value::Int(-5)),
            (1, Value::Null),
            (2, Value::from("short")),
            (3, Value::from(long.clone())),
            (4, Value::Bool(true)),
            (5, Value::Float(1.5)),
            (6, Value::Bytes(vec![1, 2, 3])),
        ];
        let mut encoder = PropertyEncoder::new();
        let first = encoder.write(&stores, &properties, &mut property_ids, &mut dynamic_ids)?;
        assert_eq!(encoder.last_block_count(), 6);

        let head = stores.properties().get_record(first)?;
        assert_eq!(head.blocks.len(), 4);
        assert_ne!(head.next, NULL_REF);
        let tail = stores.properties().get_record(head.next)?;
        assert_eq!(tail.prev, first);
        assert_eq!(tail.blocks.len(), 2);

        let read: Vec<_> = read_properties(&stores, first)?.into_vec();
        let expected: Vec<_> = properties.into_iter().filter(|(_, v)| !v.is_null()).collect();
        assert_eq!(read, expected);
        Ok(())
    }

    #[test]
    fn no_properties_means_no_records() -> Result<()> {
        let stores = BatchingStores::in_memory()?;
        let mut property_ids = BatchingIdGetter::new(stores.properties().id_generator(), 8);
        let mut dynamic_ids = BatchingIdGetter::new(stores.dynamic().id_generator(), 8);
        let first = PropertyEncoder::new().write(&stores, &[(0, Value::Null)], &mut property_ids, &mut dynamic_ids)?;
        assert_eq!(first, NULL_REF);
        assert_eq!(stores.properties().high_id(), 0);
        Ok(())
    }
}
