use std::ops::Range;

use bytes::Bytes;
use fieldsync_core::CoreKey;
use serde::{Deserialize, Serialize};

use crate::{BlobError, BlobId, BlobMetadata, BlobResult};

/// One record in a drive's index core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexRecord {
    /// Binds a data core to a slot. Appended before the slot's first entry.
    DataCore {
        slot: u32,
        key: CoreKey,
        /// Writer-side name the data core was derived from
        #[serde(default)]
        name: String,
    },
    Entry(IndexEntry),
}

/// Directory record mapping a blob to a block range in one of the drive's data cores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub blob_id: BlobId,
    /// Slot of the data core holding the blocks
    pub data_core: u32,
    pub block_offset: u64,
    pub block_length: u64,
    pub byte_length: u64,
    #[serde(default)]
    pub metadata: BlobMetadata,
}

impl IndexEntry {
    pub fn block_range(&self) -> Range<u64> {
        self.block_offset..self.block_offset.saturating_add(self.block_length)
    }

    /// Reject entries whose block range cannot describe `byte_length` bytes.
    ///
    /// Every block holds at least one byte, so a blob spans no more blocks
    /// than it has bytes and a non-empty blob spans at least one.
    pub fn validate(&self) -> BlobResult<()> {
        if self.block_offset.checked_add(self.block_length).is_none() {
            return Err(BlobError::invalid(format!(
                "{}: block range overflows at offset {}",
                self.blob_id, self.block_offset
            )));
        }
        if self.block_length > self.byte_length || (self.byte_length > 0) != (self.block_length > 0) {
            return Err(BlobError::invalid(format!(
                "{}: {} blocks cannot hold {} bytes",
                self.blob_id, self.block_length, self.byte_length
            )));
        }
        Ok(())
    }
}

impl IndexRecord {
    pub fn encode(&self) -> BlobResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(block: &[u8]) -> BlobResult<Self> {
        let record: Self = serde_json::from_slice(block)?;
        if let Self::Entry(entry) = &record {
            entry.validate()?;
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> IndexEntry {
        IndexEntry {
            blob_id: BlobId::new("photo", "original", "a"),
            data_core: 1,
            block_offset: 4,
            block_length: 3,
            byte_length: 150_000,
            metadata: BlobMetadata::default(),
        }
    }

    fn data_core_record(key: CoreKey) -> IndexRecord {
        IndexRecord::DataCore {
            slot: 0,
            key,
            name: "type:photo".to_string(),
        }
    }

    #[test]
    fn test_block_range() {
        assert_eq!(entry().block_range(), 4..7);
    }

    #[test]
    fn test_record_layout() {
        let key = CoreKey::from_bytes([2u8; 32]);
        let json: serde_json::Value =
            serde_json::from_slice(&data_core_record(key).encode().unwrap()).unwrap();
        assert_eq!(json["kind"], "data_core");
        assert_eq!(json["key"], key.to_hex());
        assert_eq!(json["name"], "type:photo");

        let json: serde_json::Value =
            serde_json::from_slice(&IndexRecord::Entry(entry()).encode().unwrap()).unwrap();
        assert_eq!(json["kind"], "entry");
        assert_eq!(json["blob_id"]["type"], "photo");
        assert_eq!(json["block_length"], 3);
    }

    #[test]
    fn test_decode_tolerates_missing_metadata() {
        let raw = br#"{"kind":"entry","blob_id":{"type":"audio","variant":"m4a","name":"n"},
            "data_core":0,"block_offset":0,"block_length":1,"byte_length":10}"#;
        let IndexRecord::Entry(entry) = IndexRecord::decode(raw).unwrap() else {
            panic!("expected an entry record");
        };
        assert_eq!(entry.metadata, BlobMetadata::default());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(IndexRecord::decode(b"not json").is_err());
        assert!(IndexRecord::decode(br#"{"kind":"mystery"}"#).is_err());
    }

    #[test]
    fn test_decode_rejects_overflowing_range() {
        let raw = br#"{"kind":"entry","blob_id":{"type":"photo","variant":"original","name":"x"},
            "data_core":0,"block_offset":18446744073709551615,"block_length":2,"byte_length":10}"#;
        assert!(matches!(IndexRecord::decode(raw), Err(BlobError::Invalid { .. })));
    }

    #[test]
    fn test_decode_rejects_impossible_lengths() {
        let mut wide = entry();
        wide.block_length = wide.byte_length + 1;
        let raw = IndexRecord::Entry(wide).encode().unwrap();
        assert!(matches!(IndexRecord::decode(&raw), Err(BlobError::Invalid { .. })));

        let mut hollow = entry();
        hollow.block_length = 0;
        let raw = IndexRecord::Entry(hollow).encode().unwrap();
        assert!(matches!(IndexRecord::decode(&raw), Err(BlobError::Invalid { .. })));

        let mut empty = entry();
        empty.block_length = 0;
        empty.byte_length = 0;
        let raw = IndexRecord::Entry(empty).encode().unwrap();
        assert!(IndexRecord::decode(&raw).is_ok());
    }

    #[test]
    fn test_decode_data_core_without_name() {
        let key = CoreKey::from_bytes([4u8; 32]);
        let raw = format!(r#"{{"kind":"data_core","slot":3,"key":"{}"}}"#, key.to_hex());
        let record = IndexRecord::decode(raw.as_bytes()).unwrap();
        assert_eq!(
            record,
            IndexRecord::DataCore {
                slot: 3,
                key,
                name: String::new()
            }
        );
    }
}
