use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use fieldsync_core::DiscoveryKey;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{BlobError, BlobResult};

/// Stream of bytes for blob content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Stream of blob blocks read from a drive
pub type BlobStream = Pin<Box<dyn Stream<Item = BlobResult<Bytes>> + Send>>;

/// Logical identity of an attachment within one drive
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId {
    /// Coarse content category, e.g. "photo"
    #[serde(rename = "type")]
    pub blob_type: String,
    /// Rendition of the asset, e.g. "original" or "thumbnail"
    pub variant: String,
    pub name: String,
}

impl BlobId {
    pub fn new<T, V, N>(blob_type: T, variant: V, name: N) -> Self
    where
        T: Into<String>,
        V: Into<String>,
        N: Into<String>,
    {
        Self {
            blob_type: blob_type.into(),
            variant: variant.into(),
            name: name.into(),
        }
    }

    /// New id with a random name
    pub fn generate<T: Into<String>, V: Into<String>>(blob_type: T, variant: V) -> Self {
        Self::new(blob_type, variant, Uuid::new_v4().simple().to_string())
    }

    /// Same asset, another rendition
    pub fn with_variant<V: Into<String>>(&self, variant: V) -> Self {
        Self::new(self.blob_type.clone(), variant, self.name.clone())
    }

    pub(crate) fn validate(&self) -> BlobResult<()> {
        for (field, value) in [
            ("type", &self.blob_type),
            ("variant", &self.variant),
            ("name", &self.name),
        ] {
            if value.is_empty() {
                return Err(BlobError::invalid(format!("blob {field} must not be empty")));
            }
            if value.contains('/') {
                return Err(BlobError::invalid(format!("blob {field} must not contain '/'")));
            }
        }
        Ok(())
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.blob_type, self.variant, self.name)
    }
}

/// Identifier of a drive: the hex discovery key of its index core
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriveId(pub String);

impl DriveId {
    pub fn from_discovery_key(discovery_key: &DiscoveryKey) -> Self {
        Self(discovery_key.to_hex())
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse back into a discovery key. `None` if the id is malformed.
    pub fn as_discovery_key(&self) -> Option<DiscoveryKey> {
        self.0.parse().ok()
    }
}

impl From<DiscoveryKey> for DriveId {
    fn from(discovery_key: DiscoveryKey) -> Self {
        Self::from_discovery_key(&discovery_key)
    }
}

impl fmt::Display for DriveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A blob addressed by drive and identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    pub drive_id: DriveId,
    #[serde(flatten)]
    pub blob_id: BlobId,
}

impl BlobRef {
    pub fn new(drive_id: DriveId, blob_id: BlobId) -> Self {
        Self { drive_id, blob_id }
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.blob_id, self.drive_id)
    }
}

/// Options for a blob write
#[derive(Debug, Clone, Default)]
pub struct BlobPut {
    pub mime_type: Option<String>,
    pub attributes: serde_json::Value,
}

impl BlobPut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mime_type<S: Into<String>>(mut self, mime_type: S) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_attribute<K: Into<String>, V: Serialize>(mut self, key: K, value: V) -> Self {
        if self.attributes.is_null() {
            self.attributes = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(obj) = self.attributes.as_object_mut() {
            obj.insert(key.into(), serde_json::to_value(value).unwrap_or(serde_json::Value::Null));
        }
        self
    }
}

/// Metadata stored alongside an index entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub attributes: serde_json::Value,
    /// Unix timestamp (seconds) of the write
    #[serde(default)]
    pub created_at: i64,
}

impl BlobMetadata {
    pub(crate) fn from_put(put: BlobPut) -> Self {
        Self {
            mime_type: put.mime_type,
            attributes: put.attributes,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Which blobs a live download fetches.
///
/// Maps a blob type to its allowed variants. A type that is absent is never
/// downloaded; an empty variant list admits every variant of that type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobFilter {
    types: BTreeMap<String, BTreeSet<String>>,
}

impl BlobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow the listed variants of a type
    pub fn with_type<T, I, V>(mut self, blob_type: T, variants: I) -> Self
    where
        T: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.types
            .entry(blob_type.into())
            .or_default()
            .extend(variants.into_iter().map(Into::into));
        self
    }

    /// Allow every variant of a type
    pub fn with_all_variants<T: Into<String>>(mut self, blob_type: T) -> Self {
        self.types.insert(blob_type.into(), BTreeSet::new());
        self
    }

    pub fn matches(&self, blob_id: &BlobId) -> bool {
        match self.types.get(&blob_id.blob_type) {
            Some(variants) => variants.is_empty() || variants.contains(&blob_id.variant),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_id_display_and_serde() {
        let id = BlobId::new("photo", "original", "abc");
        assert_eq!(id.to_string(), "photo/original/abc");

        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json["type"], "photo");
        assert_eq!(id.with_variant("thumbnail").to_string(), "photo/thumbnail/abc");
    }

    #[test]
    fn test_blob_id_validation() {
        assert!(BlobId::generate("photo", "original").validate().is_ok());
        assert!(BlobId::new("", "original", "a").validate().is_err());
        assert!(BlobId::new("photo", "orig/inal", "a").validate().is_err());
    }

    #[test]
    fn test_drive_id_parses_back() {
        let key = fieldsync_core::CoreKey::random().discovery_key();
        let drive_id = DriveId::from(key);
        assert_eq!(drive_id.as_discovery_key(), Some(key));
        assert_eq!(DriveId::from_string("nope".into()).as_discovery_key(), None);
    }

    #[test]
    fn test_filter_matching() {
        let filter = BlobFilter::new()
            .with_type("photo", ["original", "preview"])
            .with_all_variants("audio");

        assert!(filter.matches(&BlobId::new("photo", "original", "a")));
        assert!(filter.matches(&BlobId::new("photo", "preview", "a")));
        assert!(!filter.matches(&BlobId::new("photo", "thumbnail", "a")));
        assert!(filter.matches(&BlobId::new("audio", "mp3", "a")));
        assert!(!filter.matches(&BlobId::new("video", "original", "a")));
    }

    #[test]
    fn test_filter_from_json() {
        let filter: BlobFilter =
            serde_json::from_str(r#"{"photo":["original"],"audio":[]}"#).unwrap();
        assert!(filter.matches(&BlobId::new("photo", "original", "a")));
        assert!(filter.matches(&BlobId::new("audio", "m4a", "a")));
        assert!(!filter.matches(&BlobId::new("photo", "preview", "a")));
    }
}
