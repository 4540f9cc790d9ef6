use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::CoreError;

const DISCOVERY_NAMESPACE: &[u8] = b"fieldsync/discovery";

/// Length in bytes of every key type
pub const KEY_LENGTH: usize = 32;

macro_rules! hex_key {
    ($name:ident) => {
        impl $name {
            /// Wrap raw key bytes
            pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
                Self(bytes)
            }

            /// Get the raw key bytes
            pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
                &self.0
            }

            /// Lowercase hex encoding
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..8])
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s).map_err(|e| CoreError::invalid_key(e.to_string()))?;
                let bytes: [u8; KEY_LENGTH] = bytes.try_into().map_err(|v: Vec<u8>| {
                    CoreError::invalid_key(format!("expected {} bytes, got {}", KEY_LENGTH, v.len()))
                })?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Public key of an append-only core
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreKey([u8; KEY_LENGTH]);

/// Public identifier of a core, safe to share with peers that do not hold the key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiscoveryKey([u8; KEY_LENGTH]);

hex_key!(CoreKey);
hex_key!(DiscoveryKey);

impl CoreKey {
    /// Generate a random key
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive the key of a local writer core from a root secret.
    ///
    /// The same root, purpose and name always produce the same key, which keeps
    /// the local drive id stable across restarts.
    pub fn derive(root: &[u8; KEY_LENGTH], purpose: CorePurpose, name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(root);
        hasher.update(purpose.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Compute the discovery key for this core
    pub fn discovery_key(&self) -> DiscoveryKey {
        let mut hasher = Sha256::new();
        hasher.update(DISCOVERY_NAMESPACE);
        hasher.update(self.0);
        DiscoveryKey(hasher.finalize().into())
    }
}

/// What a core is used for within a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CorePurpose {
    Auth,
    Config,
    Data,
    BlobIndex,
    Blob,
}

impl CorePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Config => "config",
            Self::Data => "data",
            Self::BlobIndex => "blobIndex",
            Self::Blob => "blob",
        }
    }
}

impl fmt::Display for CorePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
