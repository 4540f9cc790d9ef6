use std::time::Duration;

use crate::{BlobError, BlobResult};

const ENV_BLOCK_SIZE: &str = "FIELDSYNC_BLOB_BLOCK_SIZE";
const ENV_MAX_BYTES: &str = "FIELDSYNC_BLOB_MAX_BYTES";
const ENV_REMOTE_TIMEOUT_MS: &str = "FIELDSYNC_BLOB_REMOTE_TIMEOUT_MS";

/// Configuration for blob operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobConfig {
    /// Size of each data block in bytes (the final block of a blob may be shorter)
    pub block_size: usize,

    /// Absolute max size allowed for a single blob (safety guard)
    pub max_blob_bytes: u64,

    /// How long `get` and `entry` wait for a connected peer to supply missing
    /// bytes. `None` waits indefinitely. With no peer connected they fail at once.
    pub remote_timeout: Option<Duration>,

    /// Which data core a write lands in
    pub data_core_policy: DataCorePolicy,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,                  // 64KB
            max_blob_bytes: 5 * 1024 * 1024 * 1024, // 5GB
            remote_timeout: Some(Duration::from_secs(30)),
            data_core_policy: DataCorePolicy::default(),
        }
    }
}

/// Write-time selection of a drive's data core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataCorePolicy {
    /// Every blob goes to one data core
    Single,
    /// One data core per blob type
    #[default]
    PerType,
    /// Start a new data core once the active one holds `max_blocks` blocks
    Rolling { max_blocks: u64 },
}

impl BlobConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `FIELDSYNC_BLOB_*` environment variables
    pub fn from_env() -> BlobResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Like [`BlobConfig::from_env`], reading from an explicit variable set
    pub fn from_vars<I, K, V>(vars: I) -> BlobResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let value = value.as_ref().trim();
            match key.as_ref() {
                ENV_BLOCK_SIZE => config.block_size = parse(ENV_BLOCK_SIZE, value)?,
                ENV_MAX_BYTES => config.max_blob_bytes = parse(ENV_MAX_BYTES, value)?,
                ENV_REMOTE_TIMEOUT_MS => {
                    let millis: u64 = parse(ENV_REMOTE_TIMEOUT_MS, value)?;
                    // 0 disables the timeout
                    config.remote_timeout = (millis > 0).then(|| Duration::from_millis(millis));
                }
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Set block size
    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Set max blob size
    pub fn with_max_blob_bytes(mut self, bytes: u64) -> Self {
        self.max_blob_bytes = bytes;
        self
    }

    /// Set the remote wait bound (`None` waits indefinitely)
    pub fn with_remote_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Set the data core policy
    pub fn with_data_core_policy(mut self, policy: DataCorePolicy) -> Self {
        self.data_core_policy = policy;
        self
    }

    pub fn validate(&self) -> BlobResult<()> {
        if self.block_size == 0 {
            return Err(BlobError::invalid("block_size must be greater than zero"));
        }
        if let DataCorePolicy::Rolling { max_blocks: 0 } = self.data_core_policy {
            return Err(BlobError::invalid("rolling max_blocks must be greater than zero"));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> BlobResult<T> {
    value
        .parse()
        .map_err(|_| BlobError::invalid(format!("{name}: cannot parse {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BlobConfig::default();
        assert_eq!(config.block_size, 65536);
        assert_eq!(config.remote_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.data_core_policy, DataCorePolicy::PerType);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_vars_overrides() {
        let config = BlobConfig::from_vars([
            (ENV_BLOCK_SIZE, "1024"),
            (ENV_MAX_BYTES, "4096"),
            (ENV_REMOTE_TIMEOUT_MS, "250"),
            ("UNRELATED", "x"),
        ])
        .unwrap();

        assert_eq!(config.block_size, 1024);
        assert_eq!(config.max_blob_bytes, 4096);
        assert_eq!(config.remote_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_zero_timeout_waits_forever() {
        let config = BlobConfig::from_vars([(ENV_REMOTE_TIMEOUT_MS, "0")]).unwrap();
        assert_eq!(config.remote_timeout, None);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(BlobConfig::from_vars([(ENV_BLOCK_SIZE, "lots")]).is_err());
        assert!(BlobConfig::from_vars([(ENV_BLOCK_SIZE, "0")]).is_err());
        assert!(BlobConfig::new()
            .with_data_core_policy(DataCorePolicy::Rolling { max_blocks: 0 })
            .validate()
            .is_err());
    }
}
