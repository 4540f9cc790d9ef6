use fieldsync_core::CoreError;
use thiserror::Error;

/// Result type for blob operations
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors that can occur during blob operations
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Unknown drive: {drive_id}")]
    UnknownDrive { drive_id: String },

    #[error("Drive has not been initialized: {drive_id}")]
    UninitializedDrive { drive_id: String },

    #[error("Drive has not been replicated: {drive_id}")]
    UnreplicatedDrive { drive_id: String },

    #[error("Blob does not exist: {id}")]
    BlobNotFound { id: String },

    #[error("Block not available: {id}")]
    BlockNotAvailable { id: String },

    #[error("Remote unavailable for {id}: {source}")]
    RemoteUnavailable {
        id: String,
        #[source]
        source: CoreError,
    },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Core error: {source}")]
    Core {
        #[from]
        source: CoreError,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl BlobError {
    pub fn unknown_drive<S: Into<String>>(drive_id: S) -> Self {
        Self::UnknownDrive {
            drive_id: drive_id.into(),
        }
    }

    pub fn uninitialized_drive<S: Into<String>>(drive_id: S) -> Self {
        Self::UninitializedDrive {
            drive_id: drive_id.into(),
        }
    }

    pub fn unreplicated_drive<S: Into<String>>(drive_id: S) -> Self {
        Self::UnreplicatedDrive {
            drive_id: drive_id.into(),
        }
    }

    /// Create a "blob does not exist" error
    pub fn blob_not_found<S: Into<String>>(id: S) -> Self {
        Self::BlobNotFound { id: id.into() }
    }

    /// Create a "block not available" error
    pub fn block_not_available<S: Into<String>>(id: S) -> Self {
        Self::BlockNotAvailable { id: id.into() }
    }

    pub fn remote_unavailable<S: Into<String>>(id: S, source: CoreError) -> Self {
        Self::RemoteUnavailable {
            id: id.into(),
            source,
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Whether the blob could not be located, for any reason short of a storage failure
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UnknownDrive { .. }
                | Self::UninitializedDrive { .. }
                | Self::UnreplicatedDrive { .. }
                | Self::BlobNotFound { .. }
                | Self::RemoteUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_family() {
        assert!(BlobError::unknown_drive("d").is_not_found());
        assert!(BlobError::blob_not_found("photo/original/a").is_not_found());
        assert!(BlobError::remote_unavailable("x", CoreError::Closed).is_not_found());
        assert!(!BlobError::block_not_available("x").is_not_found());
        assert!(!BlobError::invalid("too big").is_not_found());
    }

    #[test]
    fn test_messages_stay_distinct() {
        let missing = BlobError::blob_not_found("photo/original/a").to_string();
        let local = BlobError::block_not_available("photo/original/a").to_string();
        assert!(missing.contains("Blob does not exist"));
        assert!(local.contains("Block not available"));
    }
}
