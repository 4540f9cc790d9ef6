//! # fieldsync-blob: Replicated attachment storage
//!
//! `fieldsync-blob` stores binary attachments (photos, audio, video) for an
//! offline-first project and replicates them between devices. Every device
//! writes to its own **drive**: an append-only index core of directory
//! records plus one or more data cores of raw blocks.
//!
//! ## Key Concepts
//!
//! - **BlobId**: `type/variant/name`, unique only within a drive
//! - **DriveId**: hex discovery key of a drive's index core
//! - **Index and data availability are independent**: an entry can be
//!   resolvable while its blocks are not local
//! - **Two read paths**: [`BlobStore::get`] waits for peers (bounded by
//!   [`BlobConfig::remote_timeout`]); [`BlobStore::create_read_stream`] and the
//!   entry reads never wait and fail with [`BlobError::BlockNotAvailable`]
//! - **Live download**: [`BlobStore::download`] keeps fetching across every
//!   drive the registry learns about, sparsely by [`BlobFilter`]
//!
//! ## Quick Start
//!
//! ```rust
//! use fieldsync_blob::prelude::*;
//! use fieldsync_core::memory::MemoryCoreRegistry;
//!
//! # #[tokio::main]
//! # async fn main() -> BlobResult<()> {
//! let store = BlobStore::new(MemoryCoreRegistry::random(), BlobConfig::default());
//!
//! let id = BlobId::new("photo", "original", "site-42");
//! let drive_id = store.put(&id, b"jpeg bytes".to_vec()).await?;
//! assert_eq!(&drive_id, store.writer_drive_id());
//!
//! let bytes = store.get(&BlobRef::new(drive_id, id)).await?;
//! assert_eq!(&bytes[..], b"jpeg bytes");
//! # Ok(())
//! # }
//! ```

mod config;
mod download;
mod drive;
mod error;
mod index;
mod store;
mod types;
mod writer;

pub use config::{BlobConfig, DataCorePolicy};
pub use download::{DownloadOptions, DownloadState, DownloadStatus, LiveDownload};
pub use error::{BlobError, BlobResult};
pub use index::{IndexEntry, IndexRecord};
pub use store::BlobStore;
pub use types::{BlobFilter, BlobId, BlobMetadata, BlobPut, BlobRef, BlobStream, ByteStream, DriveId};
pub use writer::BlobWriter;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BlobConfig, BlobError, BlobFilter, BlobId, BlobPut, BlobRef, BlobResult, BlobStore,
        DownloadOptions, DownloadStatus, DriveId, LiveDownload,
    };
}
