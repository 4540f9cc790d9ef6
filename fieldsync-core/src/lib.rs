//! # fieldsync-core: replicated append-only logs
//!
//! `fieldsync-core` defines the primitives the rest of fieldsync builds on: append-only
//! block logs ("cores") that replicate between devices, and the process-wide registry
//! that tracks every core a project knows about.
//!
//! ## Key Concepts
//!
//! - **Core**: a growable sequence of blocks with a known `length` and a locally available
//!   `contiguous_length`. Blocks are fetched from peers on request, so a replica can be sparse.
//! - **Discovery key**: a hash of the core key. It identifies a core publicly without
//!   revealing the key.
//! - **Registry**: every core known to this process, keyed by key and discovery key. Cores are
//!   added as replication reveals them and are never removed.
//!
//! ## Quick Start
//!
//! ```rust
//! use bytes::Bytes;
//! use fieldsync_core::prelude::*;
//! use fieldsync_core::memory::MemoryCoreRegistry;
//!
//! # #[tokio::main]
//! # async fn main() -> CoreResult<()> {
//! let alice = MemoryCoreRegistry::random();
//! let bob = MemoryCoreRegistry::random();
//!
//! let writer = alice.writer_core(CorePurpose::BlobIndex);
//! writer.core.append(vec![Bytes::from_static(b"hello")]).await?;
//!
//! let _link = alice.replicate(&bob);
//! let replica = bob.core_by_key(&writer.key).expect("announced over the link");
//! let block = replica.core.get(0, GetOptions::wait()).await?;
//! assert_eq!(block, Some(Bytes::from_static(b"hello")));
//! # Ok(())
//! # }
//! ```

mod core_log;
mod error;
mod keys;
pub mod memory;
mod registry;

pub use crate::core_log::{Core, CoreEvent, DownloadHandle, GetOptions, UpdateOptions};
pub use error::{CoreError, CoreResult};
pub use keys::{CoreKey, CorePurpose, DiscoveryKey, KEY_LENGTH};
pub use registry::{CoreRecord, CoreRegistry, RegistryEvent, DEFAULT_WRITER_NAME};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Core, CoreError, CoreEvent, CoreKey, CorePurpose, CoreRecord, CoreRegistry, CoreResult,
        DiscoveryKey, DownloadHandle, GetOptions, UpdateOptions,
    };
}
