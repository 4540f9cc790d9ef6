use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::{Core, CoreKey, CorePurpose, DiscoveryKey};

/// Name of the writer core returned by [`CoreRegistry::writer_core`]
pub const DEFAULT_WRITER_NAME: &str = "default";

/// A core known to the registry
#[derive(Clone)]
pub struct CoreRecord {
    pub core: Arc<dyn Core>,
    pub key: CoreKey,
    pub discovery_key: DiscoveryKey,
    pub purpose: CorePurpose,
}

impl CoreRecord {
    pub fn new(core: Arc<dyn Core>, purpose: CorePurpose) -> Self {
        let key = core.key();
        Self {
            discovery_key: key.discovery_key(),
            key,
            core,
            purpose,
        }
    }
}

impl fmt::Debug for CoreRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreRecord")
            .field("discovery_key", &self.discovery_key)
            .field("purpose", &self.purpose)
            .field("writable", &self.core.writable())
            .field("length", &self.core.length())
            .finish()
    }
}

/// Registry notifications
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// Emitted once for every core the registry learns about
    CoreAdded(CoreRecord),
}

/// Process-wide set of cores, keyed by key and discovery key.
///
/// The set only grows. Consumers must expect cores to appear at any time and
/// should subscribe before taking a snapshot with [`CoreRegistry::cores`].
pub trait CoreRegistry: Send + Sync {
    /// The local writer core for a purpose
    fn writer_core(&self, purpose: CorePurpose) -> CoreRecord {
        self.named_writer_core(purpose, DEFAULT_WRITER_NAME)
    }

    /// An additional local writer core, created on first use
    fn named_writer_core(&self, purpose: CorePurpose, name: &str) -> CoreRecord;

    fn core_by_key(&self, key: &CoreKey) -> Option<CoreRecord>;

    fn core_by_discovery_key(&self, discovery_key: &DiscoveryKey) -> Option<CoreRecord>;

    /// Register a remote core before any of its data is known. Idempotent.
    fn add_core(&self, key: CoreKey, purpose: CorePurpose) -> CoreRecord;

    /// Snapshot of every known core
    fn cores(&self) -> Vec<CoreRecord>;

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;
}
