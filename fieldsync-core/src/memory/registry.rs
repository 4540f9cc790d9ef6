use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rand::RngCore;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::memory::MemoryCore;
use crate::{
    Core, CoreKey, CorePurpose, CoreRecord, CoreRegistry, DiscoveryKey, RegistryEvent, KEY_LENGTH,
};

const EVENT_CAPACITY: usize = 1024;

static LINK_ID: AtomicU64 = AtomicU64::new(1);

fn next_link_id() -> u64 {
    LINK_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone)]
struct Entry {
    core: MemoryCore,
    purpose: CorePurpose,
}

impl Entry {
    fn record(&self) -> CoreRecord {
        CoreRecord::new(Arc::new(self.core.clone()), self.purpose)
    }
}

struct RegistryInner {
    root: [u8; KEY_LENGTH],
    entries: RwLock<HashMap<DiscoveryKey, Entry>>,
    /// Connected registries, keyed by replication link id
    links: RwLock<HashMap<u64, Weak<RegistryInner>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl RegistryInner {
    fn get(&self, discovery_key: &DiscoveryKey) -> Option<Entry> {
        self.entries.read().get(discovery_key).cloned()
    }

    fn snapshot(&self) -> Vec<Entry> {
        self.entries.read().values().cloned().collect()
    }

    fn insert(&self, key: CoreKey, purpose: CorePurpose, writable: bool) -> Entry {
        let discovery_key = key.discovery_key();
        let (entry, added) = {
            let mut entries = self.entries.write();
            match entries.get(&discovery_key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let core = if writable {
                        MemoryCore::new_writer(key)
                    } else {
                        MemoryCore::new_remote(key)
                    };
                    let entry = Entry { core, purpose };
                    entries.insert(discovery_key, entry.clone());
                    (entry, true)
                }
            }
        };

        if added {
            debug!(core = %discovery_key, %purpose, writable, "core added");
            let _ = self.events.send(RegistryEvent::CoreAdded(entry.record()));
            self.announce(&entry);
        }
        entry
    }

    /// Tell every connected registry about a core and link the replicas
    fn announce(&self, entry: &Entry) {
        let links: Vec<(u64, Arc<RegistryInner>)> = self
            .links
            .read()
            .iter()
            .filter_map(|(id, remote)| remote.upgrade().map(|remote| (*id, remote)))
            .collect();

        for (link, remote) in links {
            let remote_entry = remote.insert(entry.core.key(), entry.purpose, false);
            MemoryCore::attach(&entry.core, &remote_entry.core, link);
        }
    }

    fn detach(&self, link: u64) {
        self.links.write().remove(&link);
        for entry in self.snapshot() {
            entry.core.detach(link);
        }
    }
}

/// In-process core registry.
///
/// Registries replicate with each other through [`MemoryCoreRegistry::replicate`],
/// which stands in for a network connection between two devices.
#[derive(Clone)]
pub struct MemoryCoreRegistry {
    inner: Arc<RegistryInner>,
}

impl MemoryCoreRegistry {
    /// Create a registry whose writer cores derive from `root`
    pub fn new(root: [u8; KEY_LENGTH]) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                root,
                entries: RwLock::new(HashMap::new()),
                links: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Create a registry with a random root secret
    pub fn random() -> Self {
        let mut root = [0u8; KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut root);
        Self::new(root)
    }

    /// Open a replication link with another registry.
    ///
    /// Both sides learn every core the other knows, now and while the link is
    /// open. Replicas exchange their lengths, but blocks only move to satisfy
    /// download requests.
    pub fn replicate(&self, other: &MemoryCoreRegistry) -> ReplicationLink {
        let link = next_link_id();
        self.inner
            .links
            .write()
            .insert(link, Arc::downgrade(&other.inner));
        other
            .inner
            .links
            .write()
            .insert(link, Arc::downgrade(&self.inner));

        for entry in self.inner.snapshot() {
            let remote = other.inner.insert(entry.core.key(), entry.purpose, false);
            MemoryCore::attach(&entry.core, &remote.core, link);
        }
        for entry in other.inner.snapshot() {
            let local = self.inner.insert(entry.core.key(), entry.purpose, false);
            MemoryCore::attach(&local.core, &entry.core, link);
        }

        info!(link, "replication link opened");
        ReplicationLink {
            id: link,
            sides: Some((Arc::downgrade(&self.inner), Arc::downgrade(&other.inner))),
        }
    }

    /// Number of open replication links
    pub fn link_count(&self) -> usize {
        self.inner.links.read().len()
    }
}

impl Default for MemoryCoreRegistry {
    fn default() -> Self {
        Self::random()
    }
}

impl CoreRegistry for MemoryCoreRegistry {
    fn named_writer_core(&self, purpose: CorePurpose, name: &str) -> CoreRecord {
        let key = CoreKey::derive(&self.inner.root, purpose, name);
        self.inner.insert(key, purpose, true).record()
    }

    fn core_by_key(&self, key: &CoreKey) -> Option<CoreRecord> {
        self.core_by_discovery_key(&key.discovery_key())
    }

    fn core_by_discovery_key(&self, discovery_key: &DiscoveryKey) -> Option<CoreRecord> {
        self.inner.get(discovery_key).map(|entry| entry.record())
    }

    fn add_core(&self, key: CoreKey, purpose: CorePurpose) -> CoreRecord {
        self.inner.insert(key, purpose, false).record()
    }

    fn cores(&self) -> Vec<CoreRecord> {
        self.inner.snapshot().iter().map(Entry::record).collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }
}

/// An open replication link between two registries.
///
/// Dropping the link disconnects it.
pub struct ReplicationLink {
    id: u64,
    sides: Option<(Weak<RegistryInner>, Weak<RegistryInner>)>,
}

impl ReplicationLink {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Close the link. Blocks already replicated stay local on both sides.
    pub fn disconnect(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some((a, b)) = self.sides.take() {
            for side in [a, b] {
                if let Some(inner) = side.upgrade() {
                    inner.detach(self.id);
                }
            }
            info!(link = self.id, "replication link closed");
        }
    }
}

impl Drop for ReplicationLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn test_link_lifecycle() {
        let alice = MemoryCoreRegistry::random();
        let bob = MemoryCoreRegistry::random();

        let link = alice.replicate(&bob);
        assert_eq!(alice.link_count(), 1);
        assert_eq!(bob.link_count(), 1);
        assert!(logs_contain("replication link opened"));

        drop(link);
        assert_eq!(alice.link_count(), 0);
        assert_eq!(bob.link_count(), 0);
        assert!(logs_contain("replication link closed"));
    }

    #[test]
    fn test_writer_cores_are_writable_and_distinct() {
        let registry = MemoryCoreRegistry::new([9u8; KEY_LENGTH]);
        let index = registry.writer_core(CorePurpose::BlobIndex);
        let data = registry.named_writer_core(CorePurpose::Blob, "photo");

        assert!(index.core.writable());
        assert!(data.core.writable());
        assert_ne!(index.key, data.key);
        assert_eq!(registry.cores().len(), 2);
    }
}
