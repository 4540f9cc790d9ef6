use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use fieldsync_core::{
    Core, CoreError, CoreKey, CorePurpose, CoreRecord, CoreRegistry, DiscoveryKey, GetOptions,
    UpdateOptions,
};
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::{
    BlobError, BlobId, BlobResult, BlobStream, DataCorePolicy, DriveId, IndexEntry, IndexRecord,
};

/// How a read treats bytes that are not local
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadMode {
    /// Wait for peers to supply missing bytes, up to `timeout`
    Wait { timeout: Option<Duration> },
    /// Fail on anything that is not already local
    Local,
}

/// Decoded view of an index core
#[derive(Default)]
struct IndexState {
    /// Length of the contiguous prefix folded into this state
    folded: u64,
    data_cores: BTreeMap<u32, CoreKey>,
    /// Newest entry per identity, with its index position
    latest: HashMap<BlobId, (u64, IndexEntry)>,
    /// Highest announced `rolling:<n>` generation
    rolling: Option<u64>,
}

impl IndexState {
    fn apply(&mut self, position: u64, record: IndexRecord) {
        match record {
            IndexRecord::DataCore { slot, key, name } => {
                self.data_cores.insert(slot, key);
                let generation = name
                    .strip_prefix("rolling:")
                    .and_then(|n| n.parse::<u64>().ok());
                if let Some(generation) = generation {
                    self.rolling = Some(self.rolling.map_or(generation, |g| g.max(generation)));
                }
            }
            IndexRecord::Entry(entry) => match self.latest.get(&entry.blob_id) {
                Some((newer, _)) if *newer > position => {}
                _ => {
                    self.latest.insert(entry.blob_id.clone(), (position, entry));
                }
            },
        }
    }

    fn slot_of(&self, key: &CoreKey) -> Option<u32> {
        self.data_cores
            .iter()
            .find(|(_, candidate)| *candidate == key)
            .map(|(slot, _)| *slot)
    }

    fn next_slot(&self) -> u32 {
        self.data_cores.keys().next_back().map_or(0, |slot| slot + 1)
    }
}

/// A data core reserved for one write
pub(crate) struct DataCoreLease {
    pub slot: u32,
    pub core: Arc<dyn Core>,
    pub guard: OwnedMutexGuard<()>,
}

/// One device's index core and the data cores it references
pub(crate) struct Drive {
    id: DriveId,
    index: CoreRecord,
    registry: Arc<dyn CoreRegistry>,
    state: Mutex<IndexState>,
    /// Serializes index appends
    append_lock: Mutex<()>,
    data_locks: parking_lot::Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl Drive {
    fn new(index: CoreRecord, registry: Arc<dyn CoreRegistry>) -> Self {
        Self {
            id: DriveId::from_discovery_key(&index.discovery_key),
            index,
            registry,
            state: Mutex::new(IndexState::default()),
            append_lock: Mutex::new(()),
            data_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn id(&self) -> &DriveId {
        &self.id
    }

    /// Resolve the newest entry for a blob identity
    pub(crate) async fn entry(&self, blob_id: &BlobId, mode: ReadMode) -> BlobResult<IndexEntry> {
        let id = blob_id.to_string();
        self.prepare_index(&id, mode).await?;
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;

        match state.latest.get(blob_id) {
            Some((_, entry)) => Ok(entry.clone()),
            None => Err(BlobError::blob_not_found(id)),
        }
    }

    /// Newest entry per identity from the local index, in index order
    pub(crate) async fn entries(&self) -> BlobResult<Vec<IndexEntry>> {
        self.prepare_index(self.id.as_str(), ReadMode::Local).await?;
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;

        let mut entries: Vec<(u64, IndexEntry)> = state.latest.values().cloned().collect();
        entries.sort_by_key(|(position, _)| *position);
        Ok(entries.into_iter().map(|(_, entry)| entry).collect())
    }

    /// Read a whole blob into memory
    pub(crate) async fn read(&self, entry: &IndexEntry, mode: ReadMode) -> BlobResult<Bytes> {
        let data = self.data_core(entry).await?;
        let range = entry.block_range();
        let id = entry.blob_id.to_string();

        if !data.has_range(range.clone()) {
            let ReadMode::Wait { timeout } = mode else {
                return Err(BlobError::block_not_available(id));
            };
            if data.peer_count() == 0 {
                return Err(BlobError::remote_unavailable(id, CoreError::no_peers(&range)));
            }
            let request = data.download(range.clone());
            if let Err(source) = request.done_within(timeout).await {
                return Err(BlobError::remote_unavailable(id, source));
            }
        }

        // Blocks may be cleared underneath us; any gap fails the whole read
        let mut blocks = Vec::new();
        for index in range {
            match data.get(index, GetOptions::local()).await? {
                Some(block) => blocks.push(block),
                None => return Err(BlobError::block_not_available(id)),
            }
        }
        let read: usize = blocks.iter().map(Bytes::len).sum();
        if read as u64 != entry.byte_length {
            return Err(BlobError::invalid(format!(
                "{id}: expected {} bytes, read {read}",
                entry.byte_length
            )));
        }

        let mut buf = BytesMut::with_capacity(read);
        for block in &blocks {
            buf.extend_from_slice(block);
        }
        Ok(buf.freeze())
    }

    /// Stream a blob from local blocks only
    pub(crate) async fn stream(&self, entry: &IndexEntry) -> BlobResult<BlobStream> {
        let data = self.data_core(entry).await?;
        let range = entry.block_range();
        let id = entry.blob_id.to_string();
        if !data.has_range(range.clone()) {
            return Err(BlobError::block_not_available(id));
        }

        Ok(Box::pin(async_stream::stream! {
            for index in range {
                match data.get(index, GetOptions::local()).await {
                    Ok(Some(block)) => yield Ok(block),
                    Ok(None) => {
                        yield Err(BlobError::block_not_available(id.clone()));
                        return;
                    }
                    Err(error) => {
                        yield Err(BlobError::from(error));
                        return;
                    }
                }
            }
        }))
    }

    /// Remove an entry's local blocks
    pub(crate) async fn clear(&self, entry: &IndexEntry) -> BlobResult<()> {
        let data = match self.data_core(entry).await {
            Ok(data) => data,
            Err(BlobError::BlockNotAvailable { .. }) => return Ok(()),
            Err(error) => return Err(error),
        };
        data.clear(entry.block_range()).await?;
        debug!(drive = %self.id, blob = %entry.blob_id, "blob blocks cleared");
        Ok(())
    }

    /// Reserve the data core a new write for `blob_id` lands in.
    ///
    /// A data core gets a slot, announced in the index, the first time it is used.
    pub(crate) async fn lease_data_core(
        &self,
        blob_id: &BlobId,
        policy: DataCorePolicy,
    ) -> BlobResult<DataCoreLease> {
        let (slot, record) = {
            let _append = self.append_lock.lock().await;
            let mut state = self.state.lock().await;
            self.refresh(&mut state).await?;

            let name = self.data_core_name(&state, blob_id, policy);
            let record = self.registry.named_writer_core(CorePurpose::Blob, &name);
            let slot = match state.slot_of(&record.key) {
                Some(slot) => slot,
                None => {
                    let slot = state.next_slot();
                    let announcement = IndexRecord::DataCore {
                        slot,
                        key: record.key,
                        name: name.clone(),
                    };
                    self.index.core.append(vec![announcement.encode()?]).await?;
                    self.refresh(&mut state).await?;
                    debug!(drive = %self.id, slot, name, "data core allocated");
                    slot
                }
            };
            (slot, record)
        };

        let lock = self
            .data_locks
            .lock()
            .entry(slot)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        Ok(DataCoreLease {
            slot,
            core: record.core,
            guard,
        })
    }

    pub(crate) async fn append_entry(&self, entry: IndexEntry) -> BlobResult<()> {
        let record = IndexRecord::Entry(entry).encode()?;
        let _append = self.append_lock.lock().await;
        self.index.core.append(vec![record]).await?;
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await
    }

    fn data_core_name(&self, state: &IndexState, blob_id: &BlobId, policy: DataCorePolicy) -> String {
        match policy {
            DataCorePolicy::Single => "data".to_string(),
            DataCorePolicy::PerType => format!("type:{}", blob_id.blob_type),
            DataCorePolicy::Rolling { max_blocks } => {
                let Some(generation) = state.rolling else {
                    return "rolling:0".to_string();
                };
                let active = format!("rolling:{generation}");
                let active_core = self.registry.named_writer_core(CorePurpose::Blob, &active);
                if active_core.core.length() >= max_blocks {
                    format!("rolling:{}", generation + 1)
                } else {
                    active
                }
            }
        }
    }

    /// Make every index record the drive has proven local.
    ///
    /// A lookup against a partial index could miss an entry or return a
    /// superseded one, so nothing resolves until the gap is closed. `id`
    /// names the failed lookup in errors.
    async fn prepare_index(&self, id: &str, mode: ReadMode) -> BlobResult<()> {
        let core = &self.index.core;
        if core.writable() {
            return Ok(());
        }
        if let ReadMode::Wait { .. } = mode {
            core.update(UpdateOptions { wait: true }).await?;
        }

        let length = core.length();
        if length == 0 {
            return Err(BlobError::uninitialized_drive(self.id.as_str()));
        }
        let contiguous = core.contiguous_length();
        if contiguous >= length {
            return Ok(());
        }

        let timeout = match mode {
            ReadMode::Local if core.local_blocks(0..length) == 0 => {
                return Err(BlobError::unreplicated_drive(self.id.as_str()));
            }
            ReadMode::Local => return Err(BlobError::block_not_available(id)),
            ReadMode::Wait { timeout } => timeout,
        };
        let missing = contiguous..length;
        if core.peer_count() == 0 {
            if contiguous == 0 {
                return Err(BlobError::unreplicated_drive(self.id.as_str()));
            }
            return Err(BlobError::remote_unavailable(id, CoreError::no_peers(&missing)));
        }

        let request = core.download(missing);
        match request.done_within(timeout).await {
            Ok(()) => Ok(()),
            Err(error) if core.contiguous_length() == 0 => {
                debug!(drive = %self.id, %error, "index not replicated");
                Err(BlobError::unreplicated_drive(self.id.as_str()))
            }
            Err(error) => Err(BlobError::remote_unavailable(id, error)),
        }
    }

    /// Fold newly contiguous index records into the state
    async fn refresh(&self, state: &mut IndexState) -> BlobResult<()> {
        let core = &self.index.core;
        let contiguous = core.contiguous_length();
        while state.folded < contiguous {
            let position = state.folded;
            let Some(block) = core.get(position, GetOptions::local()).await? else {
                break;
            };
            state.apply(position, IndexRecord::decode(&block)?);
            state.folded = position + 1;
        }
        Ok(())
    }

    async fn data_core(&self, entry: &IndexEntry) -> BlobResult<Arc<dyn Core>> {
        entry.validate()?;
        let key = {
            let mut state = self.state.lock().await;
            if !state.data_cores.contains_key(&entry.data_core) {
                self.refresh(&mut state).await?;
            }
            state.data_cores.get(&entry.data_core).copied()
        };
        let Some(key) = key else {
            return Err(BlobError::block_not_available(entry.blob_id.to_string()));
        };

        let record = match self.registry.core_by_key(&key) {
            Some(record) => record,
            None => self.registry.add_core(key, CorePurpose::Blob),
        };
        Ok(record.core)
    }
}

/// Drives opened by a store, keyed by index discovery key
pub(crate) struct Drives {
    registry: Arc<dyn CoreRegistry>,
    writer: Arc<Drive>,
    drives: RwLock<HashMap<DiscoveryKey, Arc<Drive>>>,
}

impl Drives {
    pub(crate) fn new(registry: Arc<dyn CoreRegistry>) -> Self {
        let index = registry.writer_core(CorePurpose::BlobIndex);
        let discovery_key = index.discovery_key;
        let writer = Arc::new(Drive::new(index, registry.clone()));

        let mut drives = HashMap::new();
        drives.insert(discovery_key, writer.clone());
        Self {
            registry,
            writer,
            drives: RwLock::new(drives),
        }
    }

    pub(crate) fn writer(&self) -> &Arc<Drive> {
        &self.writer
    }

    pub(crate) fn get(&self, drive_id: &DriveId) -> BlobResult<Arc<Drive>> {
        let discovery_key = drive_id
            .as_discovery_key()
            .ok_or_else(|| BlobError::unknown_drive(drive_id.as_str()))?;
        if let Some(drive) = self.drives.read().get(&discovery_key) {
            return Ok(drive.clone());
        }

        let record = self
            .registry
            .core_by_discovery_key(&discovery_key)
            .filter(|record| record.purpose == CorePurpose::BlobIndex)
            .ok_or_else(|| BlobError::unknown_drive(drive_id.as_str()))?;
        let drive = Arc::new(Drive::new(record, self.registry.clone()));
        Ok(self
            .drives
            .write()
            .entry(discovery_key)
            .or_insert(drive)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlobMetadata;
    use fieldsync_core::memory::MemoryCoreRegistry;

    fn entry(name: &str, data_core: u32, block_offset: u64) -> IndexEntry {
        IndexEntry {
            blob_id: BlobId::new("photo", "original", name),
            data_core,
            block_offset,
            block_length: 1,
            byte_length: 1,
            metadata: BlobMetadata::default(),
        }
    }

    #[test]
    fn test_state_keeps_newest_entry() {
        let mut state = IndexState::default();
        state.apply(5, IndexRecord::Entry(entry("a", 0, 9)));
        state.apply(2, IndexRecord::Entry(entry("a", 0, 1)));

        let (position, latest) = &state.latest[&BlobId::new("photo", "original", "a")];
        assert_eq!(*position, 5);
        assert_eq!(latest.block_offset, 9);
    }

    #[test]
    fn test_state_slots() {
        let mut state = IndexState::default();
        assert_eq!(state.next_slot(), 0);

        let key = CoreKey::random();
        state.apply(
            0,
            IndexRecord::DataCore {
                slot: 0,
                key,
                name: "data".to_string(),
            },
        );
        assert_eq!(state.slot_of(&key), Some(0));
        assert_eq!(state.slot_of(&CoreKey::random()), None);
        assert_eq!(state.next_slot(), 1);
        assert_eq!(state.rolling, None);
    }

    #[tokio::test]
    async fn test_rolling_policy_starts_new_core() {
        let registry: Arc<dyn CoreRegistry> = Arc::new(MemoryCoreRegistry::random());
        let drives = Drives::new(registry);
        let drive = drives.writer();
        let policy = DataCorePolicy::Rolling { max_blocks: 2 };
        let id = BlobId::new("photo", "original", "a");

        let first = drive.lease_data_core(&id, policy).await.unwrap();
        first
            .core
            .append(vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")])
            .await
            .unwrap();
        assert_eq!(first.slot, 0);
        drop(first);

        let second = drive.lease_data_core(&id, policy).await.unwrap();
        assert_eq!(second.slot, 1);
    }

    #[tokio::test]
    async fn test_per_type_policy_reuses_slot() {
        let registry: Arc<dyn CoreRegistry> = Arc::new(MemoryCoreRegistry::random());
        let drives = Drives::new(registry);
        let drive = drives.writer();

        let photo = BlobId::new("photo", "original", "a");
        let audio = BlobId::new("audio", "m4a", "b");
        let a = drive.lease_data_core(&photo, DataCorePolicy::PerType).await.unwrap().slot;
        let b = drive.lease_data_core(&audio, DataCorePolicy::PerType).await.unwrap().slot;
        let c = drive
            .lease_data_core(&photo.with_variant("preview"), DataCorePolicy::PerType)
            .await
            .unwrap()
            .slot;

        assert_eq!((a, b, c), (0, 1, 0));
    }

    #[tokio::test]
    async fn test_rolling_generation_ignores_other_slots() {
        let registry: Arc<dyn CoreRegistry> = Arc::new(MemoryCoreRegistry::random());
        let drives = Drives::new(registry);
        let drive = drives.writer();
        let id = BlobId::new("photo", "original", "a");
        let rolling = DataCorePolicy::Rolling { max_blocks: 2 };

        let typed = drive.lease_data_core(&id, DataCorePolicy::PerType).await.unwrap().slot;
        let first = drive.lease_data_core(&id, rolling).await.unwrap().slot;
        let again = drive.lease_data_core(&id, rolling).await.unwrap().slot;
        assert_eq!((typed, first, again), (0, 1, 1));

        let full = drive.lease_data_core(&id, rolling).await.unwrap();
        full.core
            .append(vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")])
            .await
            .unwrap();
        drop(full);
        let next = drive.lease_data_core(&id, rolling).await.unwrap().slot;
        assert_eq!(next, 2);
        assert_eq!(drive.state.lock().await.rolling, Some(1));
    }

    #[tokio::test]
    async fn test_unknown_drive_id() {
        let registry: Arc<dyn CoreRegistry> = Arc::new(MemoryCoreRegistry::random());
        let drives = Drives::new(registry.clone());

        let missing = DriveId::from_discovery_key(&CoreKey::random().discovery_key());
        assert!(matches!(drives.get(&missing), Err(BlobError::UnknownDrive { .. })));

        let malformed = DriveId::from_string("zz".to_string());
        assert!(matches!(drives.get(&malformed), Err(BlobError::UnknownDrive { .. })));

        // A data core is not a drive
        let data = registry.named_writer_core(CorePurpose::Blob, "type:photo");
        let not_a_drive = DriveId::from_discovery_key(&data.discovery_key);
        assert!(matches!(drives.get(&not_a_drive), Err(BlobError::UnknownDrive { .. })));
    }
}
