use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use fieldsync_core::{
    Core, CoreEvent, CoreKey, CorePurpose, CoreRecord, CoreRegistry, DiscoveryKey, DownloadHandle,
    GetOptions, RegistryEvent,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{BlobFilter, IndexRecord};

/// Whether a live download has outstanding wanted blocks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    #[default]
    Downloaded,
}

/// Aggregate progress over every tracked core, counted in blocks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadState {
    pub status: DownloadStatus,
    pub have_count: u64,
    pub want_count: u64,
}

impl DownloadState {
    fn from_counts(have_count: u64, want_count: u64) -> Self {
        let status = if have_count < want_count {
            DownloadStatus::Downloading
        } else {
            DownloadStatus::Downloaded
        };
        Self {
            status,
            have_count,
            want_count,
        }
    }

    /// Everything wanted is local, and something was wanted.
    ///
    /// A download starts out `Downloaded` with nothing tracked, which is not
    /// completion.
    pub fn is_complete(&self) -> bool {
        self.status == DownloadStatus::Downloaded && self.have_count > 0
    }
}

/// Options for [`crate::BlobStore::download`]
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Cancelling this token stops the download
    pub signal: Option<CancellationToken>,
}

impl DownloadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// A running live download.
///
/// Tracks every blob index core the registry knows, now or later, and the
/// data ranges of entries that pass the filter. Stopping (through the signal,
/// [`LiveDownload::abort`] or drop) withdraws outstanding requests; blocks
/// already downloaded stay local.
pub struct LiveDownload {
    state: watch::Receiver<DownloadState>,
    cancel: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl LiveDownload {
    /// Spawn the controller task. Must be called within a tokio runtime.
    pub(crate) fn start(
        registry: Arc<dyn CoreRegistry>,
        filter: Option<BlobFilter>,
        options: DownloadOptions,
    ) -> Self {
        let cancel = options
            .signal
            .map(|signal| signal.child_token())
            .unwrap_or_default();
        let (state_tx, state) = watch::channel(DownloadState::default());
        let controller = Controller {
            registry,
            filter,
            state: state_tx,
            drives: HashMap::new(),
            owners: HashMap::new(),
            events: StreamMap::new(),
        };
        let join_handle = tokio::spawn(controller.run(cancel.clone()));
        Self {
            state,
            cancel,
            join_handle: Some(join_handle),
        }
    }

    /// Current aggregate state
    pub fn state(&self) -> DownloadState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DownloadState> {
        self.state.clone()
    }

    /// Stream of state changes, starting with the current state
    pub fn changes(&self) -> WatchStream<DownloadState> {
        WatchStream::new(self.state.clone())
    }

    /// Wait for a state matching `predicate`.
    ///
    /// Returns the last state if the download stops first.
    pub async fn wait_until<F>(&self, predicate: F) -> DownloadState
    where
        F: FnMut(&DownloadState) -> bool,
    {
        let mut state = self.state.clone();
        let matched = state.wait_for(predicate).await.map(|state| *state);
        matched.unwrap_or_else(|_| self.state())
    }

    /// Stop the download. No further blocks are requested.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the download and wait for the controller to release its requests
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join_handle) = self.join_handle.take() {
            if let Err(error) = join_handle.await {
                warn!(%error, "live download task failed");
            }
        }
    }
}

impl Drop for LiveDownload {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Download requests against one core, counted in blocks
struct TrackedCore {
    core: Arc<dyn Core>,
    requests: Vec<DownloadHandle>,
    /// Blocks of requests that already completed
    completed: u64,
    wanted: u64,
}

impl TrackedCore {
    fn new(core: Arc<dyn Core>) -> Self {
        Self {
            core,
            requests: Vec::new(),
            completed: 0,
            wanted: 0,
        }
    }

    fn want(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        self.wanted = self.wanted.saturating_add(range.end - range.start);
        self.requests.push(self.core.download(range));
    }

    fn counts(&mut self) -> (u64, u64) {
        let mut completed = self.completed;
        self.requests.retain(|request| {
            if request.is_done() {
                completed = completed.saturating_add(request.range().end - request.range().start);
                false
            } else {
                true
            }
        });
        self.completed = completed;

        let pending = self
            .requests
            .iter()
            .map(|request| self.core.local_blocks(request.range().clone()))
            .fold(0u64, u64::saturating_add);
        (self.completed.saturating_add(pending), self.wanted)
    }
}

/// Download state for one drive
struct DriveTracker {
    index: TrackedCore,
    /// Index length covered by requests
    requested: u64,
    /// Next index record to decode
    cursor: u64,
    slots: HashMap<u32, CoreKey>,
    data: HashMap<u32, TrackedCore>,
}

impl DriveTracker {
    fn new(index: Arc<dyn Core>) -> Self {
        Self {
            index: TrackedCore::new(index),
            requested: 0,
            cursor: 0,
            slots: HashMap::new(),
            data: HashMap::new(),
        }
    }

    /// Request the whole index, then want the data of newly readable entries.
    ///
    /// Returns data cores that started being tracked.
    async fn sync(
        &mut self,
        registry: &dyn CoreRegistry,
        filter: Option<&BlobFilter>,
    ) -> Vec<Arc<dyn Core>> {
        let length = self.index.core.length();
        if length > self.requested {
            self.index.want(self.requested..length);
            self.requested = length;
        }

        let mut added = Vec::new();
        let contiguous = self.index.core.contiguous_length();
        while self.cursor < contiguous {
            let position = self.cursor;
            let block = match self.index.core.get(position, GetOptions::local()).await {
                Ok(Some(block)) => block,
                Ok(None) => break,
                Err(error) => {
                    warn!(position, %error, "index read failed");
                    break;
                }
            };
            self.cursor += 1;

            let entry = match IndexRecord::decode(&block) {
                Ok(IndexRecord::DataCore { slot, key, .. }) => {
                    self.slots.insert(slot, key);
                    continue;
                }
                Ok(IndexRecord::Entry(entry)) => entry,
                Err(error) => {
                    warn!(position, %error, "skipping undecodable index record");
                    continue;
                }
            };
            if !filter.map_or(true, |filter| filter.matches(&entry.blob_id)) {
                continue;
            }
            let Some(key) = self.slots.get(&entry.data_core).copied() else {
                warn!(position, slot = entry.data_core, "entry references unannounced data core");
                continue;
            };

            let tracked = match self.data.entry(entry.data_core) {
                Entry::Occupied(tracked) => tracked.into_mut(),
                Entry::Vacant(vacant) => {
                    let record = registry
                        .core_by_key(&key)
                        .unwrap_or_else(|| registry.add_core(key, CorePurpose::Blob));
                    added.push(record.core.clone());
                    vacant.insert(TrackedCore::new(record.core))
                }
            };
            tracked.want(entry.block_range());
        }
        added
    }

    fn counts(&mut self) -> (u64, u64) {
        let (mut have, mut want) = self.index.counts();
        for tracked in self.data.values_mut() {
            let (core_have, core_want) = tracked.counts();
            have = have.saturating_add(core_have);
            want = want.saturating_add(core_want);
        }
        (have, want)
    }
}

enum Step {
    Stop,
    Registry(Result<RegistryEvent, RecvError>),
    Core(DiscoveryKey),
}

struct Controller {
    registry: Arc<dyn CoreRegistry>,
    filter: Option<BlobFilter>,
    state: watch::Sender<DownloadState>,
    drives: HashMap<DiscoveryKey, DriveTracker>,
    /// Tracked core to the drive it belongs to
    owners: HashMap<DiscoveryKey, DiscoveryKey>,
    events: StreamMap<DiscoveryKey, BroadcastStream<CoreEvent>>,
}

impl Controller {
    async fn run(mut self, cancel: CancellationToken) {
        // Subscribe before the snapshot so no core slips between them
        let mut registry_events = self.registry.subscribe();
        let mut registry_open = true;
        for record in self.registry.cores() {
            self.track(record).await;
        }
        self.publish();
        info!(drives = self.drives.len(), "live download started");

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Stop,
                event = registry_events.recv(), if registry_open => Step::Registry(event),
                Some((core, _)) = self.events.next(), if !self.events.is_empty() => Step::Core(core),
            };

            match step {
                Step::Stop => break,
                Step::Registry(Ok(RegistryEvent::CoreAdded(record))) => self.track(record).await,
                Step::Registry(Err(RecvError::Lagged(missed))) => {
                    debug!(missed, "registry events lagged, rescanning cores");
                    for record in self.registry.cores() {
                        self.track(record).await;
                    }
                }
                Step::Registry(Err(RecvError::Closed)) => registry_open = false,
                Step::Core(core) => {
                    if let Some(drive) = self.owners.get(&core).copied() {
                        self.sync_drive(drive).await;
                    }
                }
            }
            self.publish();
        }

        info!(drives = self.drives.len(), "live download stopped");
    }

    async fn track(&mut self, record: CoreRecord) {
        if record.purpose != CorePurpose::BlobIndex || self.drives.contains_key(&record.discovery_key) {
            return;
        }
        debug!(drive = %record.discovery_key, "tracking drive");
        self.watch_core(record.discovery_key, &record.core);
        self.drives
            .insert(record.discovery_key, DriveTracker::new(record.core));
        self.sync_drive(record.discovery_key).await;
    }

    async fn sync_drive(&mut self, drive: DiscoveryKey) {
        let Some(tracker) = self.drives.get_mut(&drive) else {
            return;
        };
        let added = tracker.sync(self.registry.as_ref(), self.filter.as_ref()).await;
        for core in added {
            debug!(%drive, core = %core.discovery_key(), "tracking data core");
            self.watch_core(drive, &core);
        }
    }

    fn watch_core(&mut self, drive: DiscoveryKey, core: &Arc<dyn Core>) {
        let discovery_key = core.discovery_key();
        self.owners.insert(discovery_key, drive);
        self.events
            .insert(discovery_key, BroadcastStream::new(core.subscribe()));
    }

    fn publish(&mut self) {
        let (mut have, mut want) = (0u64, 0u64);
        for tracker in self.drives.values_mut() {
            let (drive_have, drive_want) = tracker.counts();
            have = have.saturating_add(drive_have);
            want = want.saturating_add(drive_want);
        }
        let next = DownloadState::from_counts(have, want);
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use fieldsync_core::memory::MemoryCoreRegistry;
    use tracing_test::traced_test;

    #[test]
    fn test_state_from_counts() {
        assert_eq!(DownloadState::default().status, DownloadStatus::Downloaded);
        assert!(!DownloadState::default().is_complete());
        assert_eq!(DownloadState::from_counts(1, 3).status, DownloadStatus::Downloading);
        assert!(DownloadState::from_counts(3, 3).is_complete());
    }

    #[test]
    fn test_state_serializes_camel_case() {
        let json = serde_json::to_value(DownloadState::from_counts(1, 2)).unwrap();
        assert_eq!(json["status"], "downloading");
        assert_eq!(json["haveCount"], 1);
        assert_eq!(json["wantCount"], 2);
    }

    #[tokio::test]
    async fn test_tracked_core_counts_local_blocks() {
        let registry = MemoryCoreRegistry::random();
        let writer = registry.named_writer_core(CorePurpose::Blob, "t");
        writer
            .core
            .append(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")])
            .await
            .unwrap();

        let mut tracked = TrackedCore::new(writer.core);
        tracked.want(0..2);
        tracked.want(1..1);
        assert_eq!(tracked.counts(), (2, 2));
        assert!(tracked.requests.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_controller_lifecycle() {
        let registry: Arc<dyn CoreRegistry> = Arc::new(MemoryCoreRegistry::random());
        registry.writer_core(CorePurpose::BlobIndex);

        let download = LiveDownload::start(registry, None, DownloadOptions::new());
        download.shutdown().await;

        assert!(logs_contain("live download started"));
        assert!(logs_contain("live download stopped"));
    }
}
