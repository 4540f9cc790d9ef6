use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tracing::trace;

use crate::{
    Core, CoreError, CoreEvent, CoreKey, CoreResult, DiscoveryKey, DownloadHandle, GetOptions,
    UpdateOptions,
};

const EVENT_CAPACITY: usize = 1024;

static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Outstanding download request
struct Request {
    range: Range<u64>,
    done: watch::Sender<bool>,
}

#[derive(Default)]
struct CoreState {
    /// One slot per known block; the vector length is the known core length
    blocks: Vec<Option<Bytes>>,
    contiguous: u64,
    requests: HashMap<u64, Request>,
    /// Replicas of the same core, keyed by replication link id
    peers: HashMap<u64, Weak<CoreShared>>,
}

impl CoreState {
    fn length(&self) -> u64 {
        self.blocks.len() as u64
    }

    fn block(&self, index: u64) -> Option<&Bytes> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.blocks.get(i))
            .and_then(Option::as_ref)
    }

    fn has(&self, index: u64) -> bool {
        self.block(index).is_some()
    }

    fn grow(&mut self, length: u64) -> bool {
        if length <= self.length() {
            return false;
        }
        self.blocks.resize(length as usize, None);
        true
    }

    fn insert(&mut self, index: u64, block: Bytes) -> bool {
        match self.blocks.get_mut(index as usize) {
            Some(slot) if slot.is_none() => {
                *slot = Some(block);
                true
            }
            _ => false,
        }
    }

    fn advance_contiguous(&mut self) {
        while self.has(self.contiguous) {
            self.contiguous += 1;
        }
    }

    fn local_blocks(&self, range: Range<u64>) -> u64 {
        let end = range.end.min(self.length());
        (range.start..end).filter(|i| self.has(*i)).count() as u64
    }

    fn missing_requested(&self) -> BTreeSet<u64> {
        let length = self.length();
        self.requests
            .values()
            .flat_map(|r| r.range.start..r.range.end.min(length))
            .filter(|i| !self.has(*i))
            .collect()
    }

    fn settle_requests(&self) {
        for request in self.requests.values() {
            if !*request.done.borrow() && request.range.clone().all(|i| self.has(i)) {
                request.done.send_replace(true);
            }
        }
    }

    fn peers(&self) -> Vec<Arc<CoreShared>> {
        self.peers.values().filter_map(Weak::upgrade).collect()
    }
}

pub(crate) struct CoreShared {
    key: CoreKey,
    discovery_key: DiscoveryKey,
    writable: bool,
    state: RwLock<CoreState>,
    events: broadcast::Sender<CoreEvent>,
}

impl CoreShared {
    fn emit(&self, event: CoreEvent) {
        let _ = self.events.send(event);
    }

    /// Accept a proof-of-length from a peer and pass it on
    fn receive_length(&self, length: u64) {
        if self.writable {
            return;
        }
        let (grew, peers) = {
            let mut state = self.state.write();
            (state.grow(length), state.peers())
        };
        if !grew {
            return;
        }
        self.emit(CoreEvent::Update { length });
        for peer in &peers {
            peer.receive_length(length);
        }
        self.pump();
    }

    /// Pull requested blocks from whichever peers hold them
    fn pump(&self) {
        let (mut wanted, peers) = {
            let state = self.state.read();
            (state.missing_requested(), state.peers())
        };
        if wanted.is_empty() || peers.is_empty() {
            return;
        }

        let mut fetched = Vec::new();
        for peer in &peers {
            let remote = peer.state.read();
            wanted.retain(|index| match remote.block(*index) {
                Some(block) => {
                    fetched.push((*index, block.clone()));
                    false
                }
                None => true,
            });
            if wanted.is_empty() {
                break;
            }
        }
        if fetched.is_empty() {
            return;
        }

        let downloaded: Vec<u64> = {
            let mut state = self.state.write();
            let downloaded: Vec<u64> = fetched
                .into_iter()
                .filter_map(|(index, block)| state.insert(index, block).then_some(index))
                .collect();
            state.advance_contiguous();
            state.settle_requests();
            downloaded
        };
        if downloaded.is_empty() {
            return;
        }

        trace!(core = %self.discovery_key, blocks = downloaded.len(), "downloaded blocks");
        for index in &downloaded {
            self.emit(CoreEvent::Download { index: *index });
        }
        // Peers may have been waiting on these blocks through us
        for peer in &peers {
            peer.pump();
        }
    }
}

/// In-memory core replica
#[derive(Clone)]
pub struct MemoryCore {
    shared: Arc<CoreShared>,
}

impl MemoryCore {
    fn with_key(key: CoreKey, writable: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(CoreShared {
                key,
                discovery_key: key.discovery_key(),
                writable,
                state: RwLock::new(CoreState::default()),
                events,
            }),
        }
    }

    /// A core owned by this process
    pub fn new_writer(key: CoreKey) -> Self {
        Self::with_key(key, true)
    }

    /// A replica of a core owned by another device, empty until replicated
    pub fn new_remote(key: CoreKey) -> Self {
        Self::with_key(key, false)
    }

    fn read_local(&self, index: u64) -> Option<Bytes> {
        self.shared.state.read().block(index).cloned()
    }

    /// Link two replicas of the same core over a replication link
    pub(crate) fn attach(a: &MemoryCore, b: &MemoryCore, link: u64) {
        if Arc::ptr_eq(&a.shared, &b.shared) || a.shared.key != b.shared.key {
            return;
        }
        let fresh = a
            .shared
            .state
            .write()
            .peers
            .insert(link, Arc::downgrade(&b.shared))
            .is_none();
        if !fresh {
            return;
        }
        b.shared
            .state
            .write()
            .peers
            .insert(link, Arc::downgrade(&a.shared));

        a.shared.emit(CoreEvent::PeerAdd);
        b.shared.emit(CoreEvent::PeerAdd);

        let (a_length, b_length) = (Core::length(a), Core::length(b));
        a.shared.receive_length(b_length);
        b.shared.receive_length(a_length);
        a.shared.pump();
        b.shared.pump();
    }

    pub(crate) fn detach(&self, link: u64) {
        let removed = self.shared.state.write().peers.remove(&link).is_some();
        if removed {
            self.shared.emit(CoreEvent::PeerRemove);
        }
    }
}

#[async_trait]
impl Core for MemoryCore {
    fn key(&self) -> CoreKey {
        self.shared.key
    }

    fn discovery_key(&self) -> DiscoveryKey {
        self.shared.discovery_key
    }

    fn writable(&self) -> bool {
        self.shared.writable
    }

    fn length(&self) -> u64 {
        self.shared.state.read().length()
    }

    fn contiguous_length(&self) -> u64 {
        self.shared.state.read().contiguous
    }

    fn has(&self, index: u64) -> bool {
        self.shared.state.read().has(index)
    }

    fn local_blocks(&self, range: Range<u64>) -> u64 {
        self.shared.state.read().local_blocks(range)
    }

    fn peer_count(&self) -> usize {
        self.shared.state.read().peers().len()
    }

    async fn append(&self, blocks: Vec<Bytes>) -> CoreResult<u64> {
        if !self.shared.writable {
            return Err(CoreError::not_writable(self.shared.key.to_hex()));
        }
        let (length, peers) = {
            let mut state = self.shared.state.write();
            state.blocks.extend(blocks.into_iter().map(Some));
            state.advance_contiguous();
            state.settle_requests();
            (state.length(), state.peers())
        };
        self.shared.emit(CoreEvent::Append { length });
        for peer in &peers {
            peer.receive_length(length);
        }
        Ok(length)
    }

    async fn get(&self, index: u64, opts: GetOptions) -> CoreResult<Option<Bytes>> {
        if let Some(block) = self.read_local(index) {
            return Ok(Some(block));
        }
        if !opts.wait {
            return Ok(None);
        }
        let handle = self.download(index..index + 1);
        handle.done_within(opts.timeout).await?;
        Ok(self.read_local(index))
    }

    async fn update(&self, _opts: UpdateOptions) -> CoreResult<u64> {
        // Peers push their length on every append, so there is nothing to wait for
        let peers = self.shared.state.read().peers();
        for peer in &peers {
            let length = peer.state.read().length();
            self.shared.receive_length(length);
        }
        Ok(Core::length(self))
    }

    fn download(&self, range: Range<u64>) -> DownloadHandle {
        if range.start >= range.end || self.has_range(range.clone()) {
            return DownloadHandle::completed(range);
        }
        let id = next_request_id();
        let (done, completion) = watch::channel(false);
        {
            let mut state = self.shared.state.write();
            state.requests.insert(
                id,
                Request {
                    range: range.clone(),
                    done,
                },
            );
            state.settle_requests();
        }
        self.shared.pump();

        let shared = Arc::downgrade(&self.shared);
        DownloadHandle::new(range, completion, move || {
            if let Some(shared) = shared.upgrade() {
                shared.state.write().requests.remove(&id);
            }
        })
    }

    async fn clear(&self, range: Range<u64>) -> CoreResult<()> {
        let end = {
            let mut state = self.shared.state.write();
            let end = range.end.min(state.length());
            for index in range.start..end {
                if let Some(slot) = state.blocks.get_mut(index as usize) {
                    *slot = None;
                }
            }
            if range.start < state.contiguous {
                state.contiguous = range.start;
            }
            end
        };
        if range.start < end {
            self.shared.emit(CoreEvent::Clear {
                start: range.start,
                end,
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.shared.events.subscribe()
    }
}

impl fmt::Debug for MemoryCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("MemoryCore")
            .field("discovery_key", &self.shared.discovery_key)
            .field("writable", &self.shared.writable)
            .field("length", &state.length())
            .field("contiguous", &state.contiguous)
            .field("peers", &state.peers.len())
            .finish()
    }
}
