use std::fmt;
use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, watch};

use crate::{CoreError, CoreKey, CoreResult, DiscoveryKey};

/// An append-only, replicable log of blocks.
///
/// A core has a known `length` (including proof-of-length received from peers)
/// and a `contiguous_length`, the prefix that is available locally. Blocks past
/// the contiguous prefix may be present sparsely.
#[async_trait]
pub trait Core: Send + Sync {
    /// Public key of this core
    fn key(&self) -> CoreKey;

    /// Discovery key derived from the public key
    fn discovery_key(&self) -> DiscoveryKey {
        self.key().discovery_key()
    }

    /// Whether this process owns the core and may append to it
    fn writable(&self) -> bool;

    /// Known length, local or proven by a peer
    fn length(&self) -> u64;

    /// Length of the locally available prefix
    fn contiguous_length(&self) -> u64;

    /// Whether a block is available locally
    fn has(&self, index: u64) -> bool;

    /// Number of locally available blocks in a range
    fn local_blocks(&self, range: Range<u64>) -> u64;

    /// Whether every block of a range is available locally
    fn has_range(&self, range: Range<u64>) -> bool {
        let len = range.end.saturating_sub(range.start);
        self.local_blocks(range) == len
    }

    /// Number of connected peers replicating this core
    fn peer_count(&self) -> usize;

    /// Append blocks, returning the new length
    async fn append(&self, blocks: Vec<Bytes>) -> CoreResult<u64>;

    /// Read a block.
    ///
    /// Returns `Ok(None)` if the block is not local and `opts.wait` is false.
    async fn get(&self, index: u64, opts: GetOptions) -> CoreResult<Option<Bytes>>;

    /// Refresh the known length from connected peers
    async fn update(&self, opts: UpdateOptions) -> CoreResult<u64>;

    /// Request a block range in the background
    fn download(&self, range: Range<u64>) -> DownloadHandle;

    /// Remove locally stored blocks. The length is unchanged.
    async fn clear(&self, range: Range<u64>) -> CoreResult<()>;

    /// Subscribe to change events
    fn subscribe(&self) -> broadcast::Receiver<CoreEvent>;
}

/// Options for [`Core::get`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Wait for the block to be replicated if it is not local
    pub wait: bool,
    /// Give up waiting after this long (`None` waits indefinitely)
    pub timeout: Option<Duration>,
}

impl GetOptions {
    /// Only return locally available blocks
    pub fn local() -> Self {
        Self {
            wait: false,
            timeout: None,
        }
    }

    /// Wait for missing blocks
    pub fn wait() -> Self {
        Self {
            wait: true,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Options for [`Core::update`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub wait: bool,
}

/// Change notifications emitted by a core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// Local append
    Append { length: u64 },
    /// Known length grew through a peer
    Update { length: u64 },
    /// A block was downloaded from a peer
    Download { index: u64 },
    /// Local blocks were removed
    Clear { start: u64, end: u64 },
    PeerAdd,
    PeerRemove,
}

type CancelFn = Box<dyn FnOnce() + Send + Sync>;

/// A background request for a block range.
///
/// Dropping the handle withdraws the request. Blocks that already arrived
/// stay local.
pub struct DownloadHandle {
    range: Range<u64>,
    completion: watch::Receiver<bool>,
    on_cancel: Option<CancelFn>,
}

impl DownloadHandle {
    /// Create a handle that withdraws its request through `on_cancel`
    pub fn new<F>(range: Range<u64>, completion: watch::Receiver<bool>, on_cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            range,
            completion,
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    /// A handle for a range that is already local
    pub fn completed(range: Range<u64>) -> Self {
        let (_tx, completion) = watch::channel(true);
        Self {
            range,
            completion,
            on_cancel: None,
        }
    }

    pub fn range(&self) -> &Range<u64> {
        &self.range
    }

    pub fn is_done(&self) -> bool {
        *self.completion.borrow()
    }

    /// Wait until every block in the range is local
    pub async fn done(&self) -> CoreResult<()> {
        let mut completion = self.completion.clone();
        completion
            .wait_for(|done| *done)
            .await
            .map(|_| ())
            .map_err(|_| CoreError::Closed)
    }

    /// Wait with an optional timeout
    pub async fn done_within(&self, timeout: Option<Duration>) -> CoreResult<()> {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.done())
                .await
                .map_err(|_| CoreError::timeout(&self.range))?,
            None => self.done().await,
        }
    }
}

impl Drop for DownloadHandle {
    fn drop(&mut self) {
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
    }
}

impl fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("range", &self.range)
            .field("done", &self.is_done())
            .finish()
    }
}
