use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use fieldsync_core::Core;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::drive::{DataCoreLease, Drive};
use crate::{BlobError, BlobId, BlobMetadata, BlobResult, DriveId, IndexEntry};

/// Incremental writer for one blob on the writer drive.
///
/// Blocks are appended to the data core as they fill. The index entry is
/// appended by [`BlobWriter::finish`]; a writer dropped before finishing
/// leaves unreferenced blocks behind and no entry.
pub struct BlobWriter {
    drive: Arc<Drive>,
    blob_id: BlobId,
    metadata: BlobMetadata,
    slot: u32,
    data: Arc<dyn Core>,
    block_size: usize,
    max_blob_bytes: u64,
    buffer: BytesMut,
    block_offset: u64,
    block_length: u64,
    byte_length: u64,
    _guard: OwnedMutexGuard<()>,
}

impl BlobWriter {
    pub(crate) fn new(
        drive: Arc<Drive>,
        blob_id: BlobId,
        metadata: BlobMetadata,
        lease: DataCoreLease,
        block_size: usize,
        max_blob_bytes: u64,
    ) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_offset: lease.core.length(),
            drive,
            blob_id,
            metadata,
            slot: lease.slot,
            data: lease.core,
            block_size,
            max_blob_bytes,
            buffer: BytesMut::with_capacity(block_size),
            block_length: 0,
            byte_length: 0,
            _guard: lease.guard,
        }
    }

    /// Drive the blob is written to, known before any bytes are written
    pub fn drive_id(&self) -> &DriveId {
        self.drive.id()
    }

    pub fn blob_id(&self) -> &BlobId {
        &self.blob_id
    }

    pub fn bytes_written(&self) -> u64 {
        self.byte_length
    }

    /// Buffer a chunk, appending every block it completes
    pub async fn write(&mut self, chunk: &[u8]) -> BlobResult<()> {
        let total = self.byte_length + chunk.len() as u64;
        if total > self.max_blob_bytes {
            return Err(BlobError::invalid(format!(
                "Blob size {} exceeds maximum {}",
                total, self.max_blob_bytes
            )));
        }

        self.buffer.extend_from_slice(chunk);
        self.byte_length = total;

        if self.buffer.len() >= self.block_size {
            let mut blocks = Vec::with_capacity(self.buffer.len() / self.block_size);
            while self.buffer.len() >= self.block_size {
                blocks.push(self.buffer.split_to(self.block_size).freeze());
            }
            self.append(blocks).await?;
        }
        Ok(())
    }

    /// Flush the final partial block and append the index entry
    pub async fn finish(mut self) -> BlobResult<IndexEntry> {
        if !self.buffer.is_empty() {
            let tail = self.buffer.split().freeze();
            self.append(vec![tail]).await?;
        }

        let entry = IndexEntry {
            blob_id: self.blob_id.clone(),
            data_core: self.slot,
            block_offset: self.block_offset,
            block_length: self.block_length,
            byte_length: self.byte_length,
            metadata: std::mem::take(&mut self.metadata),
        };
        self.drive.append_entry(entry.clone()).await?;

        debug!(
            drive = %self.drive.id(),
            blob = %self.blob_id,
            slot = self.slot,
            blocks = self.block_length,
            bytes = self.byte_length,
            "blob written"
        );
        Ok(entry)
    }

    async fn append(&mut self, blocks: Vec<Bytes>) -> BlobResult<()> {
        let count = blocks.len() as u64;
        self.data.append(blocks).await?;
        self.block_length += count;
        Ok(())
    }
}

impl fmt::Debug for BlobWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobWriter")
            .field("drive_id", self.drive.id())
            .field("blob_id", &self.blob_id)
            .field("slot", &self.slot)
            .field("bytes_written", &self.byte_length)
            .finish()
    }
}
