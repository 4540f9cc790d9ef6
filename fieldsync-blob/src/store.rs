use std::sync::Arc;

use bytes::Bytes;
use fieldsync_core::CoreRegistry;
use futures_util::StreamExt;
use tracing::{debug, info, instrument};

use crate::drive::{Drives, ReadMode};
use crate::{
    BlobConfig, BlobError, BlobFilter, BlobId, BlobMetadata, BlobPut, BlobRef, BlobResult,
    BlobStream, BlobWriter, ByteStream, DownloadOptions, DriveId, IndexEntry, LiveDownload,
};

/// Replicated blob store over a core registry.
///
/// Local writes go to the writer drive. Reads address any drive the registry
/// knows by [`DriveId`].
pub struct BlobStore {
    registry: Arc<dyn CoreRegistry>,
    drives: Drives,
    config: BlobConfig,
}

impl BlobStore {
    /// Create a new blob store
    pub fn new<R: CoreRegistry + 'static>(registry: R, config: BlobConfig) -> Self {
        Self::with_registry(Arc::new(registry), config)
    }

    /// Create over a registry shared with other subsystems
    pub fn with_registry(registry: Arc<dyn CoreRegistry>, config: BlobConfig) -> Self {
        let drives = Drives::new(registry.clone());
        info!(writer_drive = %drives.writer().id(), "blob store opened");
        Self {
            registry,
            drives,
            config,
        }
    }

    /// Drive id of every local write, constant for the lifetime of the store
    pub fn writer_drive_id(&self) -> &DriveId {
        self.drives.writer().id()
    }

    /// Get configuration
    pub fn config(&self) -> &BlobConfig {
        &self.config
    }

    /// Store a blob on the writer drive
    pub async fn put<B: Into<Bytes>>(&self, blob_id: &BlobId, data: B) -> BlobResult<DriveId> {
        self.put_with(blob_id, data, BlobPut::new()).await
    }

    /// Store a blob with metadata
    #[instrument(skip_all, fields(blob = %blob_id))]
    pub async fn put_with<B: Into<Bytes>>(
        &self,
        blob_id: &BlobId,
        data: B,
        put: BlobPut,
    ) -> BlobResult<DriveId> {
        let data = data.into();
        if data.len() as u64 > self.config.max_blob_bytes {
            return Err(BlobError::invalid(format!(
                "Blob size {} exceeds maximum {}",
                data.len(),
                self.config.max_blob_bytes
            )));
        }

        let mut writer = self.create_write_stream_with(blob_id, put).await?;
        writer.write(&data).await?;
        let drive_id = writer.drive_id().clone();
        writer.finish().await?;
        Ok(drive_id)
    }

    /// Store a blob from a stream
    #[instrument(skip_all, fields(blob = %blob_id))]
    pub async fn put_stream(
        &self,
        blob_id: &BlobId,
        mut body: ByteStream,
        put: BlobPut,
    ) -> BlobResult<IndexEntry> {
        let mut writer = self.create_write_stream_with(blob_id, put).await?;
        while let Some(chunk) = body.next().await {
            writer.write(&chunk?).await?;
        }
        writer.finish().await
    }

    /// Open an incremental writer on the writer drive
    pub async fn create_write_stream(&self, blob_id: &BlobId) -> BlobResult<BlobWriter> {
        self.create_write_stream_with(blob_id, BlobPut::new()).await
    }

    pub async fn create_write_stream_with(
        &self,
        blob_id: &BlobId,
        put: BlobPut,
    ) -> BlobResult<BlobWriter> {
        blob_id.validate()?;
        let drive = self.drives.writer().clone();
        let lease = drive
            .lease_data_core(blob_id, self.config.data_core_policy)
            .await?;
        Ok(BlobWriter::new(
            drive,
            blob_id.clone(),
            BlobMetadata::from_put(put),
            lease,
            self.config.block_size,
            self.config.max_blob_bytes,
        ))
    }

    /// Read a whole blob, waiting for peers to supply missing index or data
    #[instrument(skip_all, fields(blob = %blob))]
    pub async fn get(&self, blob: &BlobRef) -> BlobResult<Bytes> {
        let drive = self.drives.get(&blob.drive_id)?;
        let mode = self.wait_mode();
        let entry = drive.entry(&blob.blob_id, mode).await?;
        drive.read(&entry, mode).await
    }

    /// Stream a blob from local blocks without waiting on the network
    #[instrument(skip_all, fields(blob = %blob))]
    pub async fn create_read_stream(&self, blob: &BlobRef) -> BlobResult<BlobStream> {
        let drive = self.drives.get(&blob.drive_id)?;
        let entry = drive.entry(&blob.blob_id, ReadMode::Local).await?;
        drive.stream(&entry).await
    }

    /// Resolve just the index entry of a blob
    #[instrument(skip_all, fields(blob = %blob))]
    pub async fn entry(&self, blob: &BlobRef) -> BlobResult<IndexEntry> {
        let drive = self.drives.get(&blob.drive_id)?;
        drive.entry(&blob.blob_id, self.wait_mode()).await
    }

    /// Read a previously resolved entry from local blocks
    pub async fn get_entry_blob(&self, drive_id: &DriveId, entry: &IndexEntry) -> BlobResult<Bytes> {
        let drive = self.drives.get(drive_id)?;
        drive.read(entry, ReadMode::Local).await
    }

    /// Stream a previously resolved entry from local blocks
    pub async fn create_entry_read_stream(
        &self,
        drive_id: &DriveId,
        entry: &IndexEntry,
    ) -> BlobResult<BlobStream> {
        let drive = self.drives.get(drive_id)?;
        drive.stream(entry).await
    }

    /// Newest entry per blob in a drive's local index
    pub async fn entries(&self, drive_id: &DriveId) -> BlobResult<Vec<IndexEntry>> {
        self.drives.get(drive_id)?.entries().await
    }

    /// Drop the local blocks of a blob. The index entry stays resolvable.
    #[instrument(skip_all, fields(blob = %blob))]
    pub async fn clear(&self, blob: &BlobRef) -> BlobResult<()> {
        let drive = self.drives.get(&blob.drive_id)?;
        let entry = match drive.entry(&blob.blob_id, ReadMode::Local).await {
            Ok(entry) => entry,
            Err(error) if error.is_not_found() => {
                debug!(%error, "nothing to clear");
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        drive.clear(&entry).await
    }

    /// Start a live download across every known and future drive
    pub fn download(&self, filter: Option<BlobFilter>, options: DownloadOptions) -> LiveDownload {
        LiveDownload::start(self.registry.clone(), filter, options)
    }

    fn wait_mode(&self) -> ReadMode {
        ReadMode::Wait {
            timeout: self.config.remote_timeout,
        }
    }
}
