use std::time::Duration;

use bytes::Bytes;
use fieldsync_blob::{
    BlobConfig, BlobError, BlobFilter, BlobId, BlobRef, BlobResult, BlobStore, BlobStream,
    DownloadOptions, DownloadState, DownloadStatus, LiveDownload,
};
use fieldsync_core::memory::MemoryCoreRegistry;
use fieldsync_core::{CorePurpose, CoreRegistry};
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn device() -> (MemoryCoreRegistry, BlobStore) {
    let registry = MemoryCoreRegistry::random();
    let config = BlobConfig::new().with_remote_timeout(Some(Duration::from_millis(50)));
    let store = BlobStore::new(registry.clone(), config);
    (registry, store)
}

async fn wait_for<F>(download: &LiveDownload, predicate: F) -> DownloadState
where
    F: FnMut(&DownloadState) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), download.wait_until(predicate))
        .await
        .expect("Timeout waiting for download state")
}

fn is_available(result: BlobResult<BlobStream>) -> bool {
    result.is_ok()
}

/// L1. A fresh download reports an empty `downloaded` state that is not completion
#[tokio::test]
async fn test_initial_state() {
    let (_registry, store) = device();
    let download = store.download(None, DownloadOptions::new());

    let state = download.state();
    assert_eq!(state.status, DownloadStatus::Downloaded);
    assert_eq!(state.have_count, 0);
    assert!(!state.is_complete());
}

/// L2. A filtered download fetches only the listed variants
#[tokio::test]
async fn test_filtered_download() {
    let (alice_registry, alice) = device();
    let (bob_registry, bob) = device();
    let drive_id = alice.writer_drive_id().clone();
    for variant in ["original", "preview", "thumbnail"] {
        alice
            .put(&BlobId::new("photo", variant, "p1"), vec![9u8; 1000])
            .await
            .unwrap();
    }
    alice
        .put(&BlobId::new("audio", "m4a", "a1"), vec![1u8; 1000])
        .await
        .unwrap();

    let filter = BlobFilter::new().with_type("photo", ["original", "preview"]);
    let download = bob.download(Some(filter), DownloadOptions::new());
    let link = alice_registry.replicate(&bob_registry);

    // 6 index records (2 data core slots and 4 entries) plus 2 data blocks
    let state = wait_for(&download, |s| s.is_complete() && s.want_count == 8).await;
    assert_eq!(state.have_count, 8);
    link.disconnect();

    for variant in ["original", "preview"] {
        let blob = BlobRef::new(drive_id.clone(), BlobId::new("photo", variant, "p1"));
        let stream = bob.create_read_stream(&blob).await.unwrap();
        let blocks: Vec<_> = stream.collect().await;
        assert!(blocks.iter().all(Result::is_ok));
    }

    let thumbnail = BlobRef::new(drive_id.clone(), BlobId::new("photo", "thumbnail", "p1"));
    let excluded = bob.create_read_stream(&thumbnail).await;
    assert!(matches!(excluded, Err(BlobError::BlockNotAvailable { .. })));
    assert!(bob.get(&thumbnail).await.is_err());

    let audio = BlobRef::new(drive_id, BlobId::new("audio", "m4a", "a1"));
    assert!(!is_available(bob.create_read_stream(&audio).await));
}

/// L3. Blobs written while connected are picked up without restarting
#[tokio::test]
async fn test_live_append() {
    let (alice_registry, alice) = device();
    let (bob_registry, bob) = device();
    let download = bob.download(None, DownloadOptions::new());
    let _link = alice_registry.replicate(&bob_registry);

    let id = BlobId::new("photo", "original", "later");
    let drive_id = alice.put(&id, vec![5u8; 70_000]).await.unwrap();

    // data core slot, entry, and two data blocks
    wait_for(&download, |s| s.is_complete() && s.want_count == 4).await;
    let stream = bob.create_read_stream(&BlobRef::new(drive_id, id)).await;
    assert!(is_available(stream));
}

/// L4. A drive that joins after the download started is tracked too
#[tokio::test]
async fn test_second_drive_joins() {
    let (alice_registry, alice) = device();
    let (bob_registry, bob) = device();
    let (carol_registry, carol) = device();

    let download = carol.download(None, DownloadOptions::new());
    let first = BlobId::new("photo", "original", "from-alice");
    let alice_drive = alice.put(&first, &b"alice"[..]).await.unwrap();
    let _alice_link = alice_registry.replicate(&carol_registry);
    wait_for(&download, |s| s.is_complete() && s.want_count == 3).await;

    let _bob_link = bob_registry.replicate(&carol_registry);
    let second = BlobId::new("photo", "original", "from-bob");
    let bob_drive = bob.put(&second, &b"bob"[..]).await.unwrap();

    let state = wait_for(&download, |s| s.is_complete() && s.want_count == 6).await;
    assert_eq!(state.have_count, 6);

    let stream = carol.create_read_stream(&BlobRef::new(alice_drive, first)).await;
    assert!(is_available(stream));
    let stream = carol.create_read_stream(&BlobRef::new(bob_drive, second)).await;
    assert!(is_available(stream));
}

/// L5. After the signal fires, new blobs are not fetched; earlier ones stay
#[tokio::test]
async fn test_abort_stops_fetching() {
    let (alice_registry, alice) = device();
    let (bob_registry, bob) = device();
    let signal = CancellationToken::new();
    let download = bob.download(None, DownloadOptions::new().with_signal(signal.clone()));
    let _link = alice_registry.replicate(&bob_registry);

    let before = BlobId::new("photo", "original", "before");
    let drive_id = alice.put(&before, &b"kept"[..]).await.unwrap();
    wait_for(&download, |s| s.is_complete() && s.want_count == 3).await;

    signal.cancel();
    // Resolves once the controller has stopped and released its requests
    wait_for(&download, |_| false).await;
    assert!(download.is_aborted());

    let after = BlobId::new("photo", "original", "after");
    alice.put(&after, &b"skipped"[..]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Resolving the entry pulls index records, never data blocks
    let skipped = BlobRef::new(drive_id.clone(), after);
    bob.entry(&skipped).await.unwrap();
    let result = bob.create_read_stream(&skipped).await;
    assert!(matches!(result, Err(BlobError::BlockNotAvailable { .. })));

    let kept = bob.create_read_stream(&BlobRef::new(drive_id, before)).await;
    assert!(is_available(kept));
}

/// L6. The state stream reports downloading before downloaded
#[tokio::test]
async fn test_state_changes_stream() {
    let (alice_registry, alice) = device();
    let (bob_registry, bob) = device();
    alice
        .put(&BlobId::new("photo", "original", "a"), &b"pixels"[..])
        .await
        .unwrap();

    let download = bob.download(None, DownloadOptions::new());
    let mut changes = download.changes();
    let first = changes.next().await.unwrap();
    assert_eq!(first.have_count, 0);

    let _link = alice_registry.replicate(&bob_registry);
    let last = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let state = changes.next().await.expect("download stopped");
            if state.is_complete() {
                break state;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(last.want_count, 3);
    download.shutdown().await;
}

/// L7. A corrupt index record is skipped and the download keeps running
#[tokio::test]
async fn test_corrupt_record_is_skipped() {
    let (alice_registry, alice) = device();
    let (bob_registry, bob) = device();
    let mallory_registry = MemoryCoreRegistry::random();
    let index = mallory_registry.writer_core(CorePurpose::BlobIndex);
    let data = mallory_registry.named_writer_core(CorePurpose::Blob, "data");
    let records = [
        json!({"kind": "data_core", "slot": 0, "key": data.key.to_hex(), "name": "data"}),
        json!({
            "kind": "entry",
            "blob_id": {"type": "photo", "variant": "original", "name": "overflow"},
            "data_core": 0,
            "block_offset": u64::MAX,
            "block_length": 2,
            "byte_length": 10
        }),
    ];
    let blocks = records.iter().map(|r| Bytes::from(r.to_string())).collect();
    index.core.append(blocks).await.unwrap();

    let download = bob.download(None, DownloadOptions::new());
    let _mallory = mallory_registry.replicate(&bob_registry);
    // Both index records, and no data for the skipped entry
    wait_for(&download, |s| s.is_complete() && s.want_count == 2).await;

    let id = BlobId::new("photo", "original", "fine");
    let drive_id = alice.put(&id, &b"pixels"[..]).await.unwrap();
    let _alice = alice_registry.replicate(&bob_registry);
    let state = wait_for(&download, |s| s.is_complete() && s.want_count == 5).await;
    assert_eq!(state.have_count, 5);

    let stream = bob.create_read_stream(&BlobRef::new(drive_id, id)).await;
    assert!(is_available(stream));
}
