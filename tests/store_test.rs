use std::fs;
use std::sync::Arc;

use pkgimage::digest::Digest;
use pkgimage::error::RegistryError;
use pkgimage::store::{BlobStore, LocalStorage};
use tempfile::tempdir;

#[test]
fn test_fs_store_roundtrip_and_dedup() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(LocalStorage::new(dir.path()).unwrap());
    let store = BlobStore::new(backend.clone(), 1024 * 1024);

    let data = b"layer bytes";
    let first = store.put(data, "application/octet-stream").unwrap();
    let second = store.put(data, "application/octet-stream").unwrap();
    assert_eq!(first, second);
    assert_eq!(first, Digest::of(data));
    assert_eq!(store.len(), 1);
    assert!(backend.blob_path(&first).exists());

    let blob = store.get(&first).unwrap();
    assert_eq!(&blob.bytes[..], data);
    assert_eq!(blob.info.size, data.len() as u64);
}

#[test]
fn test_out_of_band_modification_is_detected_and_purged() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempdir().unwrap();
    let backend = Arc::new(LocalStorage::new(dir.path()).unwrap());
    let store = BlobStore::new(backend.clone(), 1024 * 1024);

    let digest = store.put_retained(b"trusted content", "application/octet-stream").unwrap();
    let path = backend.blob_path(&digest);
    fs::write(&path, b"tampered content").unwrap();

    match store.get(&digest) {
        Err(RegistryError::DigestMismatch { expected, actual, size }) => {
            assert_eq!(expected, digest);
            assert_eq!(actual, Digest::of(b"tampered content"));
            assert_eq!(size, b"tampered content".len());
        }
        other => panic!("expected digest mismatch, got {:?}", other.map(|b| b.info)),
    }

    assert!(!path.exists());
    assert!(!store.exists(&digest));
    assert!(matches!(store.get(&digest), Err(RegistryError::BlobUnknown(_))));

    // a clean re-put restores it
    store.put(b"trusted content", "application/octet-stream").unwrap();
    assert!(store.get(&digest).is_ok());
}

#[test]
fn test_capacity_evicts_only_unreferenced_blobs() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(LocalStorage::new(dir.path()).unwrap());
    let store = BlobStore::new(backend.clone(), 32);

    let pinned = store.put_retained(&[1u8; 20], "x").unwrap();
    let loose = store.put(&[2u8; 10], "x").unwrap();
    store.put(&[3u8; 10], "x").unwrap();

    assert!(store.exists(&pinned));
    assert!(!store.exists(&loose));
    assert!(!backend.blob_path(&loose).exists());
    assert!(store.total_bytes() <= 32);

    // a released blob rejoins the queue as most recently used
    store.release(&pinned).unwrap();
    store.put(&[4u8; 10], "x").unwrap();
    assert!(store.exists(&pinned));
    store.put(&[5u8; 10], "x").unwrap();
    assert!(!store.exists(&pinned));
    assert!(!backend.blob_path(&pinned).exists());
}

#[test]
fn test_concurrent_puts_of_same_blob() {
    let store = Arc::new(BlobStore::in_memory(1024 * 1024));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            std::thread::spawn(move || store.put_retained(b"shared", "x").unwrap())
        })
        .collect();
    let digests: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(digests.iter().all(|d| *d == digests[0]));
    assert_eq!(store.len(), 1);
    assert_eq!(store.stat(&digests[0]).unwrap().refs, 8);
}

#[test]
fn test_restart_reindexes_blobs_on_disk() {
    let dir = tempdir().unwrap();
    let kept = {
        let store = BlobStore::new(Arc::new(LocalStorage::new(dir.path()).unwrap()), 16);
        store.put(b"from last run", "application/octet-stream").unwrap()
    };

    let backend = Arc::new(LocalStorage::new(dir.path()).unwrap());
    let store = BlobStore::new(backend.clone(), 16);
    assert!(store.exists(&kept));
    assert_eq!(store.total_bytes(), 13);
    assert_eq!(&store.get(&kept).unwrap().bytes[..], b"from last run");

    // old blobs count against the capacity and are evicted like new ones
    store.put(b"fresh", "x").unwrap();
    store.put(b"fresher", "x").unwrap();
    assert!(!store.exists(&kept));
    assert!(!backend.blob_path(&kept).exists());
    assert!(store.total_bytes() <= 16);
}
