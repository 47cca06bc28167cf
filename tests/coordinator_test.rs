use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pkgimage::coordinator::BuildCoordinator;
use pkgimage::error::{RegistryError, Result};
use pkgimage::image::{ImageDefaults, ImageSynthesizer, LayerMode, ManifestFormat};
use pkgimage::package::{
    Capability, FileEntry, MemoryDatabase, MemoryPackage, PackageDatabase, PackageHeader, PackageInspector,
};
use pkgimage::store::{BlobStore, MemoryBackend};

/// Delegates to a [`MemoryDatabase`], slowing down and counting payload reads.
struct SlowDatabase {
    inner: MemoryDatabase,
    delay: Duration,
    payload_reads: AtomicUsize,
}

impl PackageDatabase for SlowDatabase {
    fn installed(&self) -> Result<Vec<PackageHeader>> {
        self.inner.installed()
    }

    fn lookup(&self, name: &str) -> Result<Vec<PackageHeader>> {
        self.inner.lookup(name)
    }

    fn what_provides(&self, capability: &str) -> Result<Vec<PackageHeader>> {
        self.inner.what_provides(capability)
    }

    fn provides(&self, package: &PackageHeader) -> Result<Vec<Capability>> {
        self.inner.provides(package)
    }

    fn files(&self, package: &PackageHeader) -> Result<Vec<FileEntry>> {
        self.inner.files(package)
    }

    fn open_payload(&self, package: &PackageHeader, entry: &FileEntry) -> Result<Box<dyn Read + Send>> {
        self.payload_reads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.inner.open_payload(package, entry)
    }
}

struct Fixture {
    db: MemoryDatabase,
    slow: Arc<SlowDatabase>,
    backend: Arc<MemoryBackend>,
    coordinator: BuildCoordinator,
}

fn fixture(delay: Duration) -> Fixture {
    let db = MemoryDatabase::new();
    db.install(MemoryPackage::new("foo", "1.0", "1", "x86_64").file("/usr/bin/foo", 0o755, "foo v1"));
    let slow = Arc::new(SlowDatabase {
        inner: db.clone(),
        delay,
        payload_reads: AtomicUsize::new(0),
    });
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(BlobStore::new(backend.clone(), 64 * 1024 * 1024));
    let coordinator = BuildCoordinator::new(
        PackageInspector::new(slow.clone(), true),
        ImageSynthesizer::new(LayerMode::PerPackage, ImageDefaults::default()),
        store,
    );
    Fixture {
        db,
        slow,
        backend,
        coordinator,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_build() {
    let _ = tracing_subscriber::fmt::try_init();
    let f = fixture(Duration::from_millis(200));

    let requests: Vec<_> = (0..16)
        .map(|_| {
            let coordinator = f.coordinator.clone();
            tokio::spawn(async move { coordinator.resolve("foo", "latest").await })
        })
        .collect();
    let results = futures::future::join_all(requests).await;

    let built: Vec<_> = results.into_iter().map(|r| r.unwrap().unwrap()).collect();
    assert!(built.iter().all(|b| Arc::ptr_eq(b, &built[0])));

    let stats = f.coordinator.stats();
    assert_eq!(stats.builds_started, 1);
    assert_eq!(stats.hits + stats.coalesced, 15);
    assert_eq!(f.slow.payload_reads.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_request_does_not_cancel_build() {
    let f = fixture(Duration::from_millis(200));

    let coordinator = f.coordinator.clone();
    let first = tokio::spawn(async move { coordinator.resolve("foo", "latest").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    first.abort();

    let built = f.coordinator.resolve("foo", "latest").await.unwrap();
    assert_eq!(f.coordinator.stats().builds_started, 1);
    assert!(built.manifest(ManifestFormat::Oci).is_some());
}

#[tokio::test]
async fn test_upgrade_invalidates_cached_build() {
    let f = fixture(Duration::ZERO);

    let old = f.coordinator.resolve("foo", "latest").await.unwrap();
    f.db.install(MemoryPackage::new("foo", "1.0", "2", "x86_64").file("/usr/bin/foo", 0o755, "foo v2"));
    let new = f.coordinator.resolve("foo", "latest").await.unwrap();

    let digest = |b: &pkgimage::BuiltImage| b.manifest(ManifestFormat::Oci).unwrap().digest.clone();
    assert_ne!(digest(&old), digest(&new));
    assert_ne!(old.selection, new.selection);

    let stats = f.coordinator.stats();
    assert_eq!(stats.builds_started, 2);
    assert_eq!(stats.invalidations, 1);

    let store = f.coordinator.store();
    for blob in old.blobs() {
        if !new.blobs().contains(blob) {
            assert_eq!(store.stat(blob).map(|i| i.refs).unwrap_or(0), 0);
        }
    }

    // the pinned tag still serves the old release only while it is installed
    assert!(matches!(
        f.coordinator.resolve("foo", "1.0-1").await,
        Err(RegistryError::TagUnknown { .. })
    ));
}

#[tokio::test]
async fn test_failed_build_returns_to_idle() {
    let f = fixture(Duration::ZERO);
    f.db.install(MemoryPackage::new("bar", "1.0", "1", "x86_64").broken_file("/usr/lib/libbar.so", 0o755, 128));

    let err = f.coordinator.resolve("bar", "latest").await.unwrap_err();
    assert!(matches!(err, RegistryError::PayloadUnreadable { .. }));
    assert!(f.coordinator.lookup("bar", "latest").is_none());
    assert_eq!(f.coordinator.stats().builds_failed, 1);

    // nothing is remembered: the next request tries again
    f.db.install(MemoryPackage::new("bar", "1.0", "2", "x86_64").file("/usr/lib/libbar.so", 0o755, "elf"));
    f.coordinator.resolve("bar", "latest").await.unwrap();
    assert_eq!(f.coordinator.stats().builds_started, 2);
    assert!(f.coordinator.lookup("bar", "latest").is_some());
}

#[tokio::test]
async fn test_purged_blob_triggers_rebuild() {
    let f = fixture(Duration::ZERO);

    let built = f.coordinator.resolve("foo", "latest").await.unwrap();
    let layer = built.platforms[0].layers[0].digest.clone();
    f.backend.corrupt(&layer, &b"bit rot"[..]);
    assert!(matches!(
        f.coordinator.store().get(&layer),
        Err(RegistryError::DigestMismatch { .. })
    ));

    let rebuilt = f.coordinator.resolve("foo", "latest").await.unwrap();
    assert_eq!(f.coordinator.stats().builds_started, 2);
    assert_eq!(rebuilt.platforms[0].layers[0].digest, layer);
    assert_eq!(&f.coordinator.store().get(&layer).unwrap().info.digest, &layer);
}
