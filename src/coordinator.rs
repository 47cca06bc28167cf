//! Single-flight image builds.
//!
//! Each (image, tag) has at most one build in progress. Requests arriving
//! while it runs wait on the same shared result. A finished build is reused
//! for as long as the tag still resolves to the same packages and all of its
//! blobs are still in the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::digest::Digest;
use crate::error::{RegistryError, Result};
use crate::image::{Descriptor, ImageSet, ImageSynthesizer, ManifestFormat, Platform, SynthesizedImage};
use crate::package::{PackageInspector, PackageRecord, Selection};
use crate::store::BlobStore;
use crate::{log_build_complete, log_build_start};

/// One platform image of a build.
#[derive(Debug, Clone)]
pub struct PlatformBuild {
    pub platform: Platform,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    pub manifests: Vec<(ManifestFormat, Descriptor)>,
}

/// A published image: every blob it names is pinned in the store until
/// the build is invalidated.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub image: String,
    pub tag: String,
    pub selection: Selection,
    /// Sorted by platform; a single entry unless the tag spans several.
    pub platforms: Vec<PlatformBuild>,
    /// Image index and manifest list, present with several platforms.
    pub index: Vec<(ManifestFormat, Descriptor)>,
    pub built_at: DateTime<Utc>,
    /// Each distinct blob once; these are the references to release.
    blobs: Vec<Digest>,
}

impl BuiltImage {
    /// What a pull of the tag gets in `format`: the index when there is
    /// one, otherwise the image manifest.
    pub fn manifest(&self, format: ManifestFormat) -> Option<&Descriptor> {
        let manifests = if self.index.is_empty() {
            &self.platforms.first()?.manifests
        } else {
            &self.index
        };
        manifests.iter().find(|(f, _)| *f == format).map(|(_, d)| d)
    }

    /// Any manifest or index of this build with `digest`.
    pub fn manifest_by_digest(&self, digest: &Digest) -> Option<&Descriptor> {
        self.index
            .iter()
            .chain(self.platforms.iter().flat_map(|p| p.manifests.iter()))
            .map(|(_, d)| d)
            .find(|d| &d.digest == digest)
    }

    pub fn platform(&self, architecture: &str) -> Option<&PlatformBuild> {
        self.platforms.iter().find(|p| p.platform.architecture == architecture)
    }

    pub fn is_multi_platform(&self) -> bool {
        !self.index.is_empty()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs.contains(digest)
    }

    pub fn blobs(&self) -> &[Digest] {
        &self.blobs
    }
}

type SharedBuild = Shared<BoxFuture<'static, Result<Arc<BuiltImage>>>>;

enum Slot {
    Building { selection: Selection, done: SharedBuild },
    Ready(Arc<BuiltImage>),
}

type SlotKey = (String, String);

/// Build counters, updated lock-free.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    hits: AtomicU64,
    coalesced: AtomicU64,
    builds_started: AtomicU64,
    builds_failed: AtomicU64,
    invalidations: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Requests served from a ready build.
    pub hits: u64,
    /// Requests that joined a build already in progress.
    pub coalesced: u64,
    pub builds_started: u64,
    pub builds_failed: u64,
    pub invalidations: u64,
}

impl StatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.coalesced + self.builds_started;
        if total == 0 {
            0.0
        } else {
            (self.hits + self.coalesced) as f64 / total as f64
        }
    }
}

impl CoordinatorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            builds_started: self.builds_started.load(Ordering::Relaxed),
            builds_failed: self.builds_failed.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    inspector: PackageInspector,
    synthesizer: ImageSynthesizer,
    store: Arc<BlobStore>,
    slots: Mutex<HashMap<SlotKey, Slot>>,
    stats: CoordinatorStats,
}

/// Cheap to clone; clones share slots and stats.
#[derive(Clone)]
pub struct BuildCoordinator {
    inner: Arc<Inner>,
}

impl BuildCoordinator {
    pub fn new(inspector: PackageInspector, synthesizer: ImageSynthesizer, store: Arc<BlobStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                inspector,
                synthesizer,
                store,
                slots: Mutex::new(HashMap::new()),
                stats: CoordinatorStats::default(),
            }),
        }
    }

    pub fn inspector(&self) -> &PackageInspector {
        &self.inner.inspector
    }

    pub fn store(&self) -> &Arc<BlobStore> {
        &self.inner.store
    }

    /// Return the image for `image:tag`, building it if needed.
    ///
    /// The build runs on its own task: a caller that gives up does not
    /// cancel it for the others.
    #[instrument(skip(self))]
    pub async fn resolve(&self, image: &str, tag: &str) -> Result<Arc<BuiltImage>> {
        let inspector = self.inner.inspector.clone();
        let (name, reference) = (image.to_string(), tag.to_string());
        let records = tokio::task::spawn_blocking(move || inspector.resolve_image(&name, &reference))
            .await
            .map_err(|e| RegistryError::Internal(format!("package lookup task failed: {}", e)))??;
        let selection = Selection::of(&records);
        let key = (image.to_string(), tag.to_string());

        let done = {
            let mut slots = self.inner.slots.lock();
            match slots.get(&key) {
                Some(Slot::Ready(built)) if built.selection == selection && self.inner.blobs_present(built) => {
                    self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(image, tag, "Serving ready build");
                    return Ok(built.clone());
                }
                Some(Slot::Building { selection: pending, done }) if *pending == selection => {
                    self.inner.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!(image, tag, "Joining build in progress");
                    done.clone()
                }
                _ => {
                    if let Some(Slot::Ready(stale)) = slots.remove(&key) {
                        info!(image, tag, "Cached build is stale, rebuilding");
                        self.inner.stats.invalidations.fetch_add(1, Ordering::Relaxed);
                        self.inner.release_all(&stale);
                    }
                    let done = Inner::spawn_build(&self.inner, key.clone(), selection.clone(), records);
                    slots.insert(
                        key,
                        Slot::Building {
                            selection,
                            done: done.clone(),
                        },
                    );
                    done
                }
            }
        };

        done.await
    }

    /// The ready build for `image:tag`, without checking the package
    /// database.
    pub fn lookup(&self, image: &str, tag: &str) -> Option<Arc<BuiltImage>> {
        match self.inner.slots.lock().get(&(image.to_string(), tag.to_string())) {
            Some(Slot::Ready(built)) => Some(built.clone()),
            _ => None,
        }
    }

    /// Forget the ready build of `image:tag` and unpin its blobs. A build in
    /// progress is left to finish. Returns whether anything was dropped.
    pub fn invalidate(&self, image: &str, tag: &str) -> bool {
        let key = (image.to_string(), tag.to_string());
        let mut slots = self.inner.slots.lock();
        if !matches!(slots.get(&key), Some(Slot::Ready(_))) {
            return false;
        }
        if let Some(Slot::Ready(built)) = slots.remove(&key) {
            self.inner.stats.invalidations.fetch_add(1, Ordering::Relaxed);
            self.inner.release_all(&built);
        }
        true
    }

    /// The build of `image` holding the blob `digest`, if any tag of the
    /// image produces it. Ready builds are checked first; otherwise every
    /// current tag is resolved, which rebuilds whatever was evicted or
    /// never pulled.
    #[instrument(skip(self, digest), fields(digest = %digest.short()))]
    pub async fn find_by_digest(&self, image: &str, digest: &Digest) -> Result<Option<Arc<BuiltImage>>> {
        let ready = self.ready_builds(image);
        if let Some(built) = ready.into_iter().find(|b| b.contains(digest) && self.inner.store.exists(digest)) {
            return Ok(Some(built));
        }

        let inspector = self.inner.inspector.clone();
        let name = image.to_string();
        let tags = tokio::task::spawn_blocking(move || inspector.list_tags(&name))
            .await
            .map_err(|e| RegistryError::Internal(format!("package lookup task failed: {}", e)))??;

        for tag in tags {
            match self.resolve(image, &tag).await {
                Ok(built) if built.contains(digest) => return Ok(Some(built)),
                Ok(_) => {}
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => debug!(image, tag = %tag, error = %e, "Skipping tag while looking up digest"),
            }
        }
        Ok(None)
    }

    fn ready_builds(&self, image: &str) -> Vec<Arc<BuiltImage>> {
        self.inner
            .slots
            .lock()
            .iter()
            .filter_map(|((name, _), slot)| match slot {
                Slot::Ready(built) if name == image => Some(built.clone()),
                _ => None,
            })
            .collect()
    }

    /// (image, tag) pairs with a ready build, sorted.
    pub fn known_images(&self) -> Vec<(String, String)> {
        let mut known: Vec<_> = self
            .inner
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(key, _)| key.clone())
            .collect();
        known.sort();
        known
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl Inner {
    fn spawn_build(
        inner: &Arc<Inner>,
        key: SlotKey,
        selection: Selection,
        records: Vec<Arc<PackageRecord>>,
    ) -> SharedBuild {
        inner.stats.builds_started.fetch_add(1, Ordering::Relaxed);
        let task_inner = inner.clone();

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let (image, tag) = key.clone();
            log_build_start!(image, tag, records.len());

            let build_inner = task_inner.clone();
            let build_selection = selection.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let synthesized = build_inner.synthesizer.synthesize_all(&records)?;
                build_inner.publish(&image, &tag, build_selection, synthesized)
            })
            .await
            .unwrap_or_else(|e| Err(RegistryError::Internal(format!("build task failed: {}", e))));

            task_inner.finish(key, &selection, outcome, started)
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(RegistryError::Internal(format!("build task failed: {}", e))))
        }
        .boxed()
        .shared()
    }

    /// Pin every blob of `set` and describe it. On a storage failure the
    /// blobs pinned so far are released again.
    fn publish(&self, image: &str, tag: &str, selection: Selection, set: ImageSet) -> Result<Arc<BuiltImage>> {
        let mut pinned = Vec::new();
        for blob in set.blobs() {
            match self.store.put_retained(&blob.bytes, blob.media_type) {
                Ok(digest) => pinned.push(digest),
                Err(e) => {
                    for digest in &pinned {
                        self.release_one(digest);
                    }
                    return Err(e);
                }
            }
        }

        let mut platforms: Vec<_> = set.images.iter().map(describe_platform).collect();
        platforms.sort_by(|a, b| a.platform.cmp(&b.platform));
        let index = set
            .index
            .iter()
            .map(|(format, blob)| (*format, blob.descriptor(format.index_media_type())))
            .collect();

        Ok(Arc::new(BuiltImage {
            image: image.to_string(),
            tag: tag.to_string(),
            selection,
            platforms,
            index,
            built_at: Utc::now(),
            blobs: pinned,
        }))
    }

    /// Settle the slot of a finished build and pass the outcome on to the
    /// waiters.
    fn finish(
        &self,
        key: SlotKey,
        selection: &Selection,
        outcome: Result<Arc<BuiltImage>>,
        started: Instant,
    ) -> Result<Arc<BuiltImage>> {
        let mut slots = self.slots.lock();
        let current = matches!(
            slots.get(&key),
            Some(Slot::Building { selection: pending, .. }) if pending == selection
        );

        match &outcome {
            Ok(built) => {
                let manifest = built
                    .manifest(ManifestFormat::Oci)
                    .map(|d| d.digest.to_string())
                    .unwrap_or_default();
                log_build_complete!(key.0, key.1, manifest, started.elapsed().as_millis() as u64);
                if current {
                    slots.insert(key, Slot::Ready(built.clone()));
                } else {
                    // superseded while building; nobody will release it later
                    self.release_all(built);
                }
            }
            Err(e) => {
                self.stats.builds_failed.fetch_add(1, Ordering::Relaxed);
                if e.is_retryable() {
                    warn!(image = %key.0, tag = %key.1, error = %e, "Image build failed");
                } else {
                    error!(image = %key.0, tag = %key.1, error = %e, "Image build failed");
                }
                if current {
                    slots.remove(&key);
                }
            }
        }
        outcome
    }

    fn blobs_present(&self, built: &BuiltImage) -> bool {
        built.blobs.iter().all(|d| self.store.exists(d))
    }

    fn release_all(&self, built: &BuiltImage) {
        for digest in &built.blobs {
            self.release_one(digest);
        }
    }

    fn release_one(&self, digest: &Digest) {
        if let Err(e) = self.store.release(digest) {
            warn!(digest = %digest.short(), error = %e, "Failed to release blob");
        }
    }
}

fn describe_platform(image: &SynthesizedImage) -> PlatformBuild {
    let assembled = &image.assembled;
    PlatformBuild {
        platform: image.platform(),
        config: assembled.config.descriptor(assembled.config.media_type),
        layers: image
            .layers
            .iter()
            .map(|l| Descriptor {
                media_type: l.media_type.to_string(),
                digest: l.digest.clone(),
                size: l.size,
            })
            .collect(),
        manifests: assembled
            .manifests
            .iter()
            .map(|(format, blob)| (*format, blob.descriptor(format.manifest_media_type())))
            .collect(),
    }
}
