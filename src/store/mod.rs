//! Content-addressed blob store with verified reads.
//!
//! Every read re-hashes the stored bytes. A blob that no longer matches its
//! digest is purged and reported, never served. Blobs referenced by a
//! published image are pinned; unreferenced ones are evicted least recently
//! used first once the store grows past its capacity.

pub mod backend;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::digest::Digest;
use crate::error::{RegistryError, Result};
use crate::{log_blob_hit, log_blob_miss, log_blob_store, log_digest_mismatch};

pub use backend::{BlobBackend, LocalStorage, MemoryBackend};

/// Index entry for a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobInfo {
    pub digest: Digest,
    pub size: u64,
    pub media_type: String,
    /// Published images referencing this blob.
    pub refs: usize,
}

/// Verified blob contents.
#[derive(Debug, Clone)]
pub struct Blob {
    pub info: BlobInfo,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub blobs: usize,
    pub total_bytes: u64,
    pub pinned: usize,
    pub capacity_bytes: u64,
}

/// Media type of blobs found on disk at startup, until a put names it.
const RESTORED_MEDIA_TYPE: &str = "application/octet-stream";

struct Index {
    entries: HashMap<Digest, BlobInfo>,
    /// Zero-reference blobs, least recently used first.
    idle: LruCache<Digest, ()>,
    /// Digests a put is writing to the backend, with the number of writers.
    writing: HashMap<Digest, usize>,
    /// References held on blobs purged after failing verification. They
    /// carry over to the blob once it is stored again.
    orphaned_refs: HashMap<Digest, usize>,
    total_bytes: u64,
}

impl Index {
    /// Account one more put of an already stored blob. False when the blob
    /// is not in the index.
    fn reuse(&mut self, digest: &Digest, media_type: &str, retain: bool) -> bool {
        let Some(info) = self.entries.get_mut(digest) else {
            return false;
        };
        if info.media_type == RESTORED_MEDIA_TYPE {
            info.media_type = media_type.to_string();
        }
        if retain {
            info.refs += 1;
            self.idle.pop(digest);
        } else if info.refs == 0 {
            self.idle.promote(digest);
        }
        true
    }

    fn finish_write(&mut self, digest: &Digest) {
        if let Some(writers) = self.writing.get_mut(digest) {
            *writers -= 1;
            if *writers == 0 {
                self.writing.remove(digest);
            }
        }
    }
}

pub struct BlobStore {
    backend: Arc<dyn BlobBackend>,
    index: Mutex<Index>,
    capacity: u64,
}

impl BlobStore {
    /// Blobs the backend already holds are indexed as unreferenced, so
    /// they count against `capacity` and can be served or evicted.
    pub fn new(backend: Arc<dyn BlobBackend>, capacity: u64) -> Self {
        let mut index = Index {
            entries: HashMap::new(),
            idle: LruCache::unbounded(),
            writing: HashMap::new(),
            orphaned_refs: HashMap::new(),
            total_bytes: 0,
        };
        match backend.list() {
            Ok(existing) if !existing.is_empty() => {
                for (digest, size) in existing {
                    index.idle.put(digest.clone(), ());
                    index.total_bytes += size;
                    index.entries.insert(
                        digest.clone(),
                        BlobInfo {
                            digest,
                            size,
                            media_type: RESTORED_MEDIA_TYPE.to_string(),
                            refs: 0,
                        },
                    );
                }
                info!(
                    blobs = index.entries.len(),
                    total_bytes = index.total_bytes,
                    "Restored blob index"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to list stored blobs, starting with an empty index"),
        }

        let store = Self {
            backend,
            index: Mutex::new(index),
            capacity,
        };
        let mut index = store.index.lock();
        if let Err(e) = store.evict(&mut index, None) {
            warn!(error = %e, "Failed to trim restored blobs");
        }
        drop(index);
        store
    }

    pub fn in_memory(capacity: u64) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), capacity)
    }

    /// Store `bytes` and return their digest. Storing the same bytes twice
    /// keeps a single copy.
    pub fn put(&self, bytes: &[u8], media_type: &str) -> Result<Digest> {
        self.insert(bytes, media_type, false)
    }

    /// Like [`BlobStore::put`], also taking a reference so the blob cannot
    /// be evicted before the caller publishes it.
    pub fn put_retained(&self, bytes: &[u8], media_type: &str) -> Result<Digest> {
        self.insert(bytes, media_type, true)
    }

    /// Verified bytes of `digest`.
    pub fn get(&self, digest: &Digest) -> Result<Blob> {
        let info = {
            let mut index = self.index.lock();
            let Some(info) = index.entries.get(digest).cloned() else {
                log_blob_miss!(digest);
                return Err(RegistryError::BlobUnknown(digest.clone()));
            };
            index.idle.promote(digest);
            info
        };

        let Some(bytes) = self
            .backend
            .get(digest)
            .map_err(|e| RegistryError::storage("get", e))?
        else {
            // evicted between the index lookup and the read
            log_blob_miss!(digest);
            return Err(RegistryError::BlobUnknown(digest.clone()));
        };

        let actual = Digest::of(&bytes);
        if actual != *digest {
            log_digest_mismatch!(digest, actual, bytes.len());
            self.purge(digest)?;
            return Err(RegistryError::DigestMismatch {
                expected: digest.clone(),
                actual,
                size: bytes.len(),
            });
        }

        log_blob_hit!(digest, bytes.len());
        Ok(Blob { info, bytes })
    }

    /// Index lookup only; does not read or verify the bytes.
    pub fn exists(&self, digest: &Digest) -> bool {
        self.index.lock().entries.contains_key(digest)
    }

    pub fn stat(&self, digest: &Digest) -> Option<BlobInfo> {
        self.index.lock().entries.get(digest).cloned()
    }

    /// Pin `digest`. Returns false when the blob is not stored.
    pub fn retain(&self, digest: &Digest) -> bool {
        let mut index = self.index.lock();
        let Some(info) = index.entries.get_mut(digest) else {
            return false;
        };
        info.refs += 1;
        index.idle.pop(digest);
        true
    }

    /// Drop one reference. The last release makes the blob evictable.
    pub fn release(&self, digest: &Digest) -> Result<()> {
        let mut guard = self.index.lock();
        let index = &mut *guard;
        let Some(info) = index.entries.get_mut(digest) else {
            if let Some(refs) = index.orphaned_refs.get_mut(digest) {
                *refs -= 1;
                if *refs == 0 {
                    index.orphaned_refs.remove(digest);
                }
            }
            return Ok(());
        };
        info.refs = info.refs.saturating_sub(1);
        if info.refs == 0 {
            index.idle.put(digest.clone(), ());
        }
        self.evict(index, None)
    }

    pub fn total_bytes(&self) -> u64 {
        self.index.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let index = self.index.lock();
        StoreStats {
            blobs: index.entries.len(),
            total_bytes: index.total_bytes,
            pinned: index.entries.values().filter(|i| i.refs > 0).count(),
            capacity_bytes: self.capacity,
        }
    }

    /// Hashing and the backend write run without the index lock; only the
    /// bookkeeping before and after takes it. A digest being written is not
    /// in `entries`, so eviction cannot delete its file, and purge leaves
    /// the file to the writer.
    fn insert(&self, bytes: &[u8], media_type: &str, retain: bool) -> Result<Digest> {
        let digest = Digest::of(bytes);
        {
            let mut index = self.index.lock();
            if index.reuse(&digest, media_type, retain) {
                return Ok(digest);
            }
            *index.writing.entry(digest.clone()).or_insert(0) += 1;
        }

        let written = self.backend.put(&digest, bytes);

        let mut index = self.index.lock();
        index.finish_write(&digest);
        written.map_err(|e| RegistryError::storage("put", e))?;

        // a concurrent put of the same bytes may have finished first
        if !index.reuse(&digest, media_type, retain) {
            log_blob_store!(digest, bytes.len());
            let refs = index.orphaned_refs.remove(&digest).unwrap_or(0) + usize::from(retain);
            if refs == 0 {
                index.idle.put(digest.clone(), ());
            }
            index.entries.insert(
                digest.clone(),
                BlobInfo {
                    digest: digest.clone(),
                    size: bytes.len() as u64,
                    media_type: media_type.to_string(),
                    refs,
                },
            );
            index.total_bytes += bytes.len() as u64;
        }

        self.evict(&mut index, Some(&digest))?;
        Ok(digest)
    }

    /// Evict idle blobs, least recently used first, until the store fits.
    /// `keep` is never chosen, so a put always leaves its own blob stored.
    fn evict(&self, index: &mut Index, keep: Option<&Digest>) -> Result<()> {
        let kept = keep.and_then(|d| index.idle.pop(d).map(|()| d.clone()));
        let mut result = Ok(());

        while index.total_bytes > self.capacity {
            let Some((digest, ())) = index.idle.pop_lru() else {
                warn!(
                    total_bytes = index.total_bytes,
                    capacity = self.capacity,
                    "Blob store over capacity with every blob pinned"
                );
                break;
            };
            if let Some(info) = index.entries.remove(&digest) {
                index.total_bytes -= info.size;
                info!(digest = %digest.short(), size = info.size, "Evicting blob");
            }
            if let Err(e) = self.backend.delete(&digest) {
                result = Err(RegistryError::storage("evict", e));
                break;
            }
        }

        if let Some(digest) = kept {
            index.idle.put(digest, ());
        }
        result
    }

    fn purge(&self, digest: &Digest) -> Result<()> {
        let mut index = self.index.lock();
        if let Some(info) = index.entries.remove(digest) {
            index.total_bytes -= info.size;
            if info.refs > 0 {
                *index.orphaned_refs.entry(digest.clone()).or_insert(0) += info.refs;
            }
        }
        index.idle.pop(digest);
        if index.writing.contains_key(digest) {
            // a fresh copy is on its way; deleting now would remove it
            return Ok(());
        }
        self.backend
            .delete(digest)
            .map_err(|e| RegistryError::storage("purge", e))
    }
}
