use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::digest::Digest;

/// Raw byte storage under digest keys. Verification and accounting live in
/// [`super::BlobStore`]; backends only move bytes.
pub trait BlobBackend: Send + Sync {
    fn put(&self, digest: &Digest, data: &[u8]) -> io::Result<()>;
    fn get(&self, digest: &Digest) -> io::Result<Option<Bytes>>;
    fn exists(&self, digest: &Digest) -> io::Result<bool>;
    fn delete(&self, digest: &Digest) -> io::Result<()>;

    /// Every stored blob and its size, so an index can be rebuilt after a
    /// restart.
    fn list(&self) -> io::Result<Vec<(Digest, u64)>>;
}

#[derive(Default)]
pub struct MemoryBackend {
    blobs: RwLock<HashMap<Digest, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace stored bytes without touching the index, as a bit flip
    /// would.
    pub fn corrupt(&self, digest: &Digest, data: impl Into<Bytes>) {
        self.blobs.write().insert(digest.clone(), data.into());
    }
}

impl BlobBackend for MemoryBackend {
    fn put(&self, digest: &Digest, data: &[u8]) -> io::Result<()> {
        self.blobs
            .write()
            .entry(digest.clone())
            .or_insert_with(|| Bytes::copy_from_slice(data));
        Ok(())
    }

    fn get(&self, digest: &Digest) -> io::Result<Option<Bytes>> {
        Ok(self.blobs.read().get(digest).cloned())
    }

    fn exists(&self, digest: &Digest) -> io::Result<bool> {
        Ok(self.blobs.read().contains_key(digest))
    }

    fn delete(&self, digest: &Digest) -> io::Result<()> {
        self.blobs.write().remove(digest);
        Ok(())
    }

    fn list(&self) -> io::Result<Vec<(Digest, u64)>> {
        Ok(self
            .blobs
            .read()
            .iter()
            .map(|(digest, bytes)| (digest.clone(), bytes.len() as u64))
            .collect())
    }
}

/// Blobs as files under `<root>/blobs/sha256/ab/cd/abcd...`.
pub struct LocalStorage {
    base_dir: PathBuf,
}

impl LocalStorage {
    pub fn new(base_dir: &Path) -> io::Result<Self> {
        let blobs_dir = base_dir.join("blobs").join("sha256");
        fs::create_dir_all(&blobs_dir)?;
        Ok(Self { base_dir: blobs_dir })
    }

    /// Where the bytes of `digest` live on disk.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.hex();
        self.base_dir.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }
}

impl BlobBackend for LocalStorage {
    fn put(&self, digest: &Digest, data: &[u8]) -> io::Result<()> {
        let path = self.blob_path(digest);
        if path.exists() {
            return Ok(());
        }
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "blob path has no parent"))?;
        fs::create_dir_all(parent)?;

        // readers must never see a partial blob
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn get(&self, digest: &Digest) -> io::Result<Option<Bytes>> {
        match fs::read(self.blob_path(digest)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn exists(&self, digest: &Digest) -> io::Result<bool> {
        Ok(self.blob_path(digest).exists())
    }

    fn delete(&self, digest: &Digest) -> io::Result<()> {
        match fs::remove_file(self.blob_path(digest)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Walks the two shard levels. Temp files left by an interrupted write
    /// are removed; other stray files are skipped.
    fn list(&self) -> io::Result<Vec<(Digest, u64)>> {
        let mut found = Vec::new();
        for first in fs::read_dir(&self.base_dir)? {
            let first = first?;
            if !first.file_type()?.is_dir() {
                continue;
            }
            for second in fs::read_dir(first.path())? {
                let second = second?;
                if !second.file_type()?.is_dir() {
                    continue;
                }
                for file in fs::read_dir(second.path())? {
                    let file = file?;
                    let name = file.file_name().to_string_lossy().into_owned();
                    if name.starts_with(".tmp") {
                        debug!(path = %file.path().display(), "Removing interrupted blob write");
                        fs::remove_file(file.path())?;
                        continue;
                    }
                    match Digest::from_str(&format!("sha256:{}", name)) {
                        Ok(digest) if file.path() == self.blob_path(&digest) => {
                            found.push((digest, file.metadata()?.len()));
                        }
                        _ => warn!(path = %file.path().display(), "Ignoring unexpected file in blob directory"),
                    }
                }
            }
        }
        found.sort();
        Ok(found)
    }
}
