use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read};
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::GzDecoder;
use tar::EntryType;
use tracing::debug;

use super::reproducible::{layer_encoder, normalized_header};
use crate::constants::OCI_LAYER_MEDIA_TYPE;
use crate::digest::{Digest, HashingWriter};
use crate::error::{RegistryError, Result};
use crate::package::inspector::merge_entries;
use crate::package::{FileEntry, FileKind, Ownership, PackageRecord, PayloadRef};

/// A finished, compressed filesystem layer.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Digest of the compressed bytes; the blob name.
    pub digest: Digest,
    /// Digest of the uncompressed tar stream; goes into the config rootfs.
    pub diff_id: Digest,
    pub size: u64,
    pub uncompressed_size: u64,
    pub media_type: &'static str,
    pub bytes: Bytes,
    /// Image history text for this layer.
    pub created_by: String,
}

impl Layer {
    /// Re-hash the compressed bytes and the decompressed stream and check
    /// both against the recorded digests.
    pub fn verify(&self) -> Result<()> {
        let actual = Digest::of(&self.bytes);
        if actual != self.digest {
            return Err(RegistryError::DigestMismatch {
                expected: self.digest.clone(),
                actual,
                size: self.bytes.len(),
            });
        }

        let mut sink = HashingWriter::new(io::sink());
        io::copy(&mut GzDecoder::new(&self.bytes[..]), &mut sink)
            .map_err(|e| RegistryError::storage("verify layer", e))?;
        let (_, diff_id, written) = sink.finish();
        if diff_id != self.diff_id {
            return Err(RegistryError::DigestMismatch {
                expected: self.diff_id.clone(),
                actual: diff_id,
                size: written as usize,
            });
        }
        Ok(())
    }
}

/// Where an entry's payload comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Package(usize),
    /// Parent directory nobody declared.
    Implied,
}

/// Builds one deterministic tar+gzip layer out of package file entries.
///
/// Output bytes depend only on the entries added, never on insertion
/// order, host clock or the ownership of files on disk.
pub struct LayerBuilder<'a> {
    records: &'a [Arc<PackageRecord>],
    entries: BTreeMap<String, (Origin, FileEntry)>,
    /// Paths lower layers already create, with their ancestors.
    lower: BTreeSet<String>,
    created_by: String,
}

impl<'a> LayerBuilder<'a> {
    pub fn new(records: &'a [Arc<PackageRecord>], created_by: impl Into<String>) -> Self {
        Self {
            records,
            entries: BTreeMap::new(),
            lower: BTreeSet::new(),
            created_by: created_by.into(),
        }
    }

    /// Layer holding exactly the files of `records[idx]`, stacked on the
    /// layers of the records before it. Parent directories those layers
    /// already create are left to them, so a directory declared lower down
    /// keeps its mode, owner and type.
    pub fn for_package(records: &'a [Arc<PackageRecord>], idx: usize, created_by: impl Into<String>) -> Result<Self> {
        let mut builder = Self::new(records, created_by);
        let files = records
            .get(idx)
            .ok_or_else(|| RegistryError::Internal(format!("no package at index {}", idx)))?
            .files()?;
        for lower in &records[..idx] {
            for entry in lower.files()? {
                let mut path = entry.path.as_str();
                while builder.lower.insert(path.to_string()) {
                    match path.rsplit_once('/') {
                        Some((parent, _)) => path = parent,
                        None => break,
                    }
                }
            }
        }
        builder.add_entries(files.iter().map(|e| (idx, e.clone())));
        Ok(builder)
    }

    /// Single layer holding the files of every record, later records
    /// replacing earlier ones at the same path.
    pub fn squashed(records: &'a [Arc<PackageRecord>], created_by: impl Into<String>) -> Result<Self> {
        let mut builder = Self::new(records, created_by);
        builder.add_entries(merge_entries(records)?);
        Ok(builder)
    }

    /// Add entries owned by `records[idx]`. A path added twice keeps the
    /// last entry.
    pub fn add_entries(&mut self, entries: impl IntoIterator<Item = (usize, FileEntry)>) {
        for (idx, entry) in entries {
            self.entries.insert(entry.path.clone(), (Origin::Package(idx), entry));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn build(mut self) -> Result<Layer> {
        self.add_implied_parents();
        self.order_hardlinks()?;

        let mut tar = tar::Builder::new(HashingWriter::new(layer_encoder(Vec::new())));
        for (path, (origin, entry)) in &self.entries {
            self.append(&mut tar, path, *origin, entry)?;
        }

        let hashing = tar
            .into_inner()
            .map_err(|e| RegistryError::storage("finish layer", e))?;
        let (encoder, diff_id, uncompressed_size) = hashing.finish();
        let compressed = encoder
            .finish()
            .map_err(|e| RegistryError::storage("compress layer", e))?;

        let digest = Digest::of(&compressed);
        debug!(
            digest = %digest.short(),
            entries = self.entries.len(),
            size = compressed.len(),
            uncompressed_size,
            "Layer built"
        );

        Ok(Layer {
            digest,
            diff_id,
            size: compressed.len() as u64,
            uncompressed_size,
            media_type: OCI_LAYER_MEDIA_TYPE,
            bytes: Bytes::from(compressed),
            created_by: self.created_by,
        })
    }

    /// Every ancestor of every entry must exist in the archive or in a
    /// lower layer; missing ones become `0755 root:root` directories.
    fn add_implied_parents(&mut self) {
        let mut missing = Vec::new();
        for path in self.entries.keys() {
            let mut current = path.as_str();
            while let Some((parent, _)) = current.rsplit_once('/') {
                if self.lower.contains(parent) {
                    break;
                }
                if !self.entries.contains_key(parent) {
                    missing.push(parent.to_string());
                }
                current = parent;
            }
        }
        for path in missing {
            self.entries.entry(path.clone()).or_insert_with(|| {
                (
                    Origin::Implied,
                    FileEntry {
                        payload: PayloadRef(path.clone()),
                        path,
                        mode: 0o755,
                        kind: FileKind::Directory,
                        owner: Ownership::root(),
                        size: 0,
                    },
                )
            });
        }
    }

    /// Tar readers need a hardlink's target earlier in the stream. For each
    /// link group, the member that sorts first carries the content and the
    /// others link to it.
    fn order_hardlinks(&mut self) -> Result<()> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (path, (_, entry)) in &self.entries {
            if let FileKind::Hardlink { target } = &entry.kind {
                groups.entry(target.clone()).or_default().push(path.clone());
            }
        }

        for (target, links) in groups {
            let (origin, content) = match self.entries.get(&target) {
                Some((origin, entry)) if entry.kind == FileKind::Regular => (*origin, entry.clone()),
                _ => {
                    let link = &links[0];
                    return Err(RegistryError::payload(
                        self.package_name(self.entries[link].0),
                        link.as_str(),
                        format!("hardlink target {} is not a regular file in this layer", target),
                    ));
                }
            };

            let first = links.iter().min().filter(|l| **l < target).cloned();
            let Some(first) = first else {
                continue;
            };
            let mut carrier = content;
            carrier.path = first.clone();
            self.entries.insert(first.clone(), (origin, carrier));
            for member in links.iter().chain(std::iter::once(&target)) {
                if *member == first {
                    continue;
                }
                if let Some((_, entry)) = self.entries.get_mut(member) {
                    entry.kind = FileKind::Hardlink {
                        target: first.clone(),
                    };
                    entry.size = 0;
                }
            }
        }
        Ok(())
    }

    fn append<W: io::Write>(
        &self,
        tar: &mut tar::Builder<W>,
        path: &str,
        origin: Origin,
        entry: &FileEntry,
    ) -> Result<()> {
        let package = self.package_name(origin);
        let failed = |e: io::Error| RegistryError::payload(package.clone(), path, e);

        match &entry.kind {
            FileKind::Regular => {
                let mut header = normalized_header(EntryType::Regular, entry.mode, &entry.owner);
                header.set_size(entry.size);
                let Origin::Package(idx) = origin else {
                    return Err(RegistryError::Internal(format!("implied entry {} has content", path)));
                };
                let reader = self.records[idx].open(entry)?;
                let exact = ExactReader {
                    inner: reader,
                    remaining: entry.size,
                };
                tar.append_data(&mut header, path, exact).map_err(failed)
            }
            FileKind::Directory => {
                let mut header = normalized_header(EntryType::Directory, entry.mode, &entry.owner);
                tar.append_data(&mut header, path, io::empty()).map_err(failed)
            }
            FileKind::Symlink { target } => {
                let mut header = normalized_header(EntryType::Symlink, entry.mode, &entry.owner);
                tar.append_link(&mut header, path, target).map_err(failed)
            }
            FileKind::Hardlink { target } => {
                let mut header = normalized_header(EntryType::Link, entry.mode, &entry.owner);
                tar.append_link(&mut header, path, target).map_err(failed)
            }
            FileKind::CharDevice { major, minor } | FileKind::BlockDevice { major, minor } => {
                let kind = if matches!(entry.kind, FileKind::CharDevice { .. }) {
                    EntryType::Char
                } else {
                    EntryType::Block
                };
                let mut header = normalized_header(kind, entry.mode, &entry.owner);
                header.set_device_major(*major).map_err(failed)?;
                header.set_device_minor(*minor).map_err(failed)?;
                tar.append_data(&mut header, path, io::empty()).map_err(failed)
            }
            FileKind::Fifo => {
                let mut header = normalized_header(EntryType::Fifo, entry.mode, &entry.owner);
                tar.append_data(&mut header, path, io::empty()).map_err(failed)
            }
        }
    }

    fn package_name(&self, origin: Origin) -> String {
        match origin {
            Origin::Package(idx) => self
                .records
                .get(idx)
                .map(|r| r.header().nevra())
                .unwrap_or_default(),
            Origin::Implied => "implied directory".to_string(),
        }
    }
}

/// Yields exactly `remaining` bytes and fails if the payload ends early,
/// so a truncated file can never produce a tar entry shorter than its
/// header claims.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("payload ended {} bytes early", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{MemoryDatabase, MemoryPackage, PackageInspector, PackageSelector};

    fn records(db: &MemoryDatabase, names: &[&str]) -> Vec<Arc<PackageRecord>> {
        let inspector = PackageInspector::new(Arc::new(db.clone()), true);
        names
            .iter()
            .map(|n| Arc::new(inspector.inspect(&PackageSelector::new(*n)).unwrap()))
            .collect()
    }

    fn tar_listing(layer: &Layer) -> Vec<(String, EntryType, u32, u64)> {
        let mut archive = tar::Archive::new(GzDecoder::new(&layer.bytes[..]));
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                let header = e.header();
                (
                    e.path().unwrap().to_string_lossy().trim_end_matches('/').to_string(),
                    header.entry_type(),
                    header.mode().unwrap(),
                    header.mtime().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_upper_layer_leaves_lower_directories_alone() {
        let db = MemoryDatabase::new();
        db.install(
            MemoryPackage::new("aaa", "1", "1", "x86_64")
                .dir("/var/lib/secret", 0o700)
                .owned_by("/var/lib/secret", "svc", 42)
                .symlink("/opt/app", "/srv/app"),
        );
        db.install(
            MemoryPackage::new("bbb", "1", "1", "x86_64")
                .file("/var/lib/secret/data", 0o600, "s3cr3t")
                .file("/opt/app/conf", 0o644, "x")
                .file("/etc/bbb.conf", 0o644, "y"),
        );
        let records = records(&db, &["aaa", "bbb"]);

        let upper = LayerBuilder::for_package(&records, 1, "bbb").unwrap().build().unwrap();
        let paths: Vec<_> = tar_listing(&upper).into_iter().map(|(p, ..)| p).collect();
        assert_eq!(paths, vec!["etc", "etc/bbb.conf", "opt/app/conf", "var/lib/secret/data"]);

        let lower = LayerBuilder::for_package(&records, 0, "aaa").unwrap().build().unwrap();
        let secret = tar_listing(&lower)
            .into_iter()
            .find(|(p, ..)| p == "var/lib/secret")
            .unwrap();
        assert_eq!(secret.1, EntryType::Directory);
        assert_eq!(secret.2, 0o700);

        // squashed, the declared directory is the one that lands
        let squashed = LayerBuilder::squashed(&records, "all").unwrap().build().unwrap();
        let secret = tar_listing(&squashed)
            .into_iter()
            .find(|(p, ..)| p == "var/lib/secret")
            .unwrap();
        assert_eq!(secret.2, 0o700);
    }

    #[test]
    fn test_layer_has_implied_parents_and_fixed_metadata() {
        let db = MemoryDatabase::new();
        db.install(
            MemoryPackage::new("foo", "1.0", "1", "x86_64")
                .file("/usr/bin/foo", 0o755, "#!/bin/sh\necho foo\n")
                .symlink("/usr/bin/foo-alias", "foo"),
        );
        let records = records(&db, &["foo"]);
        let layer = LayerBuilder::for_package(&records, 0, "foo").unwrap().build().unwrap();

        let listing = tar_listing(&layer);
        let paths: Vec<_> = listing.iter().map(|(p, ..)| p.as_str()).collect();
        assert_eq!(paths, vec!["usr", "usr/bin", "usr/bin/foo", "usr/bin/foo-alias"]);
        assert_eq!(listing[0].1, EntryType::Directory);
        assert_eq!(listing[0].2, 0o755);
        assert_eq!(listing[2].1, EntryType::Regular);
        assert_eq!(listing[3].1, EntryType::Symlink);
        assert!(listing.iter().all(|(_, _, _, mtime)| *mtime == 0));
        layer.verify().unwrap();
    }

    #[test]
    fn test_layer_bytes_are_deterministic() {
        let build = || {
            let db = MemoryDatabase::new();
            db.install(
                MemoryPackage::new("foo", "1.0", "1", "x86_64")
                    .file("/etc/foo.conf", 0o644, "a=1")
                    .file("/usr/bin/foo", 0o755, "bin"),
            );
            let records = records(&db, &["foo"]);
            LayerBuilder::for_package(&records, 0, "foo").unwrap().build().unwrap()
        };
        let first = build();
        let second = build();
        assert_eq!(first.digest, second.digest);
        assert_eq!(first.diff_id, second.diff_id);
        assert_eq!(first.bytes, second.bytes);
    }

    #[test]
    fn test_hardlink_target_precedes_link() {
        let db = MemoryDatabase::new();
        db.install(
            MemoryPackage::new("foo", "1.0", "1", "x86_64")
                .file("/usr/bin/z-real", 0o755, "payload")
                .hardlink("/usr/bin/a-link", "/usr/bin/z-real"),
        );
        let records = records(&db, &["foo"]);
        let layer = LayerBuilder::for_package(&records, 0, "foo").unwrap().build().unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(&layer.bytes[..]));
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let link = entry.link_name().unwrap().map(|l| l.to_string_lossy().to_string());
            seen.push((path, entry.header().entry_type(), link));
        }
        assert_eq!(seen[2], ("usr/bin/a-link".to_string(), EntryType::Regular, None));
        assert_eq!(
            seen[3],
            (
                "usr/bin/z-real".to_string(),
                EntryType::Link,
                Some("usr/bin/a-link".to_string())
            )
        );
    }

    #[test]
    fn test_unreadable_payload_fails_the_layer() {
        let db = MemoryDatabase::new();
        db.install(MemoryPackage::new("foo", "1.0", "1", "x86_64").broken_file("/usr/lib/libfoo.so", 0o755, 42));
        let records = records(&db, &["foo"]);
        let err = LayerBuilder::for_package(&records, 0, "foo")
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::PayloadUnreadable { .. }));
    }

    #[test]
    fn test_squashed_layer_last_writer_wins() {
        let db = MemoryDatabase::new();
        db.install(MemoryPackage::new("a", "1", "1", "noarch").file("/etc/motd", 0o644, "from a"));
        db.install(MemoryPackage::new("b", "1", "1", "noarch").file("/etc/motd", 0o600, "from b"));
        let records = records(&db, &["a", "b"]);
        let layer = LayerBuilder::squashed(&records, "a b").unwrap().build().unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(&layer.bytes[..]));
        let mut motd = String::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().ends_with("motd") {
                assert_eq!(entry.header().mode().unwrap(), 0o600);
                entry.read_to_string(&mut motd).unwrap();
            }
        }
        assert_eq!(motd, "from b");
    }

    #[test]
    fn test_verify_detects_tampering() {
        let db = MemoryDatabase::new();
        db.install(MemoryPackage::new("foo", "1.0", "1", "x86_64").file("/foo", 0o644, "x"));
        let records = records(&db, &["foo"]);
        let mut layer = LayerBuilder::for_package(&records, 0, "foo").unwrap().build().unwrap();
        let mut tampered = layer.bytes.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;
        layer.bytes = Bytes::from(tampered);
        assert!(matches!(layer.verify(), Err(RegistryError::DigestMismatch { .. })));
    }
}
