use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{
    Capability, FileEntry, FileKind, Ownership, PackageDatabase, PackageHeader, PayloadRef,
};
use crate::digest::Digest;
use crate::error::{RegistryError, Result};

/// In-process package database.
///
/// Installing a package with the same name and arch as an existing one
/// replaces it, the way an upgrade does on a real host.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    packages: Arc<RwLock<BTreeMap<(String, String), MemoryPackage>>>,
}

/// A package to install into a [`MemoryDatabase`].
#[derive(Debug, Clone)]
pub struct MemoryPackage {
    header: PackageHeader,
    provides: Vec<Capability>,
    files: Vec<(FileEntry, Option<Vec<u8>>)>,
}

impl MemoryPackage {
    pub fn new(name: &str, version: &str, release: &str, arch: &str) -> Self {
        let nevra = format!("{}-{}-{}.{}", name, version, release, arch);
        Self {
            header: PackageHeader {
                name: name.to_string(),
                epoch: None,
                version: version.to_string(),
                release: release.to_string(),
                arch: arch.to_string(),
                pkgid: Digest::of(nevra.as_bytes()).hex().to_string(),
            },
            provides: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn header(&self) -> &PackageHeader {
        &self.header
    }

    pub fn provides(mut self, name: &str, version: Option<&str>) -> Self {
        self.provides.push(Capability {
            name: name.to_string(),
            version: version.map(str::to_string),
        });
        self
    }

    /// Declare membership in image `image` under `tag`.
    pub fn image(self, image: &str, tag: &str) -> Self {
        let capability = format!("{}({})", crate::constants::OCI_IMAGE_CAPABILITY, image);
        self.provides(&capability, Some(tag))
    }

    pub fn file(self, path: &str, mode: u32, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        let size = content.len() as u64;
        self.entry(path, mode, FileKind::Regular, size, Some(content))
    }

    pub fn dir(self, path: &str, mode: u32) -> Self {
        self.entry(path, mode, FileKind::Directory, 0, None)
    }

    pub fn symlink(self, path: &str, target: &str) -> Self {
        let kind = FileKind::Symlink {
            target: target.to_string(),
        };
        self.entry(path, 0o777, kind, 0, None)
    }

    pub fn hardlink(self, path: &str, target: &str) -> Self {
        let kind = FileKind::Hardlink {
            target: target.to_string(),
        };
        self.entry(path, 0o644, kind, 0, None)
    }

    pub fn char_device(self, path: &str, mode: u32, major: u32, minor: u32) -> Self {
        self.entry(path, mode, FileKind::CharDevice { major, minor }, 0, None)
    }

    /// A regular file whose payload cannot be read.
    pub fn broken_file(self, path: &str, mode: u32, size: u64) -> Self {
        self.entry(path, mode, FileKind::Regular, size, None)
    }

    pub fn owned_by(mut self, path: &str, user: &str, uid: u64) -> Self {
        for (entry, _) in &mut self.files {
            if entry.payload.0 == path {
                entry.owner = Ownership {
                    user: user.to_string(),
                    group: user.to_string(),
                    uid,
                    gid: uid,
                };
            }
        }
        self
    }

    fn entry(mut self, path: &str, mode: u32, kind: FileKind, size: u64, content: Option<Vec<u8>>) -> Self {
        let entry = FileEntry {
            path: path.to_string(),
            mode,
            kind,
            owner: Ownership::root(),
            size,
            payload: PayloadRef(path.to_string()),
        };
        self.files.push((entry, content));
        self
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, package: MemoryPackage) {
        let key = (package.header.name.clone(), package.header.arch.clone());
        self.packages.write().insert(key, package);
    }

    /// Remove every arch of `name`. Returns whether anything was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut packages = self.packages.write();
        let before = packages.len();
        packages.retain(|(n, _), _| n != name);
        packages.len() != before
    }

    fn find(&self, header: &PackageHeader) -> Result<MemoryPackage> {
        self.packages
            .read()
            .get(&(header.name.clone(), header.arch.clone()))
            .filter(|p| p.header.pkgid == header.pkgid)
            .cloned()
            .ok_or_else(|| RegistryError::payload(header.nevra(), "rpmdb", "package no longer installed"))
    }
}

impl PackageDatabase for MemoryDatabase {
    fn installed(&self) -> Result<Vec<PackageHeader>> {
        Ok(self.packages.read().values().map(|p| p.header.clone()).collect())
    }

    fn lookup(&self, name: &str) -> Result<Vec<PackageHeader>> {
        Ok(self
            .packages
            .read()
            .values()
            .filter(|p| p.header.name == name)
            .map(|p| p.header.clone())
            .collect())
    }

    fn what_provides(&self, capability: &str) -> Result<Vec<PackageHeader>> {
        Ok(self
            .packages
            .read()
            .values()
            .filter(|p| p.provides.iter().any(|c| c.name == capability))
            .map(|p| p.header.clone())
            .collect())
    }

    fn provides(&self, package: &PackageHeader) -> Result<Vec<Capability>> {
        Ok(self.find(package)?.provides)
    }

    fn files(&self, package: &PackageHeader) -> Result<Vec<FileEntry>> {
        Ok(self.find(package)?.files.into_iter().map(|(e, _)| e).collect())
    }

    fn open_payload(&self, package: &PackageHeader, entry: &FileEntry) -> Result<Box<dyn Read + Send>> {
        let found = self.find(package)?;
        let content = found
            .files
            .into_iter()
            .find(|(e, _)| e.payload == entry.payload)
            .and_then(|(_, content)| content)
            .ok_or_else(|| RegistryError::payload(package.nevra(), &entry.payload.0, "payload missing"))?;
        Ok(Box::new(Cursor::new(content)))
    }
}
