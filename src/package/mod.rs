//! Read-only view of the host package database.
//!
//! The database itself is an external collaborator reached through the
//! [`PackageDatabase`] capability. [`PackageInspector`] layers image naming
//! and tag resolution on top of it.

pub mod inspector;
pub mod memory;
pub mod rpm;
pub mod version;

use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

pub use inspector::{PackageInspector, PackageRecord, Selection};
pub use memory::{MemoryDatabase, MemoryPackage};
pub use rpm::RpmDatabase;
pub use version::Evr;

/// Identity of one installed package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageHeader {
    pub name: String,
    pub epoch: Option<u32>,
    pub version: String,
    pub release: String,
    pub arch: String,
    /// Database-unique identifier; changes on every (re)install.
    pub pkgid: String,
}

impl PackageHeader {
    pub fn evr(&self) -> Evr {
        Evr::new(self.epoch.unwrap_or(0), &self.version, &self.release)
    }

    /// `name-[epoch:]version-release.arch`
    pub fn nevra(&self) -> String {
        match self.epoch {
            Some(epoch) if epoch > 0 => format!(
                "{}-{}:{}-{}.{}",
                self.name, epoch, self.version, self.release, self.arch
            ),
            _ => format!("{}-{}-{}.{}", self.name, self.version, self.release, self.arch),
        }
    }
}

impl fmt::Display for PackageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.nevra())
    }
}

/// A capability a package provides, e.g. `oci_image(foo) = 1.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub name: String,
    pub version: Option<String>,
}

impl Capability {
    /// Parse one line of `rpm -q --provides` output.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match line.split_once('=') {
            Some((name, version)) => Some(Self {
                name: name.trim_end_matches(['<', '>', ' ']).trim().to_string(),
                version: Some(version.trim().to_string()),
            }),
            None => Some(Self {
                name: line.to_string(),
                version: None,
            }),
        }
    }
}

/// Type of a file entry, with whatever the archive needs to recreate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink { target: String },
    /// Link to another entry of the same layer, by normalized path.
    Hardlink { target: String },
    CharDevice { major: u32, minor: u32 },
    BlockDevice { major: u32, minor: u32 },
    Fifo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub user: String,
    pub group: String,
    pub uid: u64,
    pub gid: u64,
}

impl Ownership {
    pub fn root() -> Self {
        Self {
            user: "root".to_string(),
            group: "root".to_string(),
            uid: 0,
            gid: 0,
        }
    }
}

/// Opaque handle the database uses to find an entry's payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef(pub String);

/// One file owned by a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Normalized relative path (see [`normalize_path`]).
    pub path: String,
    /// Permission bits only (`0o7777`); the type lives in `kind`.
    pub mode: u32,
    pub kind: FileKind,
    pub owner: Ownership,
    pub size: u64,
    pub payload: PayloadRef,
}

/// Read-only capability over the host package database.
///
/// Implementations must tolerate concurrent calls for different packages.
/// Calls may block; async callers go through `spawn_blocking`.
pub trait PackageDatabase: Send + Sync {
    /// Every installed package.
    fn installed(&self) -> Result<Vec<PackageHeader>>;

    /// Installed packages called `name`, any version.
    fn lookup(&self, name: &str) -> Result<Vec<PackageHeader>>;

    /// Installed packages providing a capability name.
    fn what_provides(&self, capability: &str) -> Result<Vec<PackageHeader>>;

    fn provides(&self, package: &PackageHeader) -> Result<Vec<Capability>>;

    /// Every installed package with what it provides. The default asks
    /// package by package; databases with a bulk query override it.
    fn installed_provides(&self) -> Result<Vec<(PackageHeader, Vec<Capability>)>> {
        self.installed()?
            .into_iter()
            .map(|header| {
                let provides = self.provides(&header)?;
                Ok((header, provides))
            })
            .collect()
    }

    /// File entries of a package. Paths come back as the database stores
    /// them; the inspector normalizes them.
    fn files(&self, package: &PackageHeader) -> Result<Vec<FileEntry>>;

    fn open_payload(&self, package: &PackageHeader, entry: &FileEntry) -> Result<Box<dyn Read + Send>>;
}

/// Package name with an optional `version` or `version-release` constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSelector {
    pub name: String,
    pub version: Option<String>,
}

impl PackageSelector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn matches(&self, header: &PackageHeader) -> bool {
        if header.name != self.name {
            return false;
        }
        match &self.version {
            None => true,
            Some(v) => *v == header.version || *v == format!("{}-{}", header.version, header.release),
        }
    }
}

/// Normalize a package file path into a layer-relative path.
///
/// Leading `/`, empty and `.` components are dropped; `..` pops a component
/// and is rejected when it would climb above the root. Returns `None` for
/// the root itself.
pub fn normalize_path(package: &str, raw: &str) -> Result<Option<String>> {
    let mut parts: Vec<&str> = Vec::new();
    for component in raw.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(RegistryError::InvalidPath {
                        package: package.to_string(),
                        path: raw.to_string(),
                    });
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Some(parts.join("/")))
}
