use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::{Arc, OnceLock};

use tracing::{debug, instrument};

use super::{normalize_path, FileEntry, FileKind, PackageDatabase, PackageHeader, PackageSelector};
use crate::constants::{LATEST_TAG, OCI_IMAGE_CAPABILITY};
use crate::error::{RegistryError, Result};

/// One installed package plus lazy access to its files.
///
/// File metadata is fetched on the first call to [`PackageRecord::files`]
/// and can be iterated any number of times afterwards. Payload bytes are
/// only read through [`PackageRecord::open`].
pub struct PackageRecord {
    header: PackageHeader,
    db: Arc<dyn PackageDatabase>,
    files: OnceLock<Vec<FileEntry>>,
}

impl std::fmt::Debug for PackageRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageRecord")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl PackageRecord {
    pub fn new(header: PackageHeader, db: Arc<dyn PackageDatabase>) -> Self {
        Self {
            header,
            db,
            files: OnceLock::new(),
        }
    }

    pub fn header(&self) -> &PackageHeader {
        &self.header
    }

    /// Normalized file entries, one per path, in database order.
    pub fn files(&self) -> Result<&[FileEntry]> {
        if let Some(files) = self.files.get() {
            return Ok(files);
        }
        let loaded = self.load_files()?;
        // a concurrent loader may have won; both results are equivalent
        let _ = self.files.set(loaded);
        Ok(self.files.get().map(Vec::as_slice).unwrap_or_default())
    }

    pub fn open(&self, entry: &FileEntry) -> Result<Box<dyn Read + Send>> {
        self.db.open_payload(&self.header, entry)
    }

    fn load_files(&self) -> Result<Vec<FileEntry>> {
        let nevra = self.header.nevra();
        let mut seen = BTreeMap::new();
        let mut files = Vec::new();
        for mut entry in self.db.files(&self.header)? {
            let Some(path) = normalize_path(&nevra, &entry.path)? else {
                continue;
            };
            entry.path = path;
            if let FileKind::Hardlink { target } = &entry.kind {
                let target = normalize_path(&nevra, target)?.ok_or_else(|| RegistryError::InvalidPath {
                    package: nevra.clone(),
                    path: target.clone(),
                })?;
                entry.kind = FileKind::Hardlink { target };
            }
            entry.mode &= 0o7777;
            match seen.get(&entry.path) {
                Some(&idx) => files[idx] = entry,
                None => {
                    seen.insert(entry.path.clone(), files.len());
                    files.push(entry);
                }
            }
        }
        debug!(package = %nevra, files = files.len(), "Loaded file list");
        Ok(files)
    }
}

/// The packages an image was resolved to, in composition order.
///
/// Two selections are equal only when every package has the same NEVRA and
/// database id, so an upgrade or reinstall makes a cached build stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selection(Vec<String>);

impl Selection {
    pub fn of(records: &[Arc<PackageRecord>]) -> Self {
        Self(
            records
                .iter()
                .map(|r| format!("{}@{}", r.header.nevra(), r.header.pkgid))
                .collect(),
        )
    }

    pub fn packages(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.split('@').next().unwrap_or(s))
    }
}

/// Merge the files of several packages into one path-sorted list.
///
/// Records are applied in order and a later record's entry replaces an
/// earlier one at the same path. Each entry carries the index of the record
/// that owns its payload.
pub fn merge_entries(records: &[Arc<PackageRecord>]) -> Result<Vec<(usize, FileEntry)>> {
    let mut merged: BTreeMap<String, (usize, FileEntry)> = BTreeMap::new();
    for (idx, record) in records.iter().enumerate() {
        for entry in record.files()? {
            merged.insert(entry.path.clone(), (idx, entry.clone()));
        }
    }
    Ok(merged.into_values().collect())
}

/// Resolves image names and tags to installed packages.
#[derive(Clone)]
pub struct PackageInspector {
    db: Arc<dyn PackageDatabase>,
    expose_package_names: bool,
}

impl PackageInspector {
    pub fn new(db: Arc<dyn PackageDatabase>, expose_package_names: bool) -> Self {
        Self {
            db,
            expose_package_names,
        }
    }

    /// Find the newest installed package matching `selector`.
    #[instrument(skip(self), fields(package = %selector.name))]
    pub fn inspect(&self, selector: &PackageSelector) -> Result<PackageRecord> {
        let newest = self
            .db
            .lookup(&selector.name)?
            .into_iter()
            .filter(|h| selector.matches(h))
            .max_by(|a, b| a.evr().cmp(&b.evr()).then_with(|| a.arch.cmp(&b.arch)))
            .ok_or_else(|| RegistryError::PackageNotFound {
                name: selector.name.clone(),
            })?;
        Ok(PackageRecord::new(newest, self.db.clone()))
    }

    /// Packages making up `image:tag`, ordered by (name, EVR, arch).
    ///
    /// Packages declaring `oci_image(<image>) = <tag>` take precedence. Only
    /// when no package declares the image at all does a package named
    /// `image` stand in for it, if that is enabled.
    #[instrument(skip(self))]
    pub fn resolve_image(&self, image: &str, tag: &str) -> Result<Vec<Arc<PackageRecord>>> {
        let capability = image_capability(image);
        let declaring = self.db.what_provides(&capability)?;

        let mut headers = if !declaring.is_empty() {
            let mut matched = Vec::new();
            for header in declaring {
                let tags = self.declared_tags(&header, &capability)?;
                if tags.iter().any(|t| t == tag) {
                    matched.push(header);
                }
            }
            matched
        } else if self.expose_package_names {
            let installed = self.db.lookup(image)?;
            if installed.is_empty() {
                return Err(RegistryError::PackageNotFound {
                    name: image.to_string(),
                });
            }
            select_by_tag(installed, tag)
        } else {
            return Err(RegistryError::PackageNotFound {
                name: image.to_string(),
            });
        };

        if headers.is_empty() {
            return Err(RegistryError::TagUnknown {
                name: image.to_string(),
                tag: tag.to_string(),
            });
        }

        headers.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.evr().cmp(&b.evr()))
                .then_with(|| a.arch.cmp(&b.arch))
        });
        headers.dedup_by(|a, b| a.pkgid == b.pkgid);

        Ok(headers
            .into_iter()
            .map(|h| Arc::new(PackageRecord::new(h, self.db.clone())))
            .collect())
    }

    /// Every tag `image` can be pulled by, sorted.
    pub fn list_tags(&self, image: &str) -> Result<Vec<String>> {
        let capability = image_capability(image);
        let declaring = self.db.what_provides(&capability)?;
        let mut tags = BTreeSet::new();

        if !declaring.is_empty() {
            for header in declaring {
                tags.extend(self.declared_tags(&header, &capability)?);
            }
        } else if self.expose_package_names {
            let installed = self.db.lookup(image)?;
            if installed.is_empty() {
                return Err(RegistryError::PackageNotFound {
                    name: image.to_string(),
                });
            }
            tags.insert(LATEST_TAG.to_string());
            for header in installed {
                tags.insert(header.version.clone());
                tags.insert(format!("{}-{}", header.version, header.release));
            }
        } else {
            return Err(RegistryError::PackageNotFound {
                name: image.to_string(),
            });
        }

        Ok(tags.into_iter().collect())
    }

    /// Names of every image the host can serve, sorted.
    pub fn list_images(&self) -> Result<Vec<String>> {
        let prefix = format!("{}(", OCI_IMAGE_CAPABILITY);
        let mut images = BTreeSet::new();
        for (header, provides) in self.db.installed_provides()? {
            for capability in provides {
                if let Some(name) = capability
                    .name
                    .strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(')'))
                {
                    images.insert(name.to_string());
                }
            }
            if self.expose_package_names {
                images.insert(header.name.clone());
            }
        }
        Ok(images.into_iter().collect())
    }

    fn declared_tags(&self, header: &PackageHeader, capability: &str) -> Result<Vec<String>> {
        Ok(self
            .db
            .provides(header)?
            .into_iter()
            .filter(|c| c.name == capability)
            .filter_map(|c| c.version)
            .collect())
    }
}

fn image_capability(image: &str) -> String {
    format!("{}({})", OCI_IMAGE_CAPABILITY, image)
}

/// Pick the installed builds of one package name a tag refers to: `latest`
/// is the newest EVR (all arches of it), anything else must equal the
/// version or version-release.
fn select_by_tag(installed: Vec<PackageHeader>, tag: &str) -> Vec<PackageHeader> {
    if tag == LATEST_TAG {
        let Some(newest) = installed.iter().map(PackageHeader::evr).max() else {
            return Vec::new();
        };
        return installed.into_iter().filter(|h| h.evr() == newest).collect();
    }
    installed
        .into_iter()
        .filter(|h| h.version == tag || format!("{}-{}", h.version, h.release) == tag)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{MemoryDatabase, MemoryPackage};

    fn inspector(db: &MemoryDatabase) -> PackageInspector {
        PackageInspector::new(Arc::new(db.clone()), true)
    }

    #[test]
    fn test_inspect_missing_package() {
        let db = MemoryDatabase::new();
        let err = inspector(&db).inspect(&PackageSelector::new("nope")).unwrap_err();
        assert!(matches!(err, RegistryError::PackageNotFound { .. }));
    }

    #[test]
    fn test_files_are_normalized_and_restartable() {
        let db = MemoryDatabase::new();
        db.install(
            MemoryPackage::new("foo", "1.0", "1", "x86_64")
                .dir("/", 0o40755)
                .file("/usr/bin/foo", 0o100755, "x")
                .file("/usr/bin/foo", 0o100700, "y"),
        );
        let record = inspector(&db).inspect(&PackageSelector::new("foo")).unwrap();
        let first: Vec<_> = record.files().unwrap().iter().map(|e| e.path.clone()).collect();
        let second: Vec<_> = record.files().unwrap().iter().map(|e| e.path.clone()).collect();
        assert_eq!(first, vec!["usr/bin/foo".to_string()]);
        assert_eq!(first, second);
        assert_eq!(record.files().unwrap()[0].mode, 0o700);
    }

    #[test]
    fn test_resolve_by_package_name_and_tags() {
        let db = MemoryDatabase::new();
        db.install(MemoryPackage::new("foo", "1.0", "2", "x86_64"));
        let inspector = inspector(&db);

        assert_eq!(inspector.resolve_image("foo", "latest").unwrap().len(), 1);
        assert_eq!(inspector.resolve_image("foo", "1.0").unwrap().len(), 1);
        assert_eq!(inspector.resolve_image("foo", "1.0-2").unwrap().len(), 1);
        assert!(matches!(
            inspector.resolve_image("foo", "2.0"),
            Err(RegistryError::TagUnknown { .. })
        ));
        assert!(matches!(
            inspector.resolve_image("bar", "latest"),
            Err(RegistryError::PackageNotFound { .. })
        ));
        assert_eq!(
            inspector.list_tags("foo").unwrap(),
            vec!["1.0".to_string(), "1.0-2".to_string(), "latest".to_string()]
        );
    }

    #[test]
    fn test_declared_images_take_precedence_and_are_ordered() {
        let db = MemoryDatabase::new();
        db.install(MemoryPackage::new("web-app", "2.1", "1", "noarch").image("web", "2.1"));
        db.install(MemoryPackage::new("web-base", "1.0", "1", "x86_64").image("web", "2.1"));
        db.install(MemoryPackage::new("web", "9.9", "1", "x86_64"));
        let inspector = inspector(&db);

        let records = inspector.resolve_image("web", "2.1").unwrap();
        let names: Vec<_> = records.iter().map(|r| r.header().name.as_str()).collect();
        assert_eq!(names, vec!["web-app", "web-base"]);

        // the plain package name no longer counts once the image is declared
        assert!(matches!(
            inspector.resolve_image("web", "latest"),
            Err(RegistryError::TagUnknown { .. })
        ));
        assert_eq!(inspector.list_tags("web").unwrap(), vec!["2.1".to_string()]);
        assert_eq!(
            inspector.list_images().unwrap(),
            vec!["web".to_string(), "web-app".to_string(), "web-base".to_string()]
        );
    }

    #[test]
    fn test_hidden_package_names() {
        let db = MemoryDatabase::new();
        db.install(MemoryPackage::new("foo", "1.0", "1", "x86_64"));
        let inspector = PackageInspector::new(Arc::new(db), false);
        assert!(matches!(
            inspector.resolve_image("foo", "latest"),
            Err(RegistryError::PackageNotFound { .. })
        ));
        assert!(inspector.list_images().unwrap().is_empty());
    }

    #[test]
    fn test_merge_entries_last_writer_wins() {
        let db = MemoryDatabase::new();
        db.install(
            MemoryPackage::new("a", "1", "1", "noarch")
                .file("/etc/motd", 0o644, "from a")
                .file("/etc/a", 0o644, "a"),
        );
        db.install(MemoryPackage::new("b", "1", "1", "noarch").file("/etc/motd", 0o600, "from b"));
        let inspector = inspector(&db);
        let records = vec![
            Arc::new(inspector.inspect(&PackageSelector::new("a")).unwrap()),
            Arc::new(inspector.inspect(&PackageSelector::new("b")).unwrap()),
        ];

        let merged = merge_entries(&records).unwrap();
        let paths: Vec<_> = merged.iter().map(|(_, e)| e.path.as_str()).collect();
        assert_eq!(paths, vec!["etc/a", "etc/motd"]);
        assert_eq!(merged[1].0, 1);
        assert_eq!(merged[1].1.mode, 0o600);
    }
}
