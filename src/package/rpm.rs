//! [`PackageDatabase`] backed by the host's `rpm` command.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};

use super::{Capability, FileEntry, FileKind, Ownership, PackageDatabase, PackageHeader, PayloadRef};
use crate::error::{RegistryError, Result};

const HEADER_FORMAT: &str = "%{NAME}\t%{EPOCHNUM}\t%{VERSION}\t%{RELEASE}\t%{ARCH}\t%{PKGID}\t%{INSTALLTIME}\n";

/// One row per provided capability, header fields repeated on each.
const PROVIDES_FORMAT: &str = "[%{=NAME}\t%{=EPOCHNUM}\t%{=VERSION}\t%{=RELEASE}\t%{=ARCH}\t%{=PKGID}\t%{=INSTALLTIME}\t%{PROVIDENAME}\t%{PROVIDEVERSION}\n]";

const FILES_FORMAT: &str = "[%{FILENAMES}\t%{FILEMODES}\t%{FILEUSERNAME}\t%{FILEGROUPNAME}\t%{FILESIZES}\t%{FILELINKTOS}\t%{FILEINODES}\t%{FILERDEVS}\t%{FILEFLAGS}\n]";

/// `%ghost` files are owned but never shipped in the payload.
const RPMFILE_GHOST: u32 = 1 << 6;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;
const S_IFCHR: u32 = 0o020000;
const S_IFBLK: u32 = 0o060000;
const S_IFIFO: u32 = 0o010000;

pub struct RpmDatabase {
    rpm: PathBuf,
    host_root: PathBuf,
    users: HashMap<String, u64>,
    groups: HashMap<String, u64>,
}

impl RpmDatabase {
    /// `host_root` is where installed files are read from and where
    /// `etc/passwd` / `etc/group` are looked up.
    pub fn new(rpm: impl Into<PathBuf>, host_root: impl Into<PathBuf>) -> Self {
        let host_root = host_root.into();
        let users = read_id_map(&host_root.join("etc/passwd"));
        let groups = read_id_map(&host_root.join("etc/group"));
        Self {
            rpm: rpm.into(),
            host_root,
            users,
            groups,
        }
    }

    /// Run an rpm query. `Ok(None)` when rpm reports no match.
    fn query(&self, args: &[&str]) -> Result<Option<String>> {
        let mut command = Command::new(&self.rpm);
        if self.host_root != Path::new("/") {
            command.arg("--root").arg(&self.host_root);
        }
        command.arg("-q").args(args);
        debug!(?command, "Running rpm query");

        let output = command
            .output()
            .map_err(|e| RegistryError::payload("rpmdb", self.rpm.display().to_string(), e))?;
        if !output.status.success() {
            return Ok(None);
        }
        String::from_utf8(output.stdout)
            .map(Some)
            .map_err(|e| RegistryError::payload("rpmdb", "query output", e))
    }

    fn headers(&self, args: &[&str]) -> Result<Vec<PackageHeader>> {
        let mut full = vec!["--queryformat", HEADER_FORMAT];
        full.extend_from_slice(args);
        match self.query(&full)? {
            Some(out) => parse_headers(&out),
            None => Ok(Vec::new()),
        }
    }

    fn uid(&self, user: &str) -> u64 {
        self.users.get(user).copied().unwrap_or(0)
    }

    fn gid(&self, group: &str) -> u64 {
        self.groups.get(group).copied().unwrap_or(0)
    }
}

impl PackageDatabase for RpmDatabase {
    fn installed(&self) -> Result<Vec<PackageHeader>> {
        self.headers(&["-a"])
    }

    fn lookup(&self, name: &str) -> Result<Vec<PackageHeader>> {
        Ok(self
            .headers(&["--", name])?
            .into_iter()
            .filter(|h| h.name == name)
            .collect())
    }

    fn what_provides(&self, capability: &str) -> Result<Vec<PackageHeader>> {
        self.headers(&["--whatprovides", "--", capability])
    }

    fn provides(&self, package: &PackageHeader) -> Result<Vec<Capability>> {
        let nevra = package.nevra();
        let out = self
            .query(&["--provides", "--", &nevra])?
            .ok_or_else(|| RegistryError::payload(&nevra, "rpmdb", "package vanished"))?;
        Ok(out.lines().filter_map(Capability::parse).collect())
    }

    fn installed_provides(&self) -> Result<Vec<(PackageHeader, Vec<Capability>)>> {
        match self.query(&["-a", "--queryformat", PROVIDES_FORMAT])? {
            Some(out) => parse_provides(&out),
            None => Ok(Vec::new()),
        }
    }

    fn files(&self, package: &PackageHeader) -> Result<Vec<FileEntry>> {
        let nevra = package.nevra();
        let out = self
            .query(&["--queryformat", FILES_FORMAT, "--", &nevra])?
            .ok_or_else(|| RegistryError::payload(&nevra, "rpmdb", "package vanished"))?;
        let rows = parse_file_rows(&nevra, &out)?;
        Ok(entries_from_rows(rows, |u| self.uid(u), |g| self.gid(g)))
    }

    fn open_payload(&self, package: &PackageHeader, entry: &FileEntry) -> Result<Box<dyn Read + Send>> {
        let relative = entry.payload.0.trim_start_matches('/');
        let path = self.host_root.join(relative);
        let file = File::open(&path).map_err(|e| RegistryError::payload(package.nevra(), &entry.payload.0, e))?;
        let actual = file
            .metadata()
            .map_err(|e| RegistryError::payload(package.nevra(), &entry.payload.0, e))?
            .len();
        if actual != entry.size {
            // modified since install; the header size no longer describes it
            return Err(RegistryError::payload(
                package.nevra(),
                &entry.payload.0,
                format!("size is {} bytes, package records {}", actual, entry.size),
            ));
        }
        Ok(Box::new(file))
    }
}

fn parse_headers(out: &str) -> Result<Vec<PackageHeader>> {
    out.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            header_from_fields(line, &fields)
        })
        .collect()
}

fn header_from_fields(line: &str, fields: &[&str]) -> Result<PackageHeader> {
    let [name, epoch, version, release, arch, pkgid, installtime] = fields[..] else {
        return Err(RegistryError::payload("rpmdb", "header", format!("malformed row {:?}", line)));
    };
    Ok(PackageHeader {
        name: name.to_string(),
        epoch: epoch.parse::<u32>().ok().filter(|e| *e > 0),
        version: version.to_string(),
        release: release.to_string(),
        arch: arch.to_string(),
        pkgid: format!("{}:{}", pkgid, installtime),
    })
}

/// Rows of [`PROVIDES_FORMAT`], grouped back into packages in the order
/// rpm listed them.
fn parse_provides(out: &str) -> Result<Vec<(PackageHeader, Vec<Capability>)>> {
    let mut packages: Vec<(PackageHeader, Vec<Capability>)> = Vec::new();
    let mut by_pkgid: HashMap<String, usize> = HashMap::new();
    for line in out.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 9 {
            return Err(RegistryError::payload("rpmdb", "provides", format!("malformed row {:?}", line)));
        }
        let header = header_from_fields(line, &fields[..7])?;
        let capability = Capability {
            name: fields[7].to_string(),
            version: Some(fields[8]).filter(|v| !v.is_empty()).map(str::to_string),
        };
        let idx = *by_pkgid.entry(header.pkgid.clone()).or_insert_with(|| {
            packages.push((header, Vec::new()));
            packages.len() - 1
        });
        packages[idx].1.push(capability);
    }
    Ok(packages)
}

#[derive(Debug, Clone, PartialEq)]
struct FileRow {
    path: String,
    mode: u32,
    user: String,
    group: String,
    size: u64,
    link_to: String,
    inode: u64,
    rdev: u64,
}

fn parse_file_rows(nevra: &str, out: &str) -> Result<Vec<FileRow>> {
    let mut rows = Vec::new();
    for line in out.lines().filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        let [path, mode, user, group, size, link_to, inode, rdev, flags] = fields[..] else {
            return Err(RegistryError::payload(nevra, "file list", format!("malformed row {:?}", line)));
        };
        let number = |field: &str| -> Result<u64> {
            field
                .parse::<u64>()
                .map_err(|e| RegistryError::payload(nevra, path, e))
        };
        if number(flags)? as u32 & RPMFILE_GHOST != 0 {
            continue;
        }
        rows.push(FileRow {
            path: path.to_string(),
            mode: number(mode)? as u32,
            user: user.to_string(),
            group: group.to_string(),
            size: number(size)?,
            link_to: link_to.to_string(),
            inode: number(inode)?,
            rdev: number(rdev)?,
        });
    }
    Ok(rows)
}

/// Turn query rows into entries. Non-empty regular files sharing an inode
/// become one regular file plus hardlinks to the smallest path.
fn entries_from_rows(
    rows: Vec<FileRow>,
    uid: impl Fn(&str) -> u64,
    gid: impl Fn(&str) -> u64,
) -> Vec<FileEntry> {
    let mut link_groups: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    for row in &rows {
        if row.mode & S_IFMT == S_IFREG && row.size > 0 && row.inode != 0 {
            link_groups.entry(row.inode).or_default().push(row.path.clone());
        }
    }
    let mut link_targets: HashMap<String, String> = HashMap::new();
    for mut paths in link_groups.into_values().filter(|p| p.len() > 1) {
        paths.sort();
        let first = paths[0].clone();
        for other in paths.into_iter().skip(1) {
            link_targets.insert(other, first.clone());
        }
    }

    rows.into_iter()
        .filter_map(|row| {
            let (major, minor) = split_rdev(row.rdev);
            let kind = match row.mode & S_IFMT {
                S_IFDIR => FileKind::Directory,
                S_IFLNK => FileKind::Symlink {
                    target: row.link_to.clone(),
                },
                S_IFCHR => FileKind::CharDevice { major, minor },
                S_IFBLK => FileKind::BlockDevice { major, minor },
                S_IFIFO => FileKind::Fifo,
                S_IFREG => match link_targets.get(&row.path) {
                    Some(target) => FileKind::Hardlink {
                        target: target.clone(),
                    },
                    None => FileKind::Regular,
                },
                other => {
                    warn!(path = %row.path, mode = other, "Skipping file of unsupported type");
                    return None;
                }
            };
            let size = if kind == FileKind::Regular { row.size } else { 0 };
            Some(FileEntry {
                owner: Ownership {
                    uid: uid(&row.user),
                    gid: gid(&row.group),
                    user: row.user,
                    group: row.group,
                },
                payload: PayloadRef(row.path.clone()),
                path: row.path,
                mode: row.mode & 0o7777,
                kind,
                size,
            })
        })
        .collect()
}

/// Linux `dev_t` encoding as rpm stores it.
fn split_rdev(rdev: u64) -> (u32, u32) {
    let major = ((rdev >> 8) & 0xfff) as u32;
    let minor = ((rdev & 0xff) | ((rdev >> 12) & 0xfff00)) as u32;
    (major, minor)
}

/// `name:x:id:...` lines of passwd/group files. Missing files yield an
/// empty map.
fn read_id_map(path: &Path) -> HashMap<String, u64> {
    let Ok(content) = fs::read_to_string(path) else {
        return HashMap::new();
    };
    parse_id_map(&content)
}

fn parse_id_map(content: &str) -> HashMap<String, u64> {
    content
        .lines()
        .filter(|l| !l.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?;
            let id = fields.nth(1)?.parse().ok()?;
            Some((name.to_string(), id))
        })
        .collect()
}
