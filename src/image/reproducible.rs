//! Byte-level reproducibility settings for everything that gets a digest.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};
use serde::Serialize;
use tar::{EntryType, Header};

use crate::constants::LAYER_COMPRESSION_LEVEL;
use crate::package::Ownership;

/// gzip encoder with a pinned level, a zero mtime, no file name and an
/// "unknown" OS byte, so the same tar stream always compresses to the same
/// bytes.
pub fn layer_encoder<W: Write>(inner: W) -> GzEncoder<W> {
    GzBuilder::new()
        .mtime(0)
        .operating_system(255)
        .write(inner, Compression::new(LAYER_COMPRESSION_LEVEL))
}

/// Fresh GNU header with every host-dependent field pinned.
pub fn normalized_header(entry_type: EntryType, mode: u32, owner: &Ownership) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(owner.uid);
    header.set_gid(owner.gid);
    header.set_size(0);
    // names longer than the header fields are dropped, numeric ids still apply
    let _ = header.set_username(&owner.user);
    let _ = header.set_groupname(&owner.group);
    header
}

/// Canonical JSON form used for digests: compact, struct field order as
/// declared, maps as `BTreeMap`.
pub fn canonical_json<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(value)
}
