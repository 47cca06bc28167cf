//! Single byte-range requests (`Range: bytes=...`) for blob downloads.

/// Inclusive byte span of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Never zero: a range always covers at least one byte.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a blob of `total` bytes.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// The requested range lies outside the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsatisfiable;

/// Interpret a `Range` header against a blob of `total` bytes.
///
/// Headers this server does not handle (other units, several ranges,
/// malformed values) are ignored and the whole blob is served. Only a
/// well-formed range that starts past the end is unsatisfiable.
pub fn parse_range(header: Option<&str>, total: u64) -> Result<Option<ByteRange>, Unsatisfiable> {
    let Some(ranges) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return Ok(None);
    };
    if ranges.contains(',') {
        return Ok(None);
    }
    let Some((start, end)) = ranges.split_once('-') else {
        return Ok(None);
    };
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        // suffix form: the last `n` bytes
        let Ok(n) = end.parse::<u64>() else {
            return Ok(None);
        };
        if n == 0 || total == 0 {
            return Err(Unsatisfiable);
        }
        return Ok(Some(ByteRange {
            start: total.saturating_sub(n),
            end: total - 1,
        }));
    }

    let Ok(start) = start.parse::<u64>() else {
        return Ok(None);
    };
    let end = if end.is_empty() {
        None
    } else {
        match end.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return Ok(None),
        }
    };
    if start >= total {
        return Err(Unsatisfiable);
    }
    Ok(Some(ByteRange {
        start,
        end: end.map_or(total - 1, |e| e.min(total - 1)),
    }))
}
