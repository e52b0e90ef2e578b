//! Small shared helpers: content hashing, text normalization, clocks.

use std::path::Path;

use xxhash_rust::xxh3::xxh3_64;

/// 64-bit non-cryptographic digest of a string, rendered as decimal.
///
/// Used for both document content hashes and per-chunk hashes so the
/// pipeline can compare rows without re-reading payloads.
pub fn content_hash(content: &str) -> String {
    xxh3_64(content.as_bytes()).to_string()
}

/// Replace CRLF and lone CR line endings with LF.
pub fn normalize_line_endings(input: &str) -> String {
    if !input.contains('\r') {
        return input.to_string();
    }
    input.replace("\r\n", "\n").replace('\r', "\n")
}

/// Number of Unicode scalar values in a string (not bytes).
pub fn utf8_len(s: &str) -> usize {
    s.chars().count()
}

/// Wall-clock seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Filesystem mtime of a path in seconds since the Unix epoch.
pub fn mtime_secs(path: &Path) -> std::io::Result<i64> {
    let meta = std::fs::metadata(path)?;
    let mtime = meta.modified()?;
    let secs = mtime
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(secs)
}
