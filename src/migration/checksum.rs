//! Checksums used to detect drift between applied steps and their source

use sha2::{Digest, Sha256};

/// Separator placed between the up and down bodies before hashing
pub const BODY_SEPARATOR: &str = "\n--DOWN--\n";

/// Hex-encoded SHA-256 of `content`
pub fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Checksum of a declarative step
///
/// Computed over `up + "\n--DOWN--\n" + down`, so changing either body
/// changes the checksum while moving text across the marker does too.
pub fn sql_checksum(up: &str, down: &str) -> String {
    let mut canonical = String::with_capacity(up.len() + BODY_SEPARATOR.len() + down.len());
    canonical.push_str(up);
    canonical.push_str(BODY_SEPARATOR);
    canonical.push_str(down);
    sha256_hex(&canonical)
}

/// Checksum of a procedural step
///
/// Code bodies cannot be hashed, so the identity of the step stands in for
/// its content. Renaming a code migration after it was applied is reported
/// as drift.
pub fn code_checksum(version: i64, name: &str) -> String {
    sha256_hex(&format!("code:{version}_{name}"))
}

/// Compare a stored checksum with the current one
pub fn checksums_match(stored: &str, current: &str) -> bool {
    stored.eq_ignore_ascii_case(current)
}
