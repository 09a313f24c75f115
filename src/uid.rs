//! Deterministic identifier hashing.
//!
//! Maps any string to a fixed-length run of digits that is usable as a DICOM
//! UID component: digits only, never a leading zero.

use sha2::{Digest, Sha512};

use crate::error::{GatewayError, Result};

/// Default output length
pub const DEFAULT_UID_LENGTH: usize = 64;

/// Longest output `hash` will produce. A SHA-512 digest renders to at least
/// 129 digits with the prefix, so every length up to this is always available.
pub const MAX_HASH_LENGTH: usize = 128;

const PREFIX: char = '1';

/// Hash `input` into exactly `length` decimal digits.
///
/// Each call builds its own hasher; nothing is shared between calls.
pub fn hash(input: &str, length: usize) -> Result<String> {
    if length == 0 || length > MAX_HASH_LENGTH {
        return Err(GatewayError::invalid_argument(format!(
            "Hash length must be between 1 and {}, got {}",
            MAX_HASH_LENGTH, length
        )));
    }

    let mut hasher = Sha512::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(1 + digest.len() * 3);
    out.push(PREFIX);
    for byte in digest.iter() {
        out.push_str(&format!("{:02}", byte));
    }

    out.truncate(length);
    Ok(out)
}

/// `hash` with the default length
pub fn hash_uid(input: &str) -> Result<String> {
    hash(input, DEFAULT_UID_LENGTH)
}
