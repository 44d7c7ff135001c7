use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::canonical::to_canonical_bytes_without;
use crate::error::IntegrityMismatch;

pub const INTEGRITY_FIELD: &str = "integrity";

/// SHA-256 hex of the canonical encoding of `document` without its
/// integrity block.
#[must_use]
pub fn checksum(document: &Map<String, Value>) -> String {
    hex::encode(Sha256::digest(to_canonical_bytes_without(document, INTEGRITY_FIELD)))
}

/// Replace any integrity block with a fresh one, appended as the last key.
#[must_use]
pub fn stamp(mut document: Map<String, Value>) -> Map<String, Value> {
    document.shift_remove(INTEGRITY_FIELD);
    let checksum = checksum(&document);
    document.insert(INTEGRITY_FIELD.to_string(), json!({"checksum": checksum, "verified": true}));
    document
}

#[must_use]
pub fn stored_checksum(document: &Map<String, Value>) -> Option<&str> {
    document.get(INTEGRITY_FIELD)?.get("checksum")?.as_str()
}

#[must_use]
pub fn verify(document: &Map<String, Value>) -> bool {
    check(document).is_ok()
}

/// Recompute the checksum and compare it to the stored one.
///
/// # Errors
/// Returns [`IntegrityMismatch`] when the block is missing or the checksum differs.
pub fn check(document: &Map<String, Value>) -> Result<String, IntegrityMismatch> {
    let computed = checksum(document);
    match stored_checksum(document) {
        Some(stored) if stored == computed => Ok(computed),
        Some(stored) => Err(IntegrityMismatch { stored: stored.to_string(), computed }),
        None => Err(IntegrityMismatch { stored: "<missing>".to_string(), computed }),
    }
}
