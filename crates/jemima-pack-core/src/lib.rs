//! Sealed game packs: canonical encoding, integrity stamps, the password
//! envelope, per-kind schema normalization and room seeding documents.

pub mod canonical;
pub mod envelope;
pub mod error;
pub mod integrity;
pub mod manifest;
pub mod room;
pub mod room_code;
pub mod schema;
pub mod timestamp;

pub use canonical::{to_canonical_bytes, to_canonical_bytes_without};
pub use envelope::{seal, unseal, unseal_bytes, KdfParams, SealedEnvelope, DEFAULT_PBKDF2_ITERATIONS};
pub use error::{EnvelopeError, IntegrityMismatch, PackError, ValidationError};
pub use manifest::{sha256_hex, PackManifest, PackProvenance, PackType, SeedSource};
pub use room::{merge_room_document, room_seed, MemoryRoomStore, RoomSeed, RoomStore, RoomStoreError, RoundDocument};
pub use room_code::RoomCode;
pub use schema::{
    normalize, normalize_as, parse_document, validate, validate_maths, MathsVariant, NormalizedPack, PackKind,
};
pub use timestamp::{pool_key, utc_timestamp};

use serde_json::Value;
use time::OffsetDateTime;

/// Normalize, stamp and encode a raw pack into its canonical plaintext.
///
/// # Errors
/// Returns [`PackError::Validation`] for content that fails the schema.
pub fn prepare_plaintext(value: Value, now: OffsetDateTime) -> Result<(NormalizedPack, Vec<u8>), PackError> {
    let pack = normalize(value, now)?.stamped();
    let plaintext = pack.canonical_bytes();
    Ok((pack, plaintext))
}

/// Decrypt, parse, verify the integrity block and validate a sealed pack.
///
/// An integrity mismatch is returned inside the report rather than as an
/// error, so callers decide whether it is fatal.
///
/// # Errors
/// Returns [`PackError::Envelope`] when decryption fails and
/// [`PackError::Validation`] when the plaintext is not a valid pack.
pub fn open_sealed(envelope_json: &[u8], password: &[u8]) -> Result<OpenedPack, PackError> {
    let plaintext = unseal_bytes(envelope_json, password)?;
    let document = schema::parse_document(&plaintext)?;
    let integrity = integrity::check(&document).map(|_| ());
    let kind = validate(&document)?;
    Ok(OpenedPack { kind, document, integrity })
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenedPack {
    pub kind: PackKind,
    pub document: serde_json::Map<String, Value>,
    pub integrity: Result<(), IntegrityMismatch>,
}
