//! Pack kinds, legacy-shape normalization and closed-world validation.
//!
//! Every pack enters through [`normalize`], which settles the [`PackKind`]
//! once and hands the document to that kind's normalizer. The result is
//! always re-checked by [`validate_as`] before it is returned, so a
//! [`NormalizedPack`] is valid by construction.

mod combined;
mod maths;
mod meta;
mod questions;

use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::canonical::to_canonical_bytes;
use crate::error::ValidationError;
use crate::integrity;

pub use maths::{reveal_text, MathsVariant, EVENT_COUNT, MAX_EVENT_YEAR, MIN_EVENT_YEAR};
pub use meta::{DEFAULT_GUEST_UID, DEFAULT_HOST_UID};
pub use questions::{ITEMS_PER_SIDE, OPTION_LABELS, ROUND_COUNT};

pub const QUESTIONS_VERSION: &str = "jemima-questions-1";
pub const MATHS_CHAIN_VERSION: &str = "jemima-maths-chain-2";
pub const MATHS_TIMELINE_VERSION: &str = "jemima-maths-timeline-1";
pub const COMBINED_VERSION: &str = "jemima-pack-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackKind {
    Questions,
    MathsChain,
    MathsTimeline,
    Combined,
}

impl PackKind {
    /// The version tag a normalized pack of this kind carries.
    #[must_use]
    pub fn version(self) -> &'static str {
        match self {
            Self::Questions => QUESTIONS_VERSION,
            Self::MathsChain => MATHS_CHAIN_VERSION,
            Self::MathsTimeline => MATHS_TIMELINE_VERSION,
            Self::Combined => COMBINED_VERSION,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Questions => "questions",
            Self::MathsChain => "maths_chain",
            Self::MathsTimeline => "maths_timeline",
            Self::Combined => "combined",
        }
    }

    #[must_use]
    pub fn maths_variant(self) -> Option<MathsVariant> {
        match self {
            Self::MathsChain => Some(MathsVariant::Chain),
            Self::MathsTimeline => Some(MathsVariant::Timeline),
            Self::Questions | Self::Combined => None,
        }
    }

    /// Exact match against the current version tags.
    #[must_use]
    pub fn from_version(version: &str) -> Option<Self> {
        match version {
            QUESTIONS_VERSION => Some(Self::Questions),
            MATHS_CHAIN_VERSION => Some(Self::MathsChain),
            MATHS_TIMELINE_VERSION => Some(Self::MathsTimeline),
            COMBINED_VERSION => Some(Self::Combined),
            _ => None,
        }
    }

    /// Decide the kind of a raw document from its declared version, falling
    /// back to its content when the version is missing or unrecognised.
    ///
    /// Question and combined packs accept legacy version tags and are
    /// corrected during normalization. Maths packs must declare one of the
    /// two maths versions exactly.
    ///
    /// # Errors
    /// Returns [`ValidationError`] when no kind can be settled.
    pub fn detect(document: &Map<String, Value>) -> Result<Self, ValidationError> {
        match document.get("version") {
            Some(Value::String(version)) => {
                if version.starts_with("jemima-questions") || version.starts_with("jemima-questionpack") {
                    return Ok(Self::Questions);
                }
                if version.starts_with("jemima-maths") {
                    return match version.as_str() {
                        MATHS_CHAIN_VERSION => Ok(Self::MathsChain),
                        MATHS_TIMELINE_VERSION => Ok(Self::MathsTimeline),
                        other => Err(ValidationError::new(
                            "version",
                            format!(
                                "unsupported maths version '{other}'; expected \
                                 {MATHS_CHAIN_VERSION} or {MATHS_TIMELINE_VERSION}"
                            ),
                        )),
                    };
                }
                if version.starts_with("jemima-pack") {
                    return Ok(Self::Combined);
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => return Err(ValidationError::new("version", "must be a string")),
        }

        match (document.contains_key("rounds"), document.contains_key("maths")) {
            (true, true) => Ok(Self::Combined),
            (true, false) => Ok(Self::Questions),
            (false, true) => Err(ValidationError::new(
                "version",
                format!(
                    "maths packs must declare {MATHS_CHAIN_VERSION} or {MATHS_TIMELINE_VERSION}"
                ),
            )),
            (false, false) => {
                Err(ValidationError::new("pack", "cannot determine pack kind: no rounds or maths"))
            }
        }
    }
}

/// A pack that has passed normalization and the closed-world check.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPack {
    kind: PackKind,
    document: Map<String, Value>,
}

impl NormalizedPack {
    #[must_use]
    pub fn kind(&self) -> PackKind {
        self.kind
    }

    #[must_use]
    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }

    #[must_use]
    pub fn into_document(self) -> Map<String, Value> {
        self.document
    }

    #[must_use]
    pub fn room_code(&self) -> Option<&str> {
        self.document.get("meta")?.get("roomCode")?.as_str()
    }

    #[must_use]
    pub fn generated_at(&self) -> Option<&str> {
        self.document.get("meta")?.get("generatedAt")?.as_str()
    }

    /// Replace the integrity block with a fresh one.
    #[must_use]
    pub fn stamped(self) -> Self {
        Self { kind: self.kind, document: integrity::stamp(self.document) }
    }

    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        to_canonical_bytes(&Value::Object(self.document.clone()))
    }
}

/// Detect the kind of `value`, coerce legacy shapes and validate.
///
/// `now` fills a missing `meta.generatedAt`.
///
/// # Errors
/// Returns [`ValidationError`] naming the offending path.
pub fn normalize(value: Value, now: OffsetDateTime) -> Result<NormalizedPack, ValidationError> {
    let document = into_object(value)?;
    let kind = PackKind::detect(&document)?;
    normalize_as(kind, document, now)
}

/// Normalize as a known kind, skipping detection.
///
/// # Errors
/// Returns [`ValidationError`] naming the offending path.
pub fn normalize_as(
    kind: PackKind,
    mut document: Map<String, Value>,
    now: OffsetDateTime,
) -> Result<NormalizedPack, ValidationError> {
    match kind {
        PackKind::Questions => questions::normalize(&mut document, now)?,
        PackKind::MathsChain => maths::normalize_pack(&mut document, MathsVariant::Chain, now)?,
        PackKind::MathsTimeline => maths::normalize_pack(&mut document, MathsVariant::Timeline, now)?,
        PackKind::Combined => combined::normalize(&mut document, now)?,
    }
    validate_as(kind, &document)?;
    Ok(NormalizedPack { kind, document })
}

/// Validate a document that should already be in normalized shape; the
/// kind comes from its exact version tag.
///
/// # Errors
/// Returns [`ValidationError`] for an unknown version or any violation.
pub fn validate(document: &Map<String, Value>) -> Result<PackKind, ValidationError> {
    let version = document
        .get("version")
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::new("version", "required"))?;
    let kind = PackKind::from_version(version)
        .ok_or_else(|| ValidationError::new("version", format!("unsupported version '{version}'")))?;
    validate_as(kind, document)?;
    Ok(kind)
}

/// Closed-world check of every structural invariant of `kind`.
///
/// # Errors
/// Returns [`ValidationError`] naming the first offending path.
pub fn validate_as(kind: PackKind, document: &Map<String, Value>) -> Result<(), ValidationError> {
    expect_version(document, kind.version())?;
    match kind {
        PackKind::Questions => questions::validate(document),
        PackKind::MathsChain => maths::validate_pack(document, MathsVariant::Chain),
        PackKind::MathsTimeline => maths::validate_pack(document, MathsVariant::Timeline),
        PackKind::Combined => combined::validate(document),
    }
}

/// Check a `maths` object on its own, inferring the variant from its shape.
///
/// # Errors
/// Returns [`ValidationError`] naming the first offending path.
pub fn validate_maths(maths: &Value) -> Result<MathsVariant, ValidationError> {
    let maths = maths.as_object().ok_or_else(|| ValidationError::new("maths", "must be an object"))?;
    let variant = MathsVariant::infer(maths);
    maths::validate_content(variant, maths)?;
    Ok(variant)
}

/// Parse decrypted payload bytes into a pack document.
///
/// # Errors
/// Returns [`ValidationError`] when the bytes are not a JSON object.
pub fn parse_document(bytes: &[u8]) -> Result<Map<String, Value>, ValidationError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|err| ValidationError::new("pack", format!("not valid JSON: {err}")))?;
    into_object(value)
}

fn into_object(value: Value) -> Result<Map<String, Value>, ValidationError> {
    match value {
        Value::Object(document) => Ok(document),
        _ => Err(ValidationError::new("pack", "must be a JSON object")),
    }
}

fn expect_version(document: &Map<String, Value>, expected: &str) -> Result<(), ValidationError> {
    match document.get("version").and_then(Value::as_str) {
        Some(version) if version == expected => Ok(()),
        Some(version) => {
            Err(ValidationError::new("version", format!("expected '{expected}', found '{version}'")))
        }
        None => Err(ValidationError::new("version", format!("required; expected '{expected}'"))),
    }
}

pub(crate) fn non_empty_str<'a>(
    object: &'a Map<String, Value>,
    key: &str,
    path: &str,
) -> Result<&'a str, ValidationError> {
    match object.get(key) {
        Some(Value::String(text)) if !text.trim().is_empty() => Ok(text.as_str()),
        Some(Value::String(_)) => Err(ValidationError::new(path, format!("{key} must not be empty"))),
        Some(_) => Err(ValidationError::new(path, format!("{key} must be a string"))),
        None => Err(ValidationError::new(path, format!("{key} is required"))),
    }
}

pub(crate) fn is_non_empty_str(value: &Value) -> bool {
    value.as_str().is_some_and(|text| !text.trim().is_empty())
}

/// Integers written as JSON strings (`"1990"`) become numbers.
pub(crate) fn coerce_integer(object: &mut Map<String, Value>, key: &str) {
    if let Some(Value::String(text)) = object.get(key) {
        if let Ok(number) = text.trim().parse::<i64>() {
            object.insert(key.to_string(), Value::from(number));
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::Duration;

    use super::*;

    pub(crate) fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_714_557_600)
    }

    pub(crate) fn item(n: usize) -> Value {
        json!({"prompt": format!("Question {n}?"), "options": [format!("Right {n}"), format!("Wrong {n}")], "correct": "A"})
    }

    pub(crate) fn round_body(round: usize) -> Value {
        json!({
            "hostItems": [item(round * 10 + 1), item(round * 10 + 2), item(round * 10 + 3)],
            "guestItems": [item(round * 10 + 4), item(round * 10 + 5), item(round * 10 + 6)],
        })
    }

    pub(crate) fn questions_pack() -> Value {
        let mut rounds = Map::new();
        for round in 1..=5 {
            rounds.insert(round.to_string(), round_body(round));
        }
        json!({"version": QUESTIONS_VERSION, "rounds": rounds, "meta": {"roomCode": "CAT"}})
    }

    pub(crate) fn chain_pack() -> Value {
        json!({
            "version": MATHS_CHAIN_VERSION,
            "meta": {"roomCode": "CAT", "generatedAt": "2024-05-01T10:00:00Z"},
            "maths": {
                "clues": ["one", "two", "three", "four", "five"],
                "reveals": ["r1", {"prompt": "r2"}, {"text": "r3"}, {"value": "r4"}, "r5"],
                "question": "What is the total?",
                "answer": 42
            }
        })
    }

    pub(crate) fn timeline_pack(years: [i64; 5]) -> Value {
        let events = years
            .iter()
            .map(|year| json!({"year": year, "text": format!("Something in {year}")}))
            .collect::<Vec<_>>();
        json!({
            "version": MATHS_TIMELINE_VERSION,
            "meta": {"roomCode": "CAT"},
            "maths": {"events": events, "question": "Sum the years"}
        })
    }

    fn normalized(value: Value) -> NormalizedPack {
        normalize(value, fixture_time()).unwrap_or_else(|err| panic!("normalize failed: {err}"))
    }

    // Test IDs: SCH-001
    #[test]
    fn authored_question_pack_normalizes_and_round_trips_through_the_envelope() {
        let pack = normalized(questions_pack()).stamped();
        assert_eq!(pack.kind(), PackKind::Questions);
        assert_eq!(pack.generated_at(), Some("2024-05-01T10:00:00Z"));
        assert_eq!(pack.document()["meta"]["hostUid"], DEFAULT_HOST_UID);
        assert!(integrity::verify(pack.document()));

        let canonical = pack.canonical_bytes();
        let envelope = crate::envelope::seal(
            &canonical,
            b"DEMO-ONLY",
            crate::envelope::KdfParams { iterations: 1_000 },
        )
        .unwrap_or_else(|err| panic!("seal failed: {err}"));
        let plaintext = crate::envelope::unseal(&envelope, b"DEMO-ONLY")
            .unwrap_or_else(|err| panic!("unseal failed: {err}"));
        assert_eq!(plaintext, canonical);

        let reparsed = parse_document(&plaintext).unwrap_or_else(|err| panic!("parse: {err}"));
        assert_eq!(validate(&reparsed), Ok(PackKind::Questions));
        assert_eq!(to_canonical_bytes(&Value::Object(reparsed)), canonical);
    }

    #[test]
    fn normalizing_twice_is_stable() {
        let once = normalized(questions_pack());
        let twice = normalized(Value::Object(once.document().clone()));
        assert_eq!(once.canonical_bytes(), twice.canonical_bytes());
    }

    #[test]
    fn detection_follows_declared_version_then_content() {
        let detect = |value: Value| match value {
            Value::Object(document) => PackKind::detect(&document),
            other => panic!("fixture must be an object, got {other}"),
        };
        assert_eq!(detect(json!({"version": "jemima-questionpack-1", "rounds": {}})), Ok(PackKind::Questions));
        assert_eq!(detect(json!({"rounds": {}})), Ok(PackKind::Questions));
        assert_eq!(detect(json!({"rounds": [], "maths": {}})), Ok(PackKind::Combined));
        assert_eq!(detect(json!({"version": MATHS_TIMELINE_VERSION})), Ok(PackKind::MathsTimeline));
        assert_eq!(detect(json!({"version": "jemima-pack-0"})), Ok(PackKind::Combined));
        assert!(detect(json!({"version": "jemima-maths-chain-1", "maths": {}})).is_err());
        assert!(detect(json!({"maths": {}})).is_err());
        assert!(detect(json!({"version": 3})).is_err());
        assert!(detect(json!({})).is_err());
    }

    #[test]
    fn legacy_question_version_is_corrected() {
        let mut value = questions_pack();
        value["version"] = json!("jemima-questionpack-1");
        let pack = normalized(value);
        assert_eq!(pack.document()["version"], QUESTIONS_VERSION);
    }

    #[test]
    fn validate_rejects_unknown_versions() {
        let mut document = normalized(questions_pack()).into_document();
        document.insert("version".to_string(), json!("jemima-questions-0"));
        match validate(&document) {
            Ok(kind) => panic!("stale version must be rejected, got {kind:?}"),
            Err(err) => assert_eq!(err.path, "version"),
        }
    }

    #[test]
    fn non_object_packs_are_rejected() {
        assert!(normalize(json!([1, 2, 3]), fixture_time()).is_err());
        assert!(parse_document(b"\"just a string\"").is_err());
    }

    #[test]
    fn maths_objects_validate_on_their_own() {
        assert_eq!(validate_maths(&chain_pack()["maths"]), Ok(MathsVariant::Chain));
        let timeline = normalized(timeline_pack([1066, 1215, 1492, 1815, 1969]));
        assert_eq!(validate_maths(&timeline.document()["maths"]), Ok(MathsVariant::Timeline));
        assert!(validate_maths(&timeline_pack([1969, 1215, 1492, 1815, 1066])["maths"]).is_err());
        assert!(validate_maths(&json!("maths")).is_err());
    }
}
