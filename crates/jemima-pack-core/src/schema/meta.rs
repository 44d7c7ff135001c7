use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::ValidationError;
use crate::room_code::{is_assigned_room_code, is_authored_room_code};
use crate::timestamp::utc_timestamp;

pub const DEFAULT_HOST_UID: &str = "demo-host";
pub const DEFAULT_GUEST_UID: &str = "demo-guest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RoomCodeRule {
    /// Three uppercase letters, as written by pack authors.
    Authored,
    /// Three symbols from the unambiguous assignment alphabet.
    Assigned,
}

/// Fill defaults into `meta`, creating it when absent.
pub(crate) fn normalize(document: &mut Map<String, Value>, now: OffsetDateTime) -> Result<(), ValidationError> {
    let generated_at =
        utc_timestamp(now).map_err(|err| ValidationError::new("meta.generatedAt", err.to_string()))?;
    let meta = document.entry("meta").or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(meta) = meta else {
        return Err(ValidationError::new("meta", "must be an object"));
    };
    fill_default(meta, "generatedAt", || generated_at);
    fill_default(meta, "hostUid", || DEFAULT_HOST_UID.to_string());
    fill_default(meta, "guestUid", || DEFAULT_GUEST_UID.to_string());
    Ok(())
}

pub(crate) fn validate(document: &Map<String, Value>, rule: RoomCodeRule) -> Result<(), ValidationError> {
    let meta = document
        .get("meta")
        .ok_or_else(|| ValidationError::new("meta", "required"))?
        .as_object()
        .ok_or_else(|| ValidationError::new("meta", "must be an object"))?;

    match meta.get("roomCode").and_then(Value::as_str) {
        Some(code) if rule == RoomCodeRule::Authored && is_authored_room_code(code) => {}
        Some(code) if rule == RoomCodeRule::Assigned && is_assigned_room_code(code) => {}
        Some(code) => {
            let expected = match rule {
                RoomCodeRule::Authored => "exactly three uppercase letters",
                RoomCodeRule::Assigned => "three characters from ABCDEFGHJKLMNPQRSTUVWXYZ23456789",
            };
            return Err(ValidationError::new("meta.roomCode", format!("'{code}' must be {expected}")));
        }
        None => return Err(ValidationError::new("meta.roomCode", "required")),
    }

    let generated_at = meta
        .get("generatedAt")
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::new("meta.generatedAt", "must be a timestamp string"))?;
    OffsetDateTime::parse(generated_at, &Rfc3339).map_err(|_| {
        ValidationError::new(
            "meta.generatedAt",
            format!("'{generated_at}' is not a UTC timestamp like 2024-05-01T10:00:00Z"),
        )
    })?;

    for key in ["hostUid", "guestUid"] {
        if !meta.get(key).is_some_and(super::is_non_empty_str) {
            return Err(ValidationError::new(format!("meta.{key}"), "must be a non-empty string"));
        }
    }
    Ok(())
}

fn fill_default(meta: &mut Map<String, Value>, key: &str, default: impl FnOnce() -> String) {
    if meta.get(key).map_or(true, Value::is_null) {
        meta.insert(key.to_string(), Value::String(default()));
    }
}
