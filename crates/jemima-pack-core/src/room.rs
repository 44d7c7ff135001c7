//! Game-room documents seeded from an assigned pack, and the write
//! interface a room store offers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use time::OffsetDateTime;

use crate::error::ValidationError;
use crate::manifest::SeedSource;
use crate::room_code::RoomCode;
use crate::schema::{reveal_text, NormalizedPack, PackKind, DEFAULT_GUEST_UID, DEFAULT_HOST_UID};
use crate::timestamp::utc_timestamp;

pub const INITIAL_STATE: &str = "keyroom";
pub const SEED_MESSAGE: &str = "Pack ready.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundDocument {
    pub round: u8,
    pub host_items: Vec<Value>,
    pub guest_items: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interlude: Option<String>,
}

/// Everything a store needs to seed one room in a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSeed {
    pub room_code: RoomCode,
    pub document: Map<String, Value>,
    pub rounds: Vec<RoundDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("room store error: {0}")]
pub struct RoomStoreError(pub String);

/// Write interface of the external room store.
///
/// `seed_room` must apply the room upsert and every round document
/// atomically: either all of it is visible to readers or none of it is.
pub trait RoomStore {
    /// Atomic upsert of the room document.
    ///
    /// # Errors
    /// Returns [`RoomStoreError`] when the write does not commit.
    fn create_or_update_room(&mut self, room_code: &RoomCode, document: &Map<String, Value>) -> Result<(), RoomStoreError>;

    /// # Errors
    /// Returns [`RoomStoreError`] when the write does not commit.
    fn set_round_document(&mut self, room_code: &RoomCode, round: &RoundDocument) -> Result<(), RoomStoreError>;

    /// # Errors
    /// Returns [`RoomStoreError`] when the seed does not commit; nothing of it is then visible.
    fn seed_room(&mut self, seed: &RoomSeed) -> Result<(), RoomStoreError>;
}

/// Build the fresh room document and round documents for a combined pack.
///
/// # Errors
/// Returns [`ValidationError`] when `pack` is not a combined pack.
pub fn room_seed(pack: &NormalizedPack, seed_source: &SeedSource, now: OffsetDateTime) -> Result<RoomSeed, ValidationError> {
    if pack.kind() != PackKind::Combined {
        return Err(ValidationError::new(
            "pack",
            format!("rooms are seeded from combined packs, not {}", pack.kind().as_str()),
        ));
    }
    let document = pack.document();
    let room_code = RoomCode::parse(pack.room_code().unwrap_or_default())?;
    let meta = &document["meta"];
    let maths = document.get("maths").cloned().unwrap_or_else(|| json!({}));

    let clues = indexed_texts(maths.get("clues"), Value::as_str);
    let reveals = indexed_texts(maths.get("reveals"), reveal_text);
    let seed_source = serde_json::to_value(seed_source)
        .map_err(|err| ValidationError::new("seedSource", err.to_string()))?;
    let now = utc_timestamp(now).map_err(|err| ValidationError::new("timestamps", err.to_string()))?;
    let sides = || json!({"host": {}, "guest": {}});

    let room = json!({
        "meta": {
            "hostUid": meta.get("hostUid").cloned().unwrap_or_else(|| json!(DEFAULT_HOST_UID)),
            "guestUid": meta.get("guestUid").cloned().unwrap_or_else(|| json!(DEFAULT_GUEST_UID)),
        },
        "state": INITIAL_STATE,
        "round": 1,
        "maths": maths,
        "clues": clues,
        "reveals": reveals,
        "countdown": {"startAt": null},
        "answers": sides(),
        "submitted": sides(),
        "marking": {"host": {}, "guest": {}, "startAt": null},
        "markingAck": sides(),
        "award": {"startAt": null},
        "awardAck": sides(),
        "scores": sides(),
        "timings": sides(),
        "seeds": {"progress": 100, "message": SEED_MESSAGE},
        "timestamps": {"createdAt": now, "updatedAt": now},
        "seedSource": seed_source,
    });
    let Value::Object(room) = room else {
        return Err(ValidationError::new("room", "room document must be an object"));
    };

    let rounds = document
        .get("rounds")
        .and_then(Value::as_array)
        .map(|rounds| rounds.iter().filter_map(round_document).collect())
        .unwrap_or_default();

    Ok(RoomSeed { room_code, document: room, rounds })
}

/// Apply a fresh room document over an existing one.
///
/// Existing non-empty `meta.hostUid`/`meta.guestUid` and
/// `timestamps.createdAt` survive; every other field of `fresh` replaces
/// the stored value and unrelated stored fields are kept.
#[must_use]
pub fn merge_room_document(existing: Option<&Map<String, Value>>, fresh: &Map<String, Value>) -> Map<String, Value> {
    let Some(existing) = existing else {
        return fresh.clone();
    };
    let mut merged = existing.clone();
    for (key, value) in fresh {
        let value = match key.as_str() {
            "meta" => keep_existing(existing.get(key), value, &["hostUid", "guestUid"]),
            "timestamps" => keep_existing(existing.get(key), value, &["createdAt"]),
            _ => value.clone(),
        };
        merged.insert(key.clone(), value);
    }
    merged
}

fn keep_existing(existing: Option<&Value>, fresh: &Value, preserved: &[&str]) -> Value {
    let mut merged = existing.and_then(Value::as_object).cloned().unwrap_or_default();
    if let Some(fresh) = fresh.as_object() {
        for (key, value) in fresh {
            let keep = preserved.contains(&key.as_str())
                && merged.get(key).and_then(Value::as_str).is_some_and(|text| !text.is_empty());
            if !keep {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(merged)
}

/// `{"1": text, ...}` for entries that yield text, keyed by 1-based position.
fn indexed_texts(list: Option<&Value>, text: impl Fn(&Value) -> Option<&str>) -> BTreeMap<String, String> {
    list.and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .enumerate()
                .filter_map(|(index, entry)| text(entry).map(|text| ((index + 1).to_string(), text.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn round_document(entry: &Value) -> Option<RoundDocument> {
    let round = u8::try_from(entry.get("round")?.as_u64()?).ok()?;
    Some(RoundDocument {
        round,
        host_items: entry.get("hostItems")?.as_array()?.clone(),
        guest_items: entry.get("guestItems")?.as_array()?.clone(),
        interlude: entry.get("interlude").and_then(Value::as_str).map(str::to_string),
    })
}

/// In-process [`RoomStore`], for dry runs and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryRoomStore {
    pub rooms: BTreeMap<String, Map<String, Value>>,
    pub rounds: BTreeMap<(String, u8), RoundDocument>,
}

impl RoomStore for MemoryRoomStore {
    fn create_or_update_room(&mut self, room_code: &RoomCode, document: &Map<String, Value>) -> Result<(), RoomStoreError> {
        let merged = merge_room_document(self.rooms.get(room_code.as_str()), document);
        self.rooms.insert(room_code.as_str().to_string(), merged);
        Ok(())
    }

    fn set_round_document(&mut self, room_code: &RoomCode, round: &RoundDocument) -> Result<(), RoomStoreError> {
        self.rounds.insert((room_code.as_str().to_string(), round.round), round.clone());
        Ok(())
    }

    fn seed_room(&mut self, seed: &RoomSeed) -> Result<(), RoomStoreError> {
        self.create_or_update_room(&seed.room_code, &seed.document)?;
        for round in &seed.rounds {
            self.set_round_document(&seed.room_code, round)?;
        }
        Ok(())
    }
}
