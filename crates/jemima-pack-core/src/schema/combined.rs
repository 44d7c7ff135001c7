use serde_json::{Map, Value};
use time::OffsetDateTime;

use super::maths::{self, MathsVariant};
use super::meta::{self, RoomCodeRule};
use super::questions::{self, ROUND_COUNT};
use super::COMBINED_VERSION;
use crate::error::ValidationError;

/// Combined packs carry rounds as an ordered list of
/// `{round, hostItems, guestItems}` and the maths object of whichever
/// variant was paired in.
pub(crate) fn normalize(document: &mut Map<String, Value>, now: OffsetDateTime) -> Result<(), ValidationError> {
    document.insert("version".to_string(), Value::String(COMBINED_VERSION.to_string()));
    meta::normalize(document, now)?;

    let rounds = document.get_mut("rounds").ok_or_else(|| ValidationError::new("rounds", "required"))?;
    let mut ordered = Vec::with_capacity(usize::from(ROUND_COUNT));
    for (number, round) in questions::rounds_by_number(rounds.take())? {
        let mut entry = Map::new();
        entry.insert("round".to_string(), Value::from(number));
        entry.extend(questions::normalize_round(number, &round)?);
        ordered.push(Value::Object(entry));
    }
    *rounds = Value::Array(ordered);

    let maths = document
        .get_mut("maths")
        .ok_or_else(|| ValidationError::new("maths", "required"))?
        .as_object_mut()
        .ok_or_else(|| ValidationError::new("maths", "must be an object"))?;
    maths::normalize_content(MathsVariant::infer(maths), maths);
    Ok(())
}

pub(crate) fn validate(document: &Map<String, Value>) -> Result<(), ValidationError> {
    meta::validate(document, RoomCodeRule::Assigned)?;
    let rounds = document
        .get("rounds")
        .and_then(Value::as_array)
        .ok_or_else(|| ValidationError::new("rounds", "must be a list"))?;
    if rounds.len() != usize::from(ROUND_COUNT) {
        return Err(ValidationError::new(
            "rounds",
            format!("expected {ROUND_COUNT} rounds, found {}", rounds.len()),
        ));
    }
    for (expected, round) in (1..=ROUND_COUNT).zip(rounds) {
        let declared = round.get("round").and_then(Value::as_u64);
        if declared != Some(u64::from(expected)) {
            return Err(ValidationError::new(
                format!("rounds[{}]", expected - 1),
                format!("round must be {expected}"),
            ));
        }
        questions::validate_round(expected, round)?;
    }

    let maths = document
        .get("maths")
        .and_then(Value::as_object)
        .ok_or_else(|| ValidationError::new("maths", "must be an object"))?;
    maths::validate_content(MathsVariant::infer(maths), maths)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::schema::tests::{chain_pack, fixture_time, questions_pack, timeline_pack};
    use crate::schema::{normalize, PackKind};

    fn combined(maths: &Value) -> Value {
        let questions = questions_pack();
        json!({
            "version": COMBINED_VERSION,
            "meta": {"roomCode": "K7Q", "generatedAt": "2024-05-01T10:00:00Z"},
            "rounds": questions["rounds"],
            "maths": maths["maths"],
        })
    }

    #[test]
    fn round_map_becomes_an_ordered_list() {
        let pack = normalize(combined(&chain_pack()), fixture_time())
            .unwrap_or_else(|err| panic!("normalize: {err}"));
        assert_eq!(pack.kind(), PackKind::Combined);
        let rounds = pack.document()["rounds"].as_array().cloned().unwrap_or_default();
        assert_eq!(rounds.len(), 5);
        for (index, round) in rounds.iter().enumerate() {
            assert_eq!(round["round"], json!(index + 1));
            let keys = round.as_object().map(|object| object.keys().cloned().collect::<Vec<_>>());
            assert_eq!(keys, Some(vec!["round".to_string(), "hostItems".to_string(), "guestItems".to_string()]));
        }
    }

    #[test]
    fn timeline_maths_is_accepted_inside_a_combined_pack() {
        let pack = normalize(combined(&timeline_pack([1900, 1950, 1969, 1989, 2001])), fixture_time())
            .unwrap_or_else(|err| panic!("normalize: {err}"));
        assert_eq!(pack.kind(), PackKind::Combined);
    }

    #[test]
    fn assigned_codes_may_contain_digits_but_not_ambiguous_symbols() {
        let mut value = combined(&chain_pack());
        value["meta"]["roomCode"] = json!("K0Q");
        match normalize(value, fixture_time()) {
            Ok(pack) => panic!("ambiguous symbol accepted: {:?}", pack.room_code()),
            Err(err) => assert_eq!(err.path, "meta.roomCode"),
        }
    }

    #[test]
    fn misnumbered_round_list_is_rejected_by_validation() {
        let pack = normalize(combined(&chain_pack()), fixture_time())
            .unwrap_or_else(|err| panic!("normalize: {err}"));
        let mut document = pack.into_document();
        if let Some(Value::Array(rounds)) = document.get_mut("rounds") {
            rounds.swap(0, 1);
        }
        match crate::schema::validate(&document) {
            Ok(kind) => panic!("swapped rounds accepted as {kind:?}"),
            Err(err) => assert_eq!(err.path, "rounds[0]"),
        }
    }
}
