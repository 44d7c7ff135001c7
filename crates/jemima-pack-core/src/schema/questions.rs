use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use time::OffsetDateTime;

use super::meta::{self, RoomCodeRule};
use super::{is_non_empty_str, non_empty_str, QUESTIONS_VERSION};
use crate::error::ValidationError;

pub const ROUND_COUNT: u8 = 5;
pub const ITEMS_PER_SIDE: usize = 3;
pub const OPTION_LABELS: [&str; 2] = ["A", "B"];

const SIDES: [&str; 2] = ["hostItems", "guestItems"];
const DISTRACTOR_PRIORITY: [&str; 3] = ["medium", "easy", "hard"];

pub(crate) fn normalize(document: &mut Map<String, Value>, now: OffsetDateTime) -> Result<(), ValidationError> {
    document.insert("version".to_string(), Value::String(QUESTIONS_VERSION.to_string()));
    meta::normalize(document, now)?;

    let rounds = document.get_mut("rounds").ok_or_else(|| ValidationError::new("rounds", "required"))?;
    let mut by_number = Map::new();
    for (number, round) in rounds_by_number(rounds.take())? {
        by_number.insert(number.to_string(), Value::Object(normalize_round(number, &round)?));
    }
    *rounds = Value::Object(by_number);
    Ok(())
}

pub(crate) fn validate(document: &Map<String, Value>) -> Result<(), ValidationError> {
    meta::validate(document, RoomCodeRule::Authored)?;
    let rounds = document
        .get("rounds")
        .and_then(Value::as_object)
        .ok_or_else(|| ValidationError::new("rounds", "must be an object keyed \"1\"..\"5\""))?;
    for key in rounds.keys() {
        if !(1..=ROUND_COUNT).any(|number| number.to_string() == *key) {
            return Err(ValidationError::new("rounds", format!("unexpected round key '{key}'")));
        }
    }
    for number in 1..=ROUND_COUNT {
        let round = rounds
            .get(&number.to_string())
            .ok_or_else(|| ValidationError::new(format!("round {number}"), "missing"))?;
        validate_round(number, round)?;
    }
    Ok(())
}

/// Collect rounds given either as an object keyed by round number or as a
/// list of objects carrying a `round` field. Every round 1..=5 must appear
/// exactly once.
pub(crate) fn rounds_by_number(rounds: Value) -> Result<BTreeMap<u8, Map<String, Value>>, ValidationError> {
    let mut by_number = BTreeMap::new();
    match rounds {
        Value::Object(object) => {
            for (key, round) in object {
                let number = parse_round_number(&Value::String(key.clone()))
                    .ok_or_else(|| ValidationError::new("rounds", format!("unexpected round key '{key}'")))?;
                let Value::Object(round) = round else {
                    return Err(ValidationError::new(format!("round {number}"), "must be an object"));
                };
                if by_number.insert(number, round).is_some() {
                    return Err(ValidationError::new(format!("round {number}"), "appears more than once"));
                }
            }
        }
        Value::Array(list) => {
            for (index, round) in list.into_iter().enumerate() {
                let Value::Object(mut round) = round else {
                    return Err(ValidationError::new(format!("rounds[{index}]"), "must be an object"));
                };
                let number = round
                    .shift_remove("round")
                    .as_ref()
                    .and_then(parse_round_number)
                    .ok_or_else(|| {
                        ValidationError::new(format!("rounds[{index}]"), "round must be a number from 1 to 5")
                    })?;
                if by_number.insert(number, round).is_some() {
                    return Err(ValidationError::new(format!("round {number}"), "appears more than once"));
                }
            }
        }
        _ => {
            return Err(ValidationError::new(
                "rounds",
                "must be an object keyed by round number or a list of rounds",
            ))
        }
    }
    for number in 1..=ROUND_COUNT {
        if !by_number.contains_key(&number) {
            return Err(ValidationError::new(format!("round {number}"), "missing"));
        }
    }
    Ok(by_number)
}

/// Normalize one round's sides and items. Only `hostItems`, `guestItems`
/// and a non-empty `interlude` survive.
pub(crate) fn normalize_round(number: u8, round: &Map<String, Value>) -> Result<Map<String, Value>, ValidationError> {
    let mut normalized = Map::new();
    for side in SIDES {
        let path = format!("round {number} {side}");
        let items = side_items(round, side, &path)?;
        let items = items
            .iter()
            .enumerate()
            .map(|(index, item)| normalize_item(item, &format!("{path}[{index}]")))
            .collect::<Result<Vec<_>, _>>()?;
        normalized.insert(side.to_string(), Value::Array(items));
    }
    if let Some(interlude) = round.get("interlude").filter(|value| is_non_empty_str(value)) {
        normalized.insert("interlude".to_string(), interlude.clone());
    }
    Ok(normalized)
}

pub(crate) fn validate_round(number: u8, round: &Value) -> Result<(), ValidationError> {
    let round = round
        .as_object()
        .ok_or_else(|| ValidationError::new(format!("round {number}"), "must be an object"))?;
    for side in SIDES {
        let path = format!("round {number} {side}");
        for (index, item) in side_items(round, side, &path)?.iter().enumerate() {
            validate_item(item, &format!("{path}[{index}]"))?;
        }
    }
    match round.get("interlude") {
        None => Ok(()),
        Some(value) if is_non_empty_str(value) => Ok(()),
        Some(_) => Err(ValidationError::new(
            format!("round {number} interlude"),
            "must be a non-empty string when present",
        )),
    }
}

fn side_items<'a>(round: &'a Map<String, Value>, side: &str, path: &str) -> Result<&'a Vec<Value>, ValidationError> {
    let items = round
        .get(side)
        .ok_or_else(|| ValidationError::new(path, "required"))?
        .as_array()
        .ok_or_else(|| ValidationError::new(path, "must be a list"))?;
    if items.len() != ITEMS_PER_SIDE {
        return Err(ValidationError::new(
            path,
            format!("expected {ITEMS_PER_SIDE} items, found {}", items.len()),
        ));
    }
    Ok(items)
}

fn parse_round_number(value: &Value) -> Option<u8> {
    let number = match value {
        Value::Number(number) => u8::try_from(number.as_u64()?).ok()?,
        Value::String(text) => text.trim().parse::<u8>().ok()?,
        _ => return None,
    };
    (1..=ROUND_COUNT).contains(&number).then_some(number)
}

/// Bring an item into `{prompt, options, correct}` shape.
///
/// Legacy `{question, correct_answer, distractors}` items become a two-option
/// item with the correct answer first.
fn normalize_item(item: &Value, path: &str) -> Result<Value, ValidationError> {
    let object = item.as_object().ok_or_else(|| ValidationError::new(path, "must be an object"))?;
    if ["prompt", "options", "correct"].iter().any(|key| object.contains_key(*key)) {
        validate_item(item, path)?;
        return Ok(json!({
            "prompt": object["prompt"],
            "options": object["options"],
            "correct": object["correct"],
        }));
    }

    let question = non_empty_str(object, "question", path)?;
    let correct_answer = non_empty_str(object, "correct_answer", path)?;
    let distractor = object
        .get("distractors")
        .and_then(choose_distractor)
        .ok_or_else(|| ValidationError::new(path, "distractors has no usable non-empty string"))?;
    Ok(json!({
        "prompt": question,
        "options": [correct_answer, distractor],
        "correct": OPTION_LABELS[0],
    }))
}

/// Pick `medium`, then `easy`, then `hard`, then whatever else is present.
fn choose_distractor(distractors: &Value) -> Option<&str> {
    fn usable(value: &Value) -> Option<&str> {
        value.as_str().filter(|text| !text.trim().is_empty())
    }
    match distractors {
        Value::Object(object) => DISTRACTOR_PRIORITY
            .iter()
            .find_map(|key| object.get(*key).and_then(usable))
            .or_else(|| object.values().find_map(usable)),
        Value::Array(list) => list.iter().find_map(usable),
        _ => None,
    }
}

fn validate_item(item: &Value, path: &str) -> Result<(), ValidationError> {
    let object = item.as_object().ok_or_else(|| ValidationError::new(path, "must be an object"))?;
    non_empty_str(object, "prompt", path)?;
    let options = object
        .get("options")
        .and_then(Value::as_array)
        .ok_or_else(|| ValidationError::new(path, "options must be a list"))?;
    if options.len() != OPTION_LABELS.len() || !options.iter().all(is_non_empty_str) {
        return Err(ValidationError::new(path, "options must contain exactly 2 non-empty strings"));
    }
    match object.get("correct").and_then(Value::as_str) {
        Some(label) if OPTION_LABELS.contains(&label) => Ok(()),
        Some(label) => Err(ValidationError::new(path, format!("correct must be 'A' or 'B', found '{label}'"))),
        None => Err(ValidationError::new(path, "correct must be 'A' or 'B'")),
    }
}
