use serde_json::{Map, Value};
use time::OffsetDateTime;

use super::meta::{self, RoomCodeRule};
use super::{coerce_integer, is_non_empty_str, non_empty_str, MATHS_CHAIN_VERSION, MATHS_TIMELINE_VERSION};
use crate::error::ValidationError;

pub const CLUE_COUNT: usize = 5;
pub const REVEAL_COUNT: usize = 5;
pub const EVENT_COUNT: usize = 5;
pub const MIN_EVENT_YEAR: i64 = 1;
pub const MAX_EVENT_YEAR: i64 = 2025;

const REVEAL_TEXT_KEYS: [&str; 3] = ["prompt", "text", "value"];
const LEGACY_EVENT_TEXT_KEYS: [&str; 2] = ["event", "label"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathsVariant {
    /// Five clues and reveals leading to an integer answer.
    Chain,
    /// Five dated events in chronological order.
    Timeline,
}

impl MathsVariant {
    #[must_use]
    pub fn version(self) -> &'static str {
        match self {
            Self::Chain => MATHS_CHAIN_VERSION,
            Self::Timeline => MATHS_TIMELINE_VERSION,
        }
    }

    /// Shape-based guess, used where the maths object travels without its
    /// own version tag (inside a combined pack).
    #[must_use]
    pub fn infer(maths: &Map<String, Value>) -> Self {
        if maths.contains_key("events") {
            Self::Timeline
        } else {
            Self::Chain
        }
    }
}

/// Display text of a reveal: the string itself, or the first non-empty
/// `prompt`, `text` or `value` of an object.
#[must_use]
pub fn reveal_text(reveal: &Value) -> Option<&str> {
    match reveal {
        Value::String(text) if !text.trim().is_empty() => Some(text.as_str()),
        Value::Object(object) => REVEAL_TEXT_KEYS
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_str).filter(|text| !text.trim().is_empty())),
        _ => None,
    }
}

pub(crate) fn normalize_pack(
    document: &mut Map<String, Value>,
    variant: MathsVariant,
    now: OffsetDateTime,
) -> Result<(), ValidationError> {
    document.insert("version".to_string(), Value::String(variant.version().to_string()));
    meta::normalize(document, now)?;
    let maths = document
        .get_mut("maths")
        .ok_or_else(|| ValidationError::new("maths", "required"))?
        .as_object_mut()
        .ok_or_else(|| ValidationError::new("maths", "must be an object"))?;
    normalize_content(variant, maths);
    Ok(())
}

pub(crate) fn validate_pack(document: &Map<String, Value>, variant: MathsVariant) -> Result<(), ValidationError> {
    meta::validate(document, RoomCodeRule::Authored)?;
    let maths = document
        .get("maths")
        .and_then(Value::as_object)
        .ok_or_else(|| ValidationError::new("maths", "must be an object"))?;
    validate_content(variant, maths)
}

/// Coerce legacy spellings inside a maths object: numeric strings for
/// `answer`, `year` and `total`, and `event`/`label` as event `text`.
pub(crate) fn normalize_content(variant: MathsVariant, maths: &mut Map<String, Value>) {
    match variant {
        MathsVariant::Chain => coerce_integer(maths, "answer"),
        MathsVariant::Timeline => {
            if let Some(Value::Array(events)) = maths.get_mut("events") {
                for event in events.iter_mut().filter_map(Value::as_object_mut) {
                    coerce_integer(event, "year");
                    if event.contains_key("text") {
                        continue;
                    }
                    for legacy in LEGACY_EVENT_TEXT_KEYS {
                        if event.get(legacy).is_some_and(is_non_empty_str) {
                            if let Some(text) = event.shift_remove(legacy) {
                                event.insert("text".to_string(), text);
                            }
                            break;
                        }
                    }
                }
            }
            coerce_integer(maths, "total");
        }
    }
}

pub(crate) fn validate_content(variant: MathsVariant, maths: &Map<String, Value>) -> Result<(), ValidationError> {
    match variant {
        MathsVariant::Chain => validate_chain(maths),
        MathsVariant::Timeline => validate_timeline(maths),
    }
}

fn validate_chain(maths: &Map<String, Value>) -> Result<(), ValidationError> {
    let clues = exact_list(maths, "clues", CLUE_COUNT)?;
    for (index, clue) in clues.iter().enumerate() {
        if !is_non_empty_str(clue) {
            return Err(ValidationError::new(format!("maths.clues[{index}]"), "must be a non-empty string"));
        }
    }
    let reveals = exact_list(maths, "reveals", REVEAL_COUNT)?;
    for (index, reveal) in reveals.iter().enumerate() {
        if reveal_text(reveal).is_none() {
            return Err(ValidationError::new(
                format!("maths.reveals[{index}]"),
                "must be a non-empty string or an object with prompt, text or value",
            ));
        }
    }
    non_empty_str(maths, "question", "maths")?;
    if maths.get("answer").and_then(Value::as_i64).is_none() {
        return Err(ValidationError::new("maths.answer", "must be an integer"));
    }
    Ok(())
}

fn validate_timeline(maths: &Map<String, Value>) -> Result<(), ValidationError> {
    let events = exact_list(maths, "events", EVENT_COUNT)?;
    let mut previous: Option<i64> = None;
    let mut sum = 0_i64;
    for (index, event) in events.iter().enumerate() {
        let path = format!("maths.events[{index}]");
        let event = event.as_object().ok_or_else(|| ValidationError::new(&path, "must be an object"))?;
        let year = event
            .get("year")
            .and_then(Value::as_i64)
            .ok_or_else(|| ValidationError::new(&path, "year must be an integer"))?;
        if !(MIN_EVENT_YEAR..=MAX_EVENT_YEAR).contains(&year) {
            return Err(ValidationError::new(
                &path,
                format!("year {year} outside {MIN_EVENT_YEAR}..={MAX_EVENT_YEAR}"),
            ));
        }
        if let Some(previous) = previous.filter(|previous| year <= *previous) {
            return Err(ValidationError::new(
                &path,
                format!("year {year} is not after {previous}; events must be in chronological order"),
            ));
        }
        non_empty_str(event, "text", &path)?;
        previous = Some(year);
        sum += year;
    }
    non_empty_str(maths, "question", "maths")?;
    match maths.get("total") {
        None | Some(Value::Null) => Ok(()),
        Some(total) => match total.as_i64() {
            Some(total) if total == sum => Ok(()),
            Some(total) => Err(ValidationError::new(
                "maths.total",
                format!("{total} does not equal the sum of event years ({sum})"),
            )),
            None => Err(ValidationError::new("maths.total", "must be an integer")),
        },
    }
}

fn exact_list<'a>(maths: &'a Map<String, Value>, key: &str, count: usize) -> Result<&'a Vec<Value>, ValidationError> {
    let path = format!("maths.{key}");
    let list = maths
        .get(key)
        .ok_or_else(|| ValidationError::new(&path, "required"))?
        .as_array()
        .ok_or_else(|| ValidationError::new(&path, "must be a list"))?;
    if list.len() != count {
        return Err(ValidationError::new(&path, format!("expected {count} entries, found {}", list.len())));
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::schema::tests::{chain_pack, fixture_time, timeline_pack};
    use crate::schema::{normalize, PackKind};

    fn normalize_err(value: Value) -> ValidationError {
        match normalize(value, fixture_time()) {
            Ok(pack) => panic!("expected validation error, got {:?}", pack.document()),
            Err(err) => err,
        }
    }

    #[test]
    fn chain_pack_normalizes() {
        let mut value = chain_pack();
        value["maths"]["answer"] = json!("42");
        let pack = normalize(value, fixture_time()).unwrap_or_else(|err| panic!("normalize: {err}"));
        assert_eq!(pack.kind(), PackKind::MathsChain);
        assert_eq!(pack.document()["maths"]["answer"], 42);
    }

    #[test]
    fn chain_cardinality_and_types_are_enforced() {
        let mut value = chain_pack();
        value["maths"]["clues"] = json!(["a", "b", "c", "d"]);
        assert_eq!(normalize_err(value).to_string(), "maths.clues: expected 5 entries, found 4");

        let mut value = chain_pack();
        value["maths"]["reveals"][2] = json!({"hint": "nope"});
        assert_eq!(normalize_err(value).path, "maths.reveals[2]");

        let mut value = chain_pack();
        value["maths"]["answer"] = json!(4.5);
        assert_eq!(normalize_err(value).path, "maths.answer");
    }

    // Test IDs: SCH-003
    #[test]
    fn timeline_out_of_order_is_a_chronology_error() {
        let err = normalize_err(timeline_pack([1990, 1985, 2000, 2005, 2010]));
        assert_eq!(err.path, "maths.events[1]");
        assert!(err.message.contains("chronological"), "unexpected message: {err}");
    }

    #[test]
    fn timeline_years_are_bounded_and_totals_checked() {
        assert_eq!(normalize_err(timeline_pack([0, 1985, 2000, 2005, 2010])).path, "maths.events[0]");
        assert_eq!(normalize_err(timeline_pack([1980, 1985, 2000, 2005, 2026])).path, "maths.events[4]");

        let mut value = timeline_pack([1980, 1985, 2000, 2005, 2010]);
        value["maths"]["total"] = json!(9980);
        let pack = normalize(value, fixture_time()).unwrap_or_else(|err| panic!("normalize: {err}"));
        assert_eq!(pack.kind(), PackKind::MathsTimeline);

        let mut value = timeline_pack([1980, 1985, 2000, 2005, 2010]);
        value["maths"]["total"] = json!(1);
        assert_eq!(normalize_err(value).path, "maths.total");
    }

    #[test]
    fn legacy_event_labels_become_text() {
        let mut value = timeline_pack([1980, 1985, 2000, 2005, 2010]);
        value["maths"]["events"][0] = json!({"year": "1980", "event": "Legacy event"});
        value["maths"]["events"][1] = json!({"year": 1985, "label": "Legacy label"});
        let pack = normalize(value, fixture_time()).unwrap_or_else(|err| panic!("normalize: {err}"));
        let events = &pack.document()["maths"]["events"];
        assert_eq!(events[0], json!({"year": 1980, "text": "Legacy event"}));
        assert_eq!(events[1], json!({"year": 1985, "text": "Legacy label"}));
    }

    #[test]
    fn maths_version_is_never_guessed() {
        let mut value = chain_pack();
        value["version"] = json!("jemima-maths-chain-1");
        assert_eq!(normalize_err(value).path, "version");

        let mut value = chain_pack();
        if let Some(object) = value.as_object_mut() {
            object.shift_remove("version");
        }
        assert_eq!(normalize_err(value).path, "version");
    }

    #[test]
    fn reveal_text_prefers_prompt_then_text_then_value() {
        assert_eq!(reveal_text(&json!("plain")), Some("plain"));
        assert_eq!(reveal_text(&json!({"value": "v", "text": "t"})), Some("t"));
        assert_eq!(reveal_text(&json!({"prompt": " ", "value": "v"})), Some("v"));
        assert_eq!(reveal_text(&json!({"prompt": 3})), None);
        assert_eq!(reveal_text(&json!("")), None);
    }
}
