//! Canonical byte encoding for pack documents.
//!
//! Compact JSON (`,` and `:` separators, no whitespace), object keys in
//! insertion order, non-ASCII characters emitted verbatim as UTF-8. Only
//! `"`, `\` and control characters are escaped. Integrity checksums are
//! computed over these bytes, so the output must stay stable for a given
//! in-memory document.

use serde_json::{Map, Value};

/// Encode a JSON value canonically.
#[must_use]
pub fn to_canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_value(&mut out, value);
    out.into_bytes()
}

/// Encode an object canonically, leaving out the top-level `skip_key`.
///
/// Equivalent to removing the key and encoding, without disturbing the
/// order of the remaining keys.
#[must_use]
pub fn to_canonical_bytes_without(object: &Map<String, Value>, skip_key: &str) -> Vec<u8> {
    let mut out = String::new();
    write_object(&mut out, object.iter().filter(|(key, _)| key.as_str() != skip_key));
    out.into_bytes()
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(number) => out.push_str(&number.to_string()),
        Value::String(text) => write_string(out, text),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(object) => write_object(out, object.iter()),
    }
}

fn write_object<'a>(out: &mut String, entries: impl Iterator<Item = (&'a String, &'a Value)>) {
    out.push('{');
    for (index, (key, value)) in entries.enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_string(out, key);
        out.push(':');
        write_value(out, value);
    }
    out.push('}');
}

fn write_string(out: &mut String, text: &str) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            ch if u32::from(ch) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", u32::from(ch)));
            }
            ch => out.push(ch),
        }
    }
    out.push('"');
}
