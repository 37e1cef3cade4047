//! JSON document reading with two numeric modes.
//!
//! wal2json transports column values of unbounded-precision numeric types
//! (`numeric`, `decimal`) as plain JSON numbers. Reading those through a
//! binary float would silently destroy precision (`10.1111` is not
//! representable in an f64 without rounding), so the decoder parses change
//! documents in [`NumberMode::FloatsAsText`]: every non-integer number is
//! rewritten into a JSON string holding its exact source text. Transaction
//! headers carry only integers and strings and are read in
//! [`NumberMode::Native`].
//!
//! Exact text is available because serde_json is built with the
//! `arbitrary_precision` feature, which stores the unparsed digits.

use serde_json::Value;

use crate::error::ProtocolError;

/// How numeric literals in a document are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberMode {
    /// Numbers stay JSON numbers.
    Native,
    /// Integers stay numbers; everything else becomes its exact source text.
    FloatsAsText,
}

/// Parses `content` as a single JSON object.
pub fn read(content: &[u8], mode: NumberMode) -> Result<Value, ProtocolError> {
    let value: Value = serde_json::from_slice(content).map_err(ProtocolError::MalformedDocument)?;
    Ok(match mode {
        NumberMode::Native => value,
        NumberMode::FloatsAsText => floats_to_text(value),
    })
}

fn floats_to_text(value: Value) -> Value {
    match value {
        Value::Number(n) if !n.is_i64() && !n.is_u64() => Value::String(n.to_string()),
        Value::Array(items) => Value::Array(items.into_iter().map(floats_to_text).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| (key, floats_to_text(item)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn native_mode_keeps_numbers() {
        let doc = read(br#"{"xid": 563, "n": 10.5}"#, NumberMode::Native).unwrap();
        assert_eq!(doc["xid"].as_i64(), Some(563));
        assert!(doc["n"].is_number());
    }

    #[test]
    fn floats_as_text_preserves_exact_decimal_text() {
        let doc = read(
            br#"{"values": [1, 10.1111, 22.2200, null, "s"]}"#,
            NumberMode::FloatsAsText,
        )
        .unwrap();
        let values = doc["values"].as_array().unwrap();
        assert_eq!(values[0].as_i64(), Some(1));
        assert_eq!(values[1], json!("10.1111"));
        // Trailing zeros survive; an f64 round-trip would drop them.
        assert_eq!(values[2], json!("22.2200"));
        assert!(values[3].is_null());
        assert_eq!(values[4], json!("s"));
    }

    #[test]
    fn floats_as_text_recurses_into_objects() {
        let doc = read(br#"{"a": {"b": [3.30]}}"#, NumberMode::FloatsAsText).unwrap();
        assert_eq!(doc["a"]["b"][0], json!("3.30"));
    }

    #[test]
    fn invalid_json_is_malformed_document() {
        match read(b"{\"xid\": ", NumberMode::Native) {
            Err(ProtocolError::MalformedDocument(_)) => {}
            other => panic!("expected malformed document, got {:?}", other),
        }
    }
}
