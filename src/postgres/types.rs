use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Timestamp layout emitted by wal2json with `include-timestamp`, e.g.
/// `2018-03-20 10:58:43.396355+01`. The zone offset may omit minutes.
const COMMIT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%#z";

/// The outer wal2json object wrapping one transaction's change list.
///
/// Valid only while the decoder is inside a transaction; created once per
/// transaction and discarded when the closing bracket arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEnvelope {
    pub xid: i64,
    pub commit_time: DateTime<Utc>,
}

impl TransactionEnvelope {
    /// Extracts `xid` and `timestamp` from a parsed transaction header.
    pub fn from_document(doc: &Value) -> Result<Self, ProtocolError> {
        let xid = doc
            .get("xid")
            .and_then(Value::as_i64)
            .ok_or(ProtocolError::MissingEnvelopeField { field: "xid" })?;
        let timestamp = doc
            .get("timestamp")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingEnvelopeField { field: "timestamp" })?;
        let commit_time = DateTime::parse_from_str(timestamp, COMMIT_TIMESTAMP_FORMAT)
            .map_err(|_| ProtocolError::MissingEnvelopeField { field: "timestamp" })?
            .with_timezone(&Utc);

        Ok(Self { xid, commit_time })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level change as emitted by wal2json.
///
/// The four column arrays are positionally aligned. `columnoptionals` is only
/// present when the slot was opened with `include-not-null`, so it may be
/// empty when metadata mode is off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    #[serde(rename = "columnnames", default)]
    pub column_names: Vec<String>,
    #[serde(rename = "columntypes", default)]
    pub column_types: Vec<String>,
    #[serde(rename = "columnoptionals", default)]
    pub column_optionals: Vec<bool>,
    #[serde(rename = "columnvalues", default)]
    pub column_values: Vec<Value>,
    /// Replica-identity columns, present on update/delete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldkeys: Option<OldKeys>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OldKeys {
    #[serde(default)]
    pub keynames: Vec<String>,
    #[serde(default)]
    pub keytypes: Vec<String>,
    #[serde(default)]
    pub keyvalues: Vec<Value>,
}

impl ChangeRecord {
    /// Verifies the positional-alignment invariant.
    ///
    /// `columnnames`, `columntypes` and `columnvalues` must always agree in
    /// length; `columnoptionals` must agree too when metadata mode is on.
    pub fn check_column_alignment(&self, contains_metadata: bool) -> Result<(), ProtocolError> {
        use serde::de::Error as _;

        let n = self.column_names.len();
        if self.column_types.len() != n || self.column_values.len() != n {
            return Err(ProtocolError::MalformedDocument(serde_json::Error::custom(
                format!(
                    "column arrays are misaligned: {} names, {} types, {} values",
                    n,
                    self.column_types.len(),
                    self.column_values.len()
                ),
            )));
        }
        if self.column_optionals.len() != n
            && (contains_metadata || !self.column_optionals.is_empty())
        {
            return Err(ProtocolError::MalformedDocument(serde_json::Error::custom(
                format!(
                    "column arrays are misaligned: {} names, {} optionals",
                    n,
                    self.column_optionals.len()
                ),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_envelope_with_short_zone_offset() {
        let doc = json!({"xid": 563, "timestamp": "2018-03-20 10:58:43.396355+01"});
        let envelope = TransactionEnvelope::from_document(&doc).unwrap();
        assert_eq!(envelope.xid, 563);
        assert_eq!(
            envelope.commit_time.to_rfc3339(),
            "2018-03-20T09:58:43.396355+00:00"
        );
    }

    #[test]
    fn rejects_envelope_without_xid() {
        let doc = json!({"timestamp": "2018-03-20 10:58:43.396355+01"});
        match TransactionEnvelope::from_document(&doc) {
            Err(ProtocolError::MissingEnvelopeField { field }) => assert_eq!(field, "xid"),
            other => panic!("expected missing xid, got {:?}", other),
        }
    }

    #[test]
    fn rejects_envelope_with_non_string_timestamp() {
        let doc = json!({"xid": 1, "timestamp": 42});
        match TransactionEnvelope::from_document(&doc) {
            Err(ProtocolError::MissingEnvelopeField { field }) => assert_eq!(field, "timestamp"),
            other => panic!("expected missing timestamp, got {:?}", other),
        }
    }

    #[test]
    fn alignment_allows_absent_optionals_without_metadata() {
        let record = ChangeRecord {
            kind: ChangeKind::Insert,
            schema: "public".to_string(),
            table: "t".to_string(),
            column_names: vec!["a".to_string(), "b".to_string()],
            column_types: vec!["integer".to_string(), "text".to_string()],
            column_optionals: vec![],
            column_values: vec![json!(1), json!("x")],
            oldkeys: None,
        };
        assert!(record.check_column_alignment(false).is_ok());
        assert!(record.check_column_alignment(true).is_err());
    }

    #[test]
    fn alignment_rejects_short_value_array() {
        let record = ChangeRecord {
            kind: ChangeKind::Delete,
            schema: "public".to_string(),
            table: "t".to_string(),
            column_names: vec!["a".to_string(), "b".to_string()],
            column_types: vec!["integer".to_string(), "text".to_string()],
            column_optionals: vec![],
            column_values: vec![json!(1)],
            oldkeys: None,
        };
        assert!(record.check_column_alignment(false).is_err());
    }
}
