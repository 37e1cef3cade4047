use serde::Serialize;
use serde_json::Value;

use super::types::{ChangeRecord, TransactionEnvelope};
use crate::error::ProtocolError;

/// One fully reassembled change, annotated with the metadata shared by the
/// whole transaction. Exactly one is produced per complete change object
/// seen on the wire, in arrival order.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationMessage {
    #[serde(flatten)]
    pub envelope: TransactionEnvelope,
    pub change: ChangeRecord,
    /// Whether the slot was opened with `include-not-null`, i.e. whether
    /// `columnoptionals` carries real data.
    pub contains_metadata: bool,
    pub last_in_transaction: bool,
}

impl ReplicationMessage {
    /// Builds a message from a change document parsed in floats-as-text mode.
    ///
    /// Rejects documents that do not deserialize into a [`ChangeRecord`] or
    /// whose column arrays are misaligned; nothing is ever emitted from
    /// malformed input.
    pub fn build(
        envelope: TransactionEnvelope,
        change: Value,
        contains_metadata: bool,
        last_in_transaction: bool,
    ) -> Result<Self, ProtocolError> {
        let change: ChangeRecord =
            serde_json::from_value(change).map_err(ProtocolError::MalformedDocument)?;
        change.check_column_alignment(contains_metadata)?;

        Ok(Self {
            envelope,
            change,
            contains_metadata,
            last_in_transaction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::types::ChangeKind;
    use chrono::Utc;
    use serde_json::json;

    fn envelope() -> TransactionEnvelope {
        TransactionEnvelope {
            xid: 563,
            commit_time: Utc::now(),
        }
    }

    #[test]
    fn builds_insert_message() {
        let change = json!({
            "kind": "insert",
            "schema": "public",
            "table": "t",
            "columnnames": ["pk"],
            "columntypes": ["integer"],
            "columnvalues": [1]
        });
        let message = ReplicationMessage::build(envelope(), change, false, true).unwrap();
        assert_eq!(message.change.kind, ChangeKind::Insert);
        assert_eq!(message.change.table, "t");
        assert!(message.last_in_transaction);
    }

    #[test]
    fn rejects_unknown_kind() {
        let change = json!({
            "kind": "truncate",
            "schema": "public",
            "table": "t"
        });
        match ReplicationMessage::build(envelope(), change, false, false) {
            Err(ProtocolError::MalformedDocument(_)) => {}
            other => panic!("expected malformed document, got {:?}", other),
        }
    }

    #[test]
    fn rejects_misaligned_columns() {
        let change = json!({
            "kind": "insert",
            "schema": "public",
            "table": "t",
            "columnnames": ["a", "b"],
            "columntypes": ["integer"],
            "columnvalues": [1, 2]
        });
        match ReplicationMessage::build(envelope(), change, false, false) {
            Err(ProtocolError::MalformedDocument(_)) => {}
            other => panic!("expected malformed document, got {:?}", other),
        }
    }
}
