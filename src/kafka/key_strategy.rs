use crate::postgres::{ChangeKind, ReplicationMessage};
use serde_json::Value;
use tracing::debug;

/// How the Kafka partition key is derived from a change.
///
/// Column lookups are positional: a named column is resolved through
/// `columnnames` into the aligned `columnvalues` slot. Deletes carry no
/// column arrays, so named strategies fall back to the replica-identity
/// columns in `oldkeys`.
#[derive(Debug, Clone, Default)]
pub enum KeyStrategy {
    /// `schema.table`; keeps a table's changes on one partition.
    #[default]
    TableName,
    /// One or more column values joined with `:`.
    Columns(Vec<String>),
}

impl KeyStrategy {
    pub fn extract_key(&self, message: &ReplicationMessage) -> Option<String> {
        match self {
            KeyStrategy::TableName => Some(format!(
                "{}.{}",
                message.change.schema, message.change.table
            )),

            KeyStrategy::Columns(columns) => {
                let mut key_parts = Vec::with_capacity(columns.len());
                for column in columns {
                    match lookup_column(message, column) {
                        Some(value) => key_parts.push(value),
                        None => {
                            debug!("Missing column '{}' for key extraction", column);
                            return None;
                        }
                    }
                }
                Some(key_parts.join(":"))
            }
        }
    }
}

fn lookup_column(message: &ReplicationMessage, column: &str) -> Option<String> {
    let change = &message.change;

    let positional = change
        .column_names
        .iter()
        .position(|name| name == column)
        .and_then(|index| change.column_values.get(index));

    let value = match (positional, change.kind) {
        (Some(value), _) => Some(value),
        (None, ChangeKind::Delete) | (None, ChangeKind::Update) => {
            let oldkeys = change.oldkeys.as_ref()?;
            oldkeys
                .keynames
                .iter()
                .position(|name| name == column)
                .and_then(|index| oldkeys.keyvalues.get(index))
        }
        (None, _) => None,
    }?;

    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::{ChangeRecord, OldKeys, TransactionEnvelope};
    use chrono::Utc;
    use serde_json::json;

    fn message(kind: ChangeKind, change: ChangeRecord) -> ReplicationMessage {
        let mut change = change;
        change.kind = kind;
        ReplicationMessage {
            envelope: TransactionEnvelope {
                xid: 1,
                commit_time: Utc::now(),
            },
            change,
            contains_metadata: false,
            last_in_transaction: true,
        }
    }

    fn insert_change() -> ChangeRecord {
        ChangeRecord {
            kind: ChangeKind::Insert,
            schema: "public".to_string(),
            table: "users".to_string(),
            column_names: vec!["id".to_string(), "name".to_string()],
            column_types: vec!["integer".to_string(), "text".to_string()],
            column_optionals: vec![],
            column_values: vec![json!(123), json!("John Doe")],
            oldkeys: None,
        }
    }

    #[test]
    fn default_strategy_keys_by_table() {
        let message = message(ChangeKind::Insert, insert_change());
        assert_eq!(
            KeyStrategy::default().extract_key(&message),
            Some("public.users".to_string())
        );
    }

    #[test]
    fn table_name_strategy() {
        let message = message(ChangeKind::Insert, insert_change());
        assert_eq!(
            KeyStrategy::TableName.extract_key(&message),
            Some("public.users".to_string())
        );
    }

    #[test]
    fn single_column_strategy() {
        let message = message(ChangeKind::Insert, insert_change());
        let strategy = KeyStrategy::Columns(vec!["id".to_string()]);
        assert_eq!(strategy.extract_key(&message), Some("123".to_string()));
    }

    #[test]
    fn composite_column_strategy() {
        let message = message(ChangeKind::Insert, insert_change());
        let strategy = KeyStrategy::Columns(vec!["id".to_string(), "name".to_string()]);
        assert_eq!(
            strategy.extract_key(&message),
            Some("123:John Doe".to_string())
        );
    }

    #[test]
    fn delete_falls_back_to_oldkeys() {
        let change = ChangeRecord {
            kind: ChangeKind::Delete,
            schema: "public".to_string(),
            table: "users".to_string(),
            column_names: vec![],
            column_types: vec![],
            column_optionals: vec![],
            column_values: vec![],
            oldkeys: Some(OldKeys {
                keynames: vec!["id".to_string()],
                keytypes: vec!["integer".to_string()],
                keyvalues: vec![json!(999)],
            }),
        };
        let message = message(ChangeKind::Delete, change);
        let strategy = KeyStrategy::Columns(vec!["id".to_string()]);
        assert_eq!(strategy.extract_key(&message), Some("999".to_string()));
    }

    #[test]
    fn missing_column_yields_no_key() {
        let message = message(ChangeKind::Insert, insert_change());
        let strategy = KeyStrategy::Columns(vec!["absent".to_string()]);
        assert_eq!(strategy.extract_key(&message), None);
    }
}
