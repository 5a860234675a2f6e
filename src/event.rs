// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change records and decoded events.
//!
//! The capture engine hands over [`RawRecord`]s: one row-level change each,
//! in source commit order. Each one is decoded into an [`Event`] that lives
//! for exactly one pass through the pipeline and is never persisted.
//!
//! # Operation codes
//!
//! | Code | Operation |
//! |------|-----------|
//! | `c`, `create` | [`Operation::Create`] |
//! | `r`, `read`, `snapshot` | [`Operation::Snapshot`] |
//! | `u`, `update` | [`Operation::Update`] |
//! | `d`, `delete` | [`Operation::Delete`] |
//! | anything else | [`Operation::Other`] (dropped by the pipeline) |

use crate::error::{Result, SyncError};
use crate::rule::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Source metadata of a change record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceTable {
    #[serde(default)]
    pub schema: Option<String>,
    pub table: String,
}

impl SourceTable {
    pub fn new(schema: Option<&str>, table: &str) -> Self {
        Self {
            schema: schema.map(str::to_string),
            table: table.to_string(),
        }
    }
}

/// Decoded operation of a change record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Create,
    Snapshot,
    Update,
    Delete,
    /// Unrecognized operation code.
    Other(String),
}

impl Operation {
    pub fn parse(code: &str) -> Self {
        match code.to_ascii_lowercase().as_str() {
            "c" | "create" => Operation::Create,
            "r" | "read" | "snapshot" => Operation::Snapshot,
            "u" | "update" => Operation::Update,
            "d" | "delete" => Operation::Delete,
            _ => Operation::Other(code.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Operation::Create => "create",
            Operation::Snapshot => "snapshot",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Other(code) => code,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw change record as produced by the capture engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Source primary key. Absent on schema-change records.
    #[serde(default)]
    pub key: Option<Value>,
    /// Row image before the change.
    #[serde(default)]
    pub before: Option<Row>,
    /// Row image after the change.
    #[serde(default)]
    pub after: Option<Row>,
    #[serde(default)]
    pub source: Option<SourceTable>,
    /// Operation code (`c`, `r`, `u`, `d`, ...).
    #[serde(default)]
    pub op: String,
    /// Set on DDL / schema-change records.
    #[serde(default)]
    pub schema_change: bool,
}

impl RawRecord {
    /// Parse a JSON-encoded record.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| SyncError::Decode(e.to_string()))
    }

    /// Key used to coalesce records within a batch, if the record has one.
    pub fn dedup_key(&self) -> Option<String> {
        self.key.as_ref().map(Value::to_string)
    }
}

/// A decoded change event, consumed once by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub key: Option<String>,
    pub before: Option<Row>,
    pub after: Option<Row>,
    pub source: Option<SourceTable>,
    pub operation: Operation,
    pub schema_change: bool,
}

impl Event {
    pub fn decode(record: &RawRecord) -> Self {
        Self {
            key: record.dedup_key(),
            before: record.before.clone(),
            after: record.after.clone(),
            source: record.source.clone(),
            operation: Operation::parse(&record.op),
            schema_change: record.schema_change,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_parse() {
        assert_eq!(Operation::parse("c"), Operation::Create);
        assert_eq!(Operation::parse("CREATE"), Operation::Create);
        assert_eq!(Operation::parse("r"), Operation::Snapshot);
        assert_eq!(Operation::parse("read"), Operation::Snapshot);
        assert_eq!(Operation::parse("u"), Operation::Update);
        assert_eq!(Operation::parse("d"), Operation::Delete);
        assert_eq!(Operation::parse("t"), Operation::Other("t".into()));
        assert_eq!(Operation::parse(""), Operation::Other(String::new()));
    }

    #[test]
    fn test_record_from_json() {
        let bytes = br#"{
            "key": {"id": 1},
            "after": {"id": 1, "name": "x"},
            "source": {"schema": "public", "table": "customer"},
            "op": "c"
        }"#;
        let record = RawRecord::from_json(bytes).unwrap();
        assert_eq!(record.dedup_key().as_deref(), Some(r#"{"id":1}"#));
        assert!(!record.schema_change);
        assert!(record.before.is_none());

        let event = Event::decode(&record);
        assert_eq!(event.operation, Operation::Create);
        assert_eq!(event.source, Some(SourceTable::new(Some("public"), "customer")));
        assert_eq!(event.after.unwrap().get("name"), Some(&json!("x")));
    }

    #[test]
    fn test_record_from_invalid_json() {
        let err = RawRecord::from_json(b"{not json").unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }

    #[test]
    fn test_schema_change_has_no_key() {
        let record = RawRecord {
            schema_change: true,
            ..Default::default()
        };
        assert_eq!(record.dedup_key(), None);
        assert!(Event::decode(&record).schema_change);
    }
}
