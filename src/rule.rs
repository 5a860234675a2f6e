// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Synchronization rules.
//!
//! A [`Rule`] maps one source table onto the target cache: which table to
//! follow, how to derive the cache key from a row, and which columns make up
//! the cached value. Rules are immutable once registered.
//!
//! # Key derivation
//!
//! ```text
//! row {id: 7, region: "eu", name: "x"}
//! key columns [region, id], separator "|"
//!
//!   KeyFormat::String  → "eu|7"
//!   KeyFormat::Json    → {"id":7,"region":"eu"}
//!   prefix_rule_name   → "customers|eu|7"
//! ```

use crate::error::{Result, SyncError};
use crate::event::SourceTable;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A decoded row image: column name → value.
pub type Row = Map<String, Value>;

/// Source table reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    /// Schema (or database) name. `None` matches any schema.
    #[serde(default)]
    pub schema: Option<String>,
    /// Table name.
    pub table: String,
}

impl TableRef {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            schema: None,
            table: table.into(),
        }
    }

    pub fn with_schema(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            table: table.into(),
        }
    }

    /// Whether a record's source metadata refers to this table.
    pub fn matches(&self, source: &SourceTable) -> bool {
        if self.table != source.table {
            return false;
        }
        match (&self.schema, &source.schema) {
            (None, _) => true,
            (Some(expected), Some(actual)) => expected == actual,
            (Some(_), None) => false,
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

/// How the key columns are rendered into a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFormat {
    /// Column values joined with the separator.
    #[default]
    String,
    /// JSON object of the key columns.
    Json,
}

/// Key projection of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyProjection {
    /// Columns forming the key, in order.
    pub columns: Vec<String>,
    #[serde(default)]
    pub format: KeyFormat,
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Prefix every key with the rule name (keeps rules sharing a member apart).
    #[serde(default)]
    pub prefix_rule_name: bool,
}

fn default_separator() -> String {
    "|".to_string()
}

impl KeyProjection {
    pub fn columns(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            format: KeyFormat::String,
            separator: default_separator(),
            prefix_rule_name: false,
        }
    }
}

/// Value projection of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValueProjection {
    /// Columns to keep. `None` keeps the whole row.
    #[serde(default)]
    pub columns: Option<Vec<String>>,
}

/// A named mapping from one source table to the target cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub table: TableRef,
    pub key: KeyProjection,
    #[serde(default)]
    pub value: ValueProjection,
}

impl Rule {
    /// Rule over `table` keyed by `key_columns`, caching whole rows.
    pub fn new(name: impl Into<String>, table: TableRef, key_columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            table,
            key: KeyProjection::columns(key_columns),
            value: ValueProjection::default(),
        }
    }

    /// Check the definition is usable.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SyncError::Config("rule name is empty".into()));
        }
        if self.table.table.trim().is_empty() {
            return Err(SyncError::Config(format!("rule '{}' has no table", self.name)));
        }
        if self.key.columns.is_empty() {
            return Err(SyncError::Config(format!(
                "rule '{}' has no key columns",
                self.name
            )));
        }
        if matches!(&self.value.columns, Some(cols) if cols.is_empty()) {
            return Err(SyncError::Config(format!(
                "rule '{}' projects an empty value",
                self.name
            )));
        }
        Ok(())
    }

    /// Derive the cache key from a row image.
    ///
    /// Returns `None` if any key column is missing from the row.
    pub fn key_for(&self, row: &Row) -> Option<String> {
        let key = match self.key.format {
            KeyFormat::String => {
                let mut parts = Vec::with_capacity(self.key.columns.len());
                for column in &self.key.columns {
                    parts.push(render_scalar(row.get(column)?));
                }
                parts.join(&self.key.separator)
            }
            KeyFormat::Json => {
                let mut object = Map::new();
                for column in &self.key.columns {
                    object.insert(column.clone(), row.get(column)?.clone());
                }
                Value::Object(object).to_string()
            }
        };

        if self.key.prefix_rule_name {
            Some(format!("{}{}{}", self.name, self.key.separator, key))
        } else {
            Some(key)
        }
    }

    /// Render the cached value for a row image.
    pub fn value_for(&self, row: &Row) -> String {
        match &self.value.columns {
            None => Value::Object(row.clone()).to_string(),
            Some(columns) => {
                let projected: Row = columns
                    .iter()
                    .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                    .collect();
                Value::Object(projected).to_string()
            }
        }
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
