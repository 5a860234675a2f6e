//! Shared test utilities for orchestrator, property and container tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - Mock capture engines that deliver batches on demand
//! - Change record helpers

#![allow(dead_code)]

pub mod containers;
pub mod mock_capture;

pub use containers::*;
pub use mock_capture::*;

use cdc_cache_sync::{RawRecord, SourceTable};
use serde_json::{json, Value};

/// Table every test rule captures.
pub const TABLE: &str = "customer";

fn row(value: Value) -> Option<serde_json::Map<String, Value>> {
    value.as_object().cloned()
}

/// `create` of `{id, name}` on the test table.
pub fn create(id: i64, name: &str) -> RawRecord {
    RawRecord {
        key: Some(json!({ "id": id })),
        after: row(json!({ "id": id, "name": name })),
        source: Some(SourceTable::new(None, TABLE)),
        op: "c".into(),
        ..Default::default()
    }
}

/// `update` of `{id, name}` on the test table.
pub fn update(id: i64, name: &str) -> RawRecord {
    RawRecord {
        op: "u".into(),
        ..create(id, name)
    }
}

/// `delete` of `{id, name}` on the test table.
pub fn delete(id: i64, name: &str) -> RawRecord {
    RawRecord {
        key: Some(json!({ "id": id })),
        before: row(json!({ "id": id, "name": name })),
        source: Some(SourceTable::new(None, TABLE)),
        op: "d".into(),
        ..Default::default()
    }
}

/// Let spawned tasks run without advancing paused time.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
