// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-event processing: filter, then apply.
//!
//! ```text
//! Event ──▶ filter ──rejected──▶ Filtered
//!             │
//!             ▼
//!           apply ──create/snapshot/update──▶ put(key(after), value(after))
//!                 ──delete──────────────────▶ remove(key(before))
//!                 ──other───────────────────▶ Skipped
//! ```
//!
//! Each applied event is exactly one `put` or one `remove` on the backend.

use crate::error::Result;
use crate::event::{Event, Operation};
use crate::multiplexer::Backend;
use crate::rule::Rule;
use crate::store::CacheStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why the filter rejected an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    SchemaChange,
    MissingSource,
    OtherTable,
}

/// Why the apply stage dropped an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnknownOperation,
    MissingImage,
    MissingKey,
}

/// Result of running one event through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Filtered(FilterReason),
    Skipped(SkipReason),
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied)
    }
}

/// Filter + apply chain of one rule against one backend.
#[derive(Clone)]
pub struct EventPipeline {
    rule: Arc<Rule>,
    store: Arc<dyn CacheStore>,
}

impl EventPipeline {
    pub fn new(rule: Arc<Rule>, store: Arc<dyn CacheStore>) -> Self {
        Self { rule, store }
    }

    pub fn for_backend(backend: &Backend) -> Self {
        Self::new(Arc::clone(backend.rule()), backend.store())
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// Filter, then apply. Errors only come from the backend.
    pub async fn process(&self, event: &Event) -> Result<Outcome> {
        if let Some(reason) = self.filter(event) {
            debug!(rule = %self.rule.name, ?reason, "Event filtered");
            return Ok(Outcome::Filtered(reason));
        }
        self.apply(event).await
    }

    /// `Some(reason)` if the event must not reach the backend.
    pub fn filter(&self, event: &Event) -> Option<FilterReason> {
        if event.schema_change {
            return Some(FilterReason::SchemaChange);
        }
        match &event.source {
            None => Some(FilterReason::MissingSource),
            Some(source) if !self.rule.table.matches(source) => Some(FilterReason::OtherTable),
            Some(_) => None,
        }
    }

    async fn apply(&self, event: &Event) -> Result<Outcome> {
        match &event.operation {
            Operation::Create | Operation::Snapshot | Operation::Update => {
                let Some(after) = &event.after else {
                    return Ok(self.skip(event, SkipReason::MissingImage));
                };
                let Some(key) = self.rule.key_for(after) else {
                    return Ok(self.skip(event, SkipReason::MissingKey));
                };
                self.store.put(key, self.rule.value_for(after)).await?;
                Ok(Outcome::Applied)
            }
            Operation::Delete => {
                let Some(before) = &event.before else {
                    return Ok(self.skip(event, SkipReason::MissingImage));
                };
                let Some(key) = self.rule.key_for(before) else {
                    return Ok(self.skip(event, SkipReason::MissingKey));
                };
                self.store.remove(key).await?;
                Ok(Outcome::Applied)
            }
            Operation::Other(_) => Ok(self.skip(event, SkipReason::UnknownOperation)),
        }
    }

    fn skip(&self, event: &Event, reason: SkipReason) -> Outcome {
        warn!(
            rule = %self.rule.name,
            operation = %event.operation,
            key = ?event.key,
            ?reason,
            "Change record dropped"
        );
        Outcome::Skipped(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{RawRecord, SourceTable};
    use crate::identifier::Endpoint;
    use crate::memory::{MemoryStore, StoreOp};
    use crate::rule::{Row, TableRef};
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn setup() -> (EventPipeline, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(Endpoint::new("mem://a")));
        let rule = Rule::new("r1", TableRef::with_schema("public", "customer"), &["id"]);
        (EventPipeline::new(Arc::new(rule), store.clone()), store)
    }

    fn event(op: &str, before: Option<Row>, after: Option<Row>) -> Event {
        Event::decode(&RawRecord {
            key: Some(json!({"id": 1})),
            before,
            after,
            source: Some(SourceTable::new(Some("public"), "customer")),
            op: op.into(),
            schema_change: false,
        })
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let (pipeline, store) = setup();

        let created = event("c", None, Some(row(json!({"id": 1, "name": "x"}))));
        assert!(pipeline.process(&created).await.unwrap().is_applied());

        let updated = event("u", None, Some(row(json!({"id": 1, "name": "y"}))));
        assert!(pipeline.process(&updated).await.unwrap().is_applied());

        let deleted = event("d", Some(row(json!({"id": 1, "name": "y"}))), None);
        assert!(pipeline.process(&deleted).await.unwrap().is_applied());

        let ops = store.ops();
        assert_eq!(ops.len(), 3);
        match &ops[0] {
            StoreOp::Put { key, value } => {
                assert_eq!(key, "1");
                let v: serde_json::Value = serde_json::from_str(value).unwrap();
                assert_eq!(v, json!({"id": 1, "name": "x"}));
            }
            other => panic!("expected put, got {:?}", other),
        }
        match &ops[1] {
            StoreOp::Put { value, .. } => assert!(value.contains("\"y\"")),
            other => panic!("expected put, got {:?}", other),
        }
        assert_eq!(ops[2], StoreOp::Remove { key: "1".into() });
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_upserts() {
        let (pipeline, store) = setup();
        let snap = event("r", None, Some(row(json!({"id": 1}))));
        assert_eq!(pipeline.process(&snap).await.unwrap(), Outcome::Applied);
        assert_eq!(store.get("1").as_deref(), Some(r#"{"id":1}"#));
    }

    #[tokio::test]
    async fn test_filter_rejects_before_backend() {
        let (pipeline, store) = setup();
        let after = Some(row(json!({"id": 1})));

        let mut schema = event("c", None, after.clone());
        schema.schema_change = true;
        assert_eq!(
            pipeline.process(&schema).await.unwrap(),
            Outcome::Filtered(FilterReason::SchemaChange)
        );

        let mut no_source = event("c", None, after.clone());
        no_source.source = None;
        assert_eq!(
            pipeline.process(&no_source).await.unwrap(),
            Outcome::Filtered(FilterReason::MissingSource)
        );

        let mut other_table = event("c", None, after.clone());
        other_table.source = Some(SourceTable::new(Some("public"), "orders"));
        assert_eq!(
            pipeline.process(&other_table).await.unwrap(),
            Outcome::Filtered(FilterReason::OtherTable)
        );

        let mut other_schema = event("c", None, after);
        other_schema.source = Some(SourceTable::new(Some("audit"), "customer"));
        assert_eq!(
            pipeline.process(&other_schema).await.unwrap(),
            Outcome::Filtered(FilterReason::OtherTable)
        );

        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_operation_skipped() {
        let (pipeline, store) = setup();
        let truncate = event("t", None, Some(row(json!({"id": 1}))));
        assert_eq!(
            pipeline.process(&truncate).await.unwrap(),
            Outcome::Skipped(SkipReason::UnknownOperation)
        );
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_missing_image_or_key_skipped() {
        let (pipeline, store) = setup();

        let no_after = event("c", None, None);
        assert_eq!(
            pipeline.process(&no_after).await.unwrap(),
            Outcome::Skipped(SkipReason::MissingImage)
        );

        let no_key = event("u", None, Some(row(json!({"name": "x"}))));
        assert_eq!(
            pipeline.process(&no_key).await.unwrap(),
            Outcome::Skipped(SkipReason::MissingKey)
        );

        let no_before = event("d", None, Some(row(json!({"id": 1}))));
        assert_eq!(
            pipeline.process(&no_before).await.unwrap(),
            Outcome::Skipped(SkipReason::MissingImage)
        );
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_backend_error_propagates() {
        let (pipeline, store) = setup();
        store.set_fail_writes(true);
        let created = event("c", None, Some(row(json!({"id": 1}))));
        assert!(pipeline.process(&created).await.is_err());
    }
}
