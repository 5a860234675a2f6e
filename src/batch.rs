// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch coordinator for captured change records.
//!
//! Takes one batch from a capture engine, coalesces it per key (latest
//! wins), applies what is left through the [`EventPipeline`], and then
//! acknowledges every original record.
//!
//! # Design
//!
//! ```text
//! RawRecords ──▶ coalesce by key ──▶ JoinSet (bounded by Bulkhead) ──▶ pipeline.process()
//!  [k1 k1 k2 k1]  HashMap<key, idx>        one task per kept record
//!                 (latest wins)                      │
//!                                                    ▼
//!                           all Ok  → mark_processed(every record) → mark_batch_finished()
//!                           any Err → no acks, engine_failed(identifier)
//! ```
//!
//! Records sharing a key arrive in source commit order within a batch, so
//! the last one carries the final state. Keys are independent, so the kept
//! records are applied concurrently. Records without a key are never
//! coalesced.

use crate::capture::RecordCommitter;
use crate::coordinator::Notifier;
use crate::error::{Result, SyncError};
use crate::event::{Event, RawRecord, SourceTable};
use crate::identifier::Identifier;
use crate::metrics;
use crate::pipeline::{EventPipeline, Outcome};
use crate::resilience::Bulkhead;
use std::collections::HashMap;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Result of processing a batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchResult {
    /// Records received.
    pub total: usize,
    /// Records superseded by a later record with the same key.
    pub squashed: usize,
    /// Records that reached the backend.
    pub applied: usize,
    /// Records rejected by the filter stage.
    pub filtered: usize,
    /// Records dropped by the apply stage.
    pub skipped: usize,
}

/// Applies the batches of one engine.
pub struct BatchCoordinator {
    identifier: Identifier,
    pipeline: EventPipeline,
    bulkhead: Bulkhead,
    notifier: Notifier,
}

impl BatchCoordinator {
    pub fn new(
        identifier: Identifier,
        pipeline: EventPipeline,
        max_concurrent_applies: usize,
        notifier: Notifier,
    ) -> Self {
        Self {
            identifier,
            pipeline,
            bulkhead: Bulkhead::new(max_concurrent_applies),
            notifier,
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// Apply one batch, then acknowledge all of it.
    ///
    /// On failure nothing is acknowledged and the orchestrator is notified;
    /// the engine redelivers from its last acknowledged offset on restart.
    #[instrument(skip(self, records, committer), fields(identifier = %self.identifier, records = records.len()))]
    pub async fn handle_batch(
        &self,
        records: Vec<RawRecord>,
        committer: &dyn RecordCommitter,
    ) -> Result<BatchResult> {
        let start = Instant::now();
        match self.apply_and_ack(&records, committer).await {
            Ok(result) => {
                metrics::record_batch(
                    self.identifier.rule(),
                    result.total,
                    result.applied,
                    result.squashed,
                    result.filtered,
                    start.elapsed(),
                );
                if result.total > 0 {
                    info!(
                        total = result.total,
                        applied = result.applied,
                        squashed = result.squashed,
                        filtered = result.filtered,
                        skipped = result.skipped,
                        "Batch applied"
                    );
                }
                Ok(result)
            }
            Err(e) => {
                warn!(error = %e, "Batch aborted, nothing acknowledged");
                metrics::record_batch_failure(self.identifier.rule());
                self.notifier.engine_failed(
                    self.identifier.clone(),
                    SyncError::capture(&self.identifier, format!("batch application failed: {}", e)),
                );
                Err(e)
            }
        }
    }

    async fn apply_and_ack(
        &self,
        records: &[RawRecord],
        committer: &dyn RecordCommitter,
    ) -> Result<BatchResult> {
        let kept = coalesce(records);
        let mut result = BatchResult {
            total: records.len(),
            squashed: records.len() - kept.len(),
            ..Default::default()
        };
        if result.squashed > 0 {
            debug!(squashed = result.squashed, "Coalesced records sharing a key");
        }

        let mut join_set: JoinSet<Result<Outcome>> = JoinSet::new();
        for idx in kept {
            let event = Event::decode(&records[idx]);
            let pipeline = self.pipeline.clone();
            let bulkhead = self.bulkhead.clone();
            join_set.spawn(async move {
                let _permit = bulkhead.acquire().await?;
                pipeline.process(&event).await
            });
        }

        // Wait for every dispatch, keeping the first failure.
        let mut failure: Option<SyncError> = None;
        while let Some(joined) = join_set.join_next().await {
            let outcome = joined
                .map_err(|e| SyncError::Internal(format!("apply task failed: {}", e)))
                .and_then(|r| r);
            match outcome {
                Ok(Outcome::Applied) => result.applied += 1,
                Ok(Outcome::Filtered(_)) => result.filtered += 1,
                Ok(Outcome::Skipped(_)) => result.skipped += 1,
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        for record in records {
            committer.mark_processed(record).await?;
        }
        committer.mark_batch_finished().await?;
        Ok(result)
    }
}

/// Indices of the records to apply, in batch order: the last record of
/// each (source table, key) plus every keyless record.
fn coalesce(records: &[RawRecord]) -> Vec<usize> {
    let mut latest: HashMap<(Option<&SourceTable>, String), usize> =
        HashMap::with_capacity(records.len());
    let mut kept = Vec::new();
    for (idx, record) in records.iter().enumerate() {
        match record.dedup_key() {
            Some(key) => {
                latest.insert((record.source.as_ref(), key), idx);
            }
            None => kept.push(idx),
        }
    }
    kept.extend(latest.into_values());
    kept.sort_unstable();
    kept
}
