// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Capture engine integration traits.
//!
//! The capture engine tails a source's change log and is external to this
//! crate. It is created per [`Identifier`] by a [`CaptureEngineFactory`] and
//! started with a [`CaptureSession`] carrying everything it needs:
//!
//! ```text
//! CaptureSession
//! ├── persistence      offset store + schema history (on the member)
//! ├── batches          BatchCoordinator to hand each batch to
//! └── notifier         failed(error) → orchestrator
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use cdc_cache_sync::capture::{CaptureEngine, CaptureSession};
//! use cdc_cache_sync::store::BoxFuture;
//!
//! struct MyEngine;
//!
//! impl CaptureEngine for MyEngine {
//!     fn start(&self, session: CaptureSession) -> BoxFuture<'_, ()> {
//!         Box::pin(async move {
//!             // spawn the log reader; on each batch:
//!             //   session.deliver(records, &committer).await
//!             let _ = session;
//!             Ok(())
//!         })
//!     }
//!
//!     fn stop(&self) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//! }
//! ```

use crate::batch::{BatchCoordinator, BatchResult};
use crate::coordinator::Notifier;
use crate::error::{Result, SyncError};
use crate::event::RawRecord;
use crate::identifier::Identifier;
use crate::rule::{Rule, TableRef};
use crate::store::{BoxFuture, EnginePersistence};
use std::sync::{Arc, Mutex};

/// One capture engine instance.
///
/// `start()` returns once the engine is running; batches are then delivered
/// from the engine's own task through [`CaptureSession::deliver()`].
pub trait CaptureEngine: Send + Sync {
    fn start(&self, session: CaptureSession) -> BoxFuture<'_, ()>;
    fn stop(&self) -> BoxFuture<'_, ()>;
}

/// Creates one capture engine per identifier.
pub trait CaptureEngineFactory: Send + Sync {
    fn create(&self, identifier: &Identifier, rule: &Rule) -> Result<Arc<dyn CaptureEngine>>;
}

/// Acknowledges raw records so the engine can advance its replay offset.
pub trait RecordCommitter: Send + Sync {
    fn mark_processed(&self, record: &RawRecord) -> BoxFuture<'_, ()>;
    /// Called once after every record of a batch has been acknowledged.
    fn mark_batch_finished(&self) -> BoxFuture<'_, ()>;
}

/// Everything a started engine needs.
#[derive(Clone)]
pub struct CaptureSession {
    pub identifier: Identifier,
    /// Table to capture.
    pub table: TableRef,
    pub persistence: EnginePersistence,
    pub batches: Arc<BatchCoordinator>,
    notifier: Notifier,
}

impl CaptureSession {
    pub fn new(
        identifier: Identifier,
        table: TableRef,
        persistence: EnginePersistence,
        batches: Arc<BatchCoordinator>,
        notifier: Notifier,
    ) -> Self {
        Self {
            identifier,
            table,
            persistence,
            batches,
            notifier,
        }
    }

    /// Apply one batch. On error nothing further is acknowledged and the
    /// orchestrator has already been told the engine failed.
    pub async fn deliver(
        &self,
        records: Vec<RawRecord>,
        committer: &dyn RecordCommitter,
    ) -> Result<BatchResult> {
        self.batches.handle_batch(records, committer).await
    }

    /// Report that the engine itself failed.
    pub fn failed(&self, error: SyncError) {
        self.notifier.engine_failed(self.identifier.clone(), error);
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("identifier", &self.identifier)
            .field("table", &self.table)
            .finish()
    }
}

/// Committer that keeps acknowledged records in memory.
///
/// Useful for engines that flush offsets themselves, and for tests.
#[derive(Debug, Default)]
pub struct CollectingCommitter {
    processed: Mutex<Vec<RawRecord>>,
    batches_finished: Mutex<usize>,
}

impl CollectingCommitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledged records in acknowledgement order.
    pub fn processed(&self) -> Vec<RawRecord> {
        self.processed
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn batches_finished(&self) -> usize {
        self.batches_finished.lock().map(|n| *n).unwrap_or_default()
    }
}

impl RecordCommitter for CollectingCommitter {
    fn mark_processed(&self, record: &RawRecord) -> BoxFuture<'_, ()> {
        let record = record.clone();
        Box::pin(async move {
            self.processed
                .lock()
                .map_err(|_| SyncError::Internal("committer lock poisoned".into()))?
                .push(record);
            Ok(())
        })
    }

    fn mark_batch_finished(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            *self
                .batches_finished
                .lock()
                .map_err(|_| SyncError::Internal("committer lock poisoned".into()))? += 1;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collecting_committer() {
        let committer = CollectingCommitter::new();
        let record = RawRecord {
            op: "c".into(),
            ..Default::default()
        };
        committer.mark_processed(&record).await.unwrap();
        committer.mark_processed(&record).await.unwrap();
        committer.mark_batch_finished().await.unwrap();

        assert_eq!(committer.processed().len(), 2);
        assert_eq!(committer.batches_finished(), 1);
    }
}
