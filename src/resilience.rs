// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities.
//!
//! - [`Bulkhead`]: semaphore bounding concurrent applies within a batch
//! - [`with_timeout`]: bounds a single call to a cache member
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), cdc_cache_sync::resilience::BulkheadFull> {
//! use cdc_cache_sync::resilience::Bulkhead;
//!
//! // Bulkhead: max 32 concurrent applies
//! let bulkhead = Bulkhead::new(32);
//! let _permit = bulkhead.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, SyncError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// =============================================================================
// Timeouts
// =============================================================================

/// Run `fut`, failing with a connection error if it takes longer than `limit`.
pub async fn with_timeout<T, F>(endpoint: impl ToString, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::connection(
            endpoint,
            format!("timed out after {}", humantime::format_duration(limit)),
        )),
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead closed: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

impl From<BulkheadFull> for SyncError {
    fn from(e: BulkheadFull) -> Self {
        SyncError::Internal(e.to_string())
    }
}

/// Limits how many operations run simultaneously.
///
/// Permits are owned so they can move into spawned tasks.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit (at least 1).
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary.
    pub async fn acquire(&self) -> std::result::Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }
}
