// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure recovery: stop the failed engine, then poll its member until it
//! answers and restart the engine.
//!
//! ```text
//! engine_failed(id) ──▶ attempt_mark_stopping() ──lost──▶ ignore
//!                              │ won
//!                              ▼
//!                            stop() ──▶ mark_retrying(task) ──▶ task.schedule()
//!                                                                  │ every retry.interval
//!                                                                  ▼
//!                                              healthy(endpoint)? ──no──▶ reschedule
//!                                                     │ yes
//!                                                     ▼
//!                                                   start() ──transient error──▶ reschedule
//! ```

use super::Orchestrator;
use crate::error::SyncError;
use crate::identifier::{Endpoint, Identifier};
use crate::lifecycle::EngineLifecycle;
use crate::metrics;
use crate::retry::RetryTask;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

impl Orchestrator {
    /// Handle a failure reported for one engine.
    ///
    /// Of several concurrent reports for the same engine only the first
    /// stops it and schedules a retry. Unknown identifiers are ignored.
    pub async fn engine_failed(&self, identifier: &Identifier, error: SyncError) {
        let Some(lifecycle) = self.lifecycle(identifier) else {
            debug!(identifier = %identifier, error = %error, "Failure for unknown engine ignored");
            return;
        };
        if !lifecycle.attempt_mark_stopping().await {
            debug!(identifier = %identifier, state = %lifecycle.state(), "Failure already handled");
            return;
        }

        warn!(identifier = %identifier, error = %error, "Engine failed, stopping");
        self.report_connector_failure(&lifecycle, &error);
        if let Err(e) = lifecycle.stop().await {
            warn!(identifier = %identifier, error = %e, "Engine stop after failure failed");
        }

        if self.disabled.contains_key(identifier.rule()) {
            info!(identifier = %identifier, "Rule disabled, not retrying");
            return;
        }
        self.schedule_retry(&lifecycle).await;
    }

    /// Handle a failed shared connection: every engine on the member fails.
    pub async fn backend_failed(&self, endpoint: &Endpoint, error: SyncError) {
        let reconnect = self.ctx.multiplexer.was_started(endpoint);
        self.ctx.observer.backend_failed(endpoint, &error, reconnect);

        let affected = self.engines_matching(|id| id.endpoint() == endpoint);
        debug!(endpoint = %endpoint, engines = affected.len(), "Fanning out backend failure");
        let message = error.to_string();
        futures::future::join_all(affected.iter().map(|lifecycle| {
            self.engine_failed(
                lifecycle.identifier(),
                SyncError::connection(endpoint, message.clone()),
            )
        }))
        .await;
    }

    /// Notify the observer of a connector failure while the engine is still
    /// registered. Returns false once its rule or member was removed.
    ///
    /// The registry entries stay locked across the call, in the order
    /// `ensure_engine` takes them, so a concurrent removal is reported
    /// after this failure or suppresses it.
    pub(super) fn report_connector_failure(
        &self,
        lifecycle: &Arc<EngineLifecycle>,
        error: &SyncError,
    ) -> bool {
        let identifier = lifecycle.identifier();
        let Some(registered) = self.engines.get(identifier) else {
            debug!(identifier = %identifier, error = %error, "Failure of removed engine not reported");
            return false;
        };
        if !Arc::ptr_eq(registered.value(), lifecycle) {
            return false;
        }
        let (Some(_rule), Some(_member)) = (
            self.rules.get(identifier.rule()),
            self.members.get(identifier.endpoint()),
        ) else {
            debug!(identifier = %identifier, error = %error, "Failure of removed engine not reported");
            return false;
        };
        self.ctx.observer.connector_failed(identifier, error);
        true
    }

    /// Put a stopped engine into `Retrying` and schedule its health poll.
    /// False if the engine left `Stopped` first, e.g. through shutdown.
    pub(super) async fn schedule_retry(&self, lifecycle: &Arc<EngineLifecycle>) -> bool {
        let task = self.restart_task(lifecycle);
        match lifecycle.mark_retrying(task.clone()).await {
            Ok(()) => {
                task.schedule();
                info!(
                    identifier = %lifecycle.identifier(),
                    interval = %humantime::format_duration(task.delay()),
                    "Engine retrying"
                );
                true
            }
            Err(e) => {
                debug!(identifier = %lifecycle.identifier(), error = %e, "Retry not scheduled");
                false
            }
        }
    }

    fn restart_task(&self, lifecycle: &Arc<EngineLifecycle>) -> RetryTask<bool> {
        let orchestrator: Weak<Orchestrator> = self.weak_self.clone();
        let engine: Weak<EngineLifecycle> = Arc::downgrade(lifecycle);
        let identifier = lifecycle.identifier().clone();

        RetryTask::new(
            identifier.to_string(),
            self.scheduler.clone(),
            self.config.retry.interval_duration(),
            move || {
                let orchestrator = orchestrator.clone();
                let engine = engine.clone();
                let identifier = identifier.clone();
                Box::pin(async move {
                    let (Some(orchestrator), Some(lifecycle)) = (orchestrator.upgrade(), engine.upgrade())
                    else {
                        return Ok(true);
                    };
                    if orchestrator.disabled.contains_key(identifier.rule()) {
                        lifecycle.stop().await?;
                        return Ok(true);
                    }
                    if !orchestrator.ctx.multiplexer.healthy(identifier.endpoint()).await {
                        debug!(identifier = %identifier, "Member still unhealthy");
                        return Ok(false);
                    }
                    lifecycle.start().await?;
                    metrics::record_connector_restart(&identifier);
                    info!(identifier = %identifier, "Engine restarted");
                    Ok(true)
                })
            },
            |restarted| *restarted,
            SyncError::is_retryable,
        )
    }
}
