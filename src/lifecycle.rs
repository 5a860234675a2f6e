// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-identifier engine state machine.
//!
//! # State Transitions
//!
//! ```text
//!                        start()
//!       ┌─────────────────────────────────────────────┐
//!       ▼                                             │
//!   Running ──attempt_mark_stopping()──▶ Stopping ──stop()──▶ Stopped ──mark_retrying()──▶ Retrying
//!       │  ▲                                 │                  │  ▲                         │
//!       │  └─────────── start() ─────────────┘                  │  └───────── stop() ────────┘
//!       └──────────────── stop() ──────────────────────────────▶│
//!                                                                │
//!   any state except Shutdown ──shutdown()──▶ Shutdown (terminal)
//! ```
//!
//! Every transition runs under one async mutex per engine, so failure
//! notifications, retry completions and administrative calls are totally
//! ordered. [`EngineLifecycle::attempt_mark_stopping()`] is the single
//! check-and-set that lets exactly one of several concurrent failure
//! reports proceed.

use crate::batch::BatchCoordinator;
use crate::capture::{CaptureEngine, CaptureSession};
use crate::coordinator::Notifier;
use crate::error::{Result, SyncError};
use crate::identifier::Identifier;
use crate::metrics;
use crate::multiplexer::ConnectionMultiplexer;
use crate::observer::SyncObserver;
use crate::pipeline::EventPipeline;
use crate::retry::RetryTask;
use crate::rule::Rule;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// State of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Running,
    Stopping,
    Stopped,
    Retrying,
    /// Terminal.
    Shutdown,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
            EngineState::Retrying => "retrying",
            EngineState::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Running => write!(f, "Running"),
            EngineState::Stopping => write!(f, "Stopping"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Retrying => write!(f, "Retrying"),
            EngineState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

struct Guarded {
    state: EngineState,
    retry: Option<RetryTask<bool>>,
}

/// Collaborators shared by every engine of an orchestrator.
#[derive(Clone)]
pub struct EngineContext {
    pub multiplexer: Arc<ConnectionMultiplexer>,
    pub observer: Arc<dyn SyncObserver>,
    pub notifier: Notifier,
    pub max_concurrent_applies: usize,
}

/// One capture engine instance and its lifecycle.
pub struct EngineLifecycle {
    identifier: Identifier,
    rule: Arc<Rule>,
    engine: Arc<dyn CaptureEngine>,
    ctx: EngineContext,
    guarded: Mutex<Guarded>,
    state_tx: watch::Sender<EngineState>,
}

impl EngineLifecycle {
    /// New engine in `Stopped`.
    pub fn new(
        identifier: Identifier,
        rule: Arc<Rule>,
        engine: Arc<dyn CaptureEngine>,
        ctx: EngineContext,
    ) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Stopped);
        Self {
            identifier,
            rule,
            engine,
            ctx,
            guarded: Mutex::new(Guarded {
                state: EngineState::Stopped,
                retry: None,
            }),
            state_tx,
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    /// Last committed state.
    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    /// Current retry task, if any.
    pub async fn retry_task(&self) -> Option<RetryTask<bool>> {
        self.guarded.lock().await.retry.clone()
    }

    /// Start the engine from `Stopped`, `Retrying` or `Stopping`.
    ///
    /// Attaches the backend, starts the capture engine, then clears any
    /// retry task. A failed start leaves state and retry task untouched.
    pub async fn start(&self) -> Result<()> {
        let mut guarded = self.guarded.lock().await;
        match guarded.state {
            EngineState::Stopped | EngineState::Retrying | EngineState::Stopping => {}
            other => {
                return Err(SyncError::invalid_state(
                    "Stopped, Retrying or Stopping",
                    other,
                ))
            }
        }

        let attached = self.ctx.multiplexer.start(&self.identifier, &self.rule).await?;
        let batches = Arc::new(BatchCoordinator::new(
            self.identifier.clone(),
            EventPipeline::for_backend(&attached.backend),
            self.ctx.max_concurrent_applies,
            self.ctx.notifier.clone(),
        ));
        let session = CaptureSession::new(
            self.identifier.clone(),
            self.rule.table.clone(),
            attached.persistence,
            batches,
            self.ctx.notifier.clone(),
        );

        if let Err(e) = self.engine.start(session).await {
            if let Err(stop_err) = self.ctx.multiplexer.stop(&self.identifier).await {
                debug!(identifier = %self.identifier, error = %stop_err, "Backend release failed");
            }
            return Err(e);
        }

        if let Some(task) = guarded.retry.take() {
            task.close();
        }
        self.set_state(&mut guarded, EngineState::Running);
        self.ctx.observer.connector_started(&self.identifier);
        Ok(())
    }

    /// `Running` → `Stopping`. False from any other state.
    pub async fn attempt_mark_stopping(&self) -> bool {
        let mut guarded = self.guarded.lock().await;
        if guarded.state != EngineState::Running {
            return false;
        }
        self.set_state(&mut guarded, EngineState::Stopping);
        true
    }

    /// Stop the engine.
    ///
    /// From `Running`/`Stopping` the capture engine is stopped and its
    /// backend released; from `Retrying` the retry task is closed. The
    /// state is `Stopped` afterwards even if stopping the engine failed.
    pub async fn stop(&self) -> Result<()> {
        let mut guarded = self.guarded.lock().await;
        match guarded.state {
            EngineState::Running | EngineState::Stopping => {
                let engine_result = self.engine.stop().await;
                let backend_result = self.ctx.multiplexer.stop(&self.identifier).await;
                self.set_state(&mut guarded, EngineState::Stopped);
                self.ctx.observer.connector_stopped(&self.identifier);
                engine_result.and(backend_result)
            }
            EngineState::Retrying => {
                if let Some(task) = guarded.retry.take() {
                    task.close();
                }
                self.set_state(&mut guarded, EngineState::Stopped);
                Ok(())
            }
            EngineState::Stopped => Ok(()),
            EngineState::Shutdown => Err(SyncError::invalid_state(
                "Running, Stopping or Retrying",
                EngineState::Shutdown,
            )),
        }
    }

    /// Terminal stop: engine, retry task and backend. Errors if already shut down.
    ///
    /// Failures along the way are logged; the engine ends in `Shutdown`
    /// regardless and the first failure is returned.
    pub async fn shutdown(&self) -> Result<()> {
        let mut guarded = self.guarded.lock().await;
        let previous = guarded.state;
        if previous == EngineState::Shutdown {
            return Err(SyncError::invalid_state("not Shutdown", previous));
        }

        let mut first_error = None;
        if matches!(previous, EngineState::Running | EngineState::Stopping) {
            if let Err(e) = self.engine.stop().await {
                warn!(identifier = %self.identifier, error = %e, "Engine stop failed during shutdown");
                first_error.get_or_insert(e);
            }
        }
        if let Some(task) = guarded.retry.take() {
            task.close();
        }
        if let Err(e) = self.ctx.multiplexer.shutdown(&self.identifier).await {
            warn!(identifier = %self.identifier, error = %e, "Backend release failed during shutdown");
            first_error.get_or_insert(e);
        }

        self.set_state(&mut guarded, EngineState::Shutdown);
        if matches!(previous, EngineState::Running | EngineState::Stopping) {
            self.ctx.observer.connector_stopped(&self.identifier);
        }
        info!(identifier = %self.identifier, from = %previous, "Engine shut down");
        first_error.map_or(Ok(()), Err)
    }

    /// `Stopped` → `Retrying`, storing `task`. Any earlier task is closed.
    ///
    /// From any other state the task is closed and an error returned.
    pub async fn mark_retrying(&self, task: RetryTask<bool>) -> Result<()> {
        let mut guarded = self.guarded.lock().await;
        if guarded.state != EngineState::Stopped {
            task.close();
            return Err(SyncError::invalid_state("Stopped", guarded.state));
        }
        if let Some(previous) = guarded.retry.replace(task) {
            previous.close();
        }
        self.set_state(&mut guarded, EngineState::Retrying);
        Ok(())
    }

    fn set_state(&self, guarded: &mut Guarded, state: EngineState) {
        let from = guarded.state;
        guarded.state = state;
        self.state_tx.send_replace(state);
        metrics::set_connector_state(&self.identifier, state.as_str());
        debug!(identifier = %self.identifier, from = %from, to = %state, "Engine state changed");
    }
}

impl std::fmt::Debug for EngineLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineLifecycle")
            .field("identifier", &self.identifier)
            .field("state", &self.state())
            .finish()
    }
}
