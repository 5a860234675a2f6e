// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Orchestrator: rule and member registries, and the engines between them.
//!
//! One engine runs per `(rule, member)` pair. The orchestrator keeps the
//! engine registry equal to the cross product of registered rules and
//! known members as either side changes.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!                 │                     Orchestrator                     │
//!  add_rule ─────▶│  rules     DashMap<name, Arc<Rule>>                  │
//!  remove_rule ──▶│  members   DashMap<Endpoint, ()>                     │
//!                 │  engines   DashMap<Identifier, Arc<EngineLifecycle>> │
//!                 └───────▲──────────────────────────────┬───────────────┘
//!                         │ Notification (mpsc)          │ start / stop / shutdown
//!        ┌────────────────┼────────────────┐             ▼
//!  MembershipListener  CaptureSession  ConnectionListener   EngineLifecycle ─▶ ConnectionMultiplexer
//!   joined / left      engine_failed   backend_failed
//! ```
//!
//! Notifications are drained by a dispatcher task on the orchestrator's
//! [`Scheduler`], the same one that runs every retry and membership poll.
//!
//! # Registry updates
//!
//! An engine is only inserted while holding the registry slot of its
//! identifier, and only if its rule and member are both still registered.
//! Removal takes the rule or member out first and then sweeps the engine
//! registry, so a concurrent insert either sees the removal or is swept.

mod recovery;
mod types;

pub use types::{HealthCheck, Notification, Notifier, OrchestratorState};

use crate::capture::CaptureEngineFactory;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::identifier::{Endpoint, Identifier};
use crate::lifecycle::{EngineContext, EngineLifecycle, EngineState};
use crate::membership::{Discovery, DnsDiscovery, MembershipListener};
use crate::metrics;
use crate::multiplexer::ConnectionMultiplexer;
use crate::observer::SyncObserver;
use crate::retry::Scheduler;
use crate::rule::Rule;
use crate::store::ConnectionFactory;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The synchronization control plane.
pub struct Orchestrator {
    config: SyncConfig,
    rules: DashMap<String, Arc<Rule>>,
    /// Rules whose engines are administratively stopped.
    disabled: DashMap<String, ()>,
    members: DashMap<Endpoint, ()>,
    engines: DashMap<Identifier, Arc<EngineLifecycle>>,

    ctx: EngineContext,
    capture: Arc<dyn CaptureEngineFactory>,
    discovery: Arc<dyn Discovery>,
    scheduler: Scheduler,

    inbox: Mutex<Option<UnboundedReceiver<Notification>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<MembershipListener>>,

    state_tx: watch::Sender<OrchestratorState>,
    state_rx: watch::Receiver<OrchestratorState>,
    weak_self: Weak<Self>,
}

impl Orchestrator {
    /// Create an orchestrator resolving members through DNS.
    ///
    /// The config is validated here. Nothing runs until [`start()`](Self::start).
    pub fn new(
        config: SyncConfig,
        connections: Arc<dyn ConnectionFactory>,
        capture: Arc<dyn CaptureEngineFactory>,
        observer: Arc<dyn SyncObserver>,
    ) -> Result<Arc<Self>> {
        Self::with_discovery(config, connections, capture, observer, Arc::new(DnsDiscovery))
    }

    /// Create an orchestrator with a custom member discovery.
    pub fn with_discovery(
        config: SyncConfig,
        connections: Arc<dyn ConnectionFactory>,
        capture: Arc<dyn CaptureEngineFactory>,
        observer: Arc<dyn SyncObserver>,
        discovery: Arc<dyn Discovery>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let scheduler = if config.scheduler.dedicated {
            Scheduler::dedicated(config.scheduler.thread_name.clone())?
        } else {
            Scheduler::current()?
        };

        let (notifier, inbox) = Notifier::channel();
        let multiplexer = Arc::new(ConnectionMultiplexer::new(
            connections,
            Arc::clone(&observer),
            notifier.clone(),
        ));
        let ctx = EngineContext {
            multiplexer,
            observer,
            notifier,
            max_concurrent_applies: config.pipeline.max_concurrent_applies,
        };
        let (state_tx, state_rx) = watch::channel(OrchestratorState::Created);

        Ok(Arc::new_cyclic(|weak_self| Self {
            config,
            rules: DashMap::new(),
            disabled: DashMap::new(),
            members: DashMap::new(),
            engines: DashMap::new(),
            ctx,
            capture,
            discovery,
            scheduler,
            inbox: Mutex::new(Some(inbox)),
            dispatcher: Mutex::new(None),
            listener: Mutex::new(None),
            state_tx,
            state_rx,
            weak_self: weak_self.clone(),
        }))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start dispatching notifications, register the configured rules and
    /// join the members.
    ///
    /// With discovery enabled the first poll runs before this returns; its
    /// joins are then handled by the dispatcher. Otherwise every static
    /// member is joined directly.
    pub async fn start(&self) -> Result<()> {
        if self.state() != OrchestratorState::Created {
            return Err(SyncError::invalid_state("Created", self.state()));
        }

        info!(
            rules = self.config.rules.len(),
            discovery = self.config.discovery.enabled,
            scheduler = %self.scheduler.name(),
            "Starting orchestrator"
        );

        let inbox = lock(&self.inbox)
            .take()
            .ok_or_else(|| SyncError::Internal("notification inbox already taken".into()))?;
        let handle = self
            .scheduler
            .spawn(Self::dispatch(self.weak_self.clone(), inbox));
        *lock(&self.dispatcher) = Some(handle);
        self.set_state(OrchestratorState::Running);

        for rule in self.config.rules.clone() {
            self.add_rule(rule).await?;
        }

        if self.config.discovery.enabled {
            let listener = MembershipListener::from_config(
                &self.config.discovery,
                Arc::clone(&self.discovery),
                self.scheduler.clone(),
                self.ctx.notifier.clone(),
            );
            listener.poll().await?;
            listener.start();
            *lock(&self.listener) = Some(listener);
        } else {
            for member in self.config.static_members() {
                self.member_joined(member).await;
            }
        }

        info!(
            rules = self.rules.len(),
            members = self.members.len(),
            engines = self.engines.len(),
            "Orchestrator running"
        );
        Ok(())
    }

    /// Shut down every engine and stop background work. Idempotent.
    ///
    /// Engine shutdown failures are logged and do not stop the sweep.
    pub async fn shutdown(&self) {
        let claimed = self.state_tx.send_if_modified(|state| {
            if matches!(
                *state,
                OrchestratorState::Created | OrchestratorState::Running
            ) {
                *state = OrchestratorState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if !claimed {
            debug!(state = %self.state(), "Shutdown already in progress");
            return;
        }
        info!("Shutting down orchestrator");

        if let Some(listener) = lock(&self.listener).take() {
            listener.close();
        }

        let engines = self.take_engines(|_| true);
        let engine_count = engines.len();
        self.shutdown_engines(engines).await;

        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
        self.scheduler.shutdown();

        self.set_state(OrchestratorState::Stopped);
        info!(engines = engine_count, "Orchestrator stopped");
    }

    async fn dispatch(orchestrator: Weak<Self>, mut inbox: UnboundedReceiver<Notification>) {
        while let Some(notification) = inbox.recv().await {
            let Some(orchestrator) = orchestrator.upgrade() else {
                break;
            };
            match notification {
                Notification::EngineFailed { identifier, error } => {
                    orchestrator.engine_failed(&identifier, error).await
                }
                Notification::BackendFailed { endpoint, error } => {
                    orchestrator.backend_failed(&endpoint, error).await
                }
                Notification::MemberJoined(endpoint) => orchestrator.member_joined(endpoint).await,
                Notification::MemberLeft(endpoint) => orchestrator.member_left(&endpoint).await,
            }
        }
        debug!("Notification dispatcher exited");
    }

    // =========================================================================
    // Rules
    // =========================================================================

    /// Register a rule and start its engine on every known member.
    ///
    /// Registering an identical definition again is a no-op. A different
    /// definition under a taken name is rejected and changes nothing.
    pub async fn add_rule(&self, rule: Rule) -> Result<()> {
        rule.validate()?;
        if !self.accepting() {
            return Err(SyncError::Shutdown);
        }

        let rule = Arc::new(rule);
        match self.rules.entry(rule.name.clone()) {
            Entry::Occupied(existing) => {
                if **existing.get() == *rule {
                    debug!(rule = %rule.name, "Rule already registered");
                    return Ok(());
                }
                return Err(SyncError::RuleConflict {
                    rule: rule.name.clone(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&rule));
            }
        }
        info!(rule = %rule.name, table = %rule.table, "Rule added");

        let members = self.members();
        join_all(members.iter().map(|m| self.ensure_engine(&rule, m))).await;
        Ok(())
    }

    /// Shut down every engine of the rule and drop it. Unknown names are a no-op.
    pub async fn remove_rule(&self, name: &str) -> Result<()> {
        if self.rules.remove(name).is_none() {
            debug!(rule = %name, "Rule not registered");
            return Ok(());
        }
        self.disabled.remove(name);

        let engines = self.take_engines(|id| id.rule() == name);
        info!(rule = %name, engines = engines.len(), "Rule removed");
        self.shutdown_engines(engines).await;
        Ok(())
    }

    /// Stop every engine of the rule, closing pending retries. The rule
    /// stays registered and new members get a stopped engine.
    pub async fn disable_rule(&self, name: &str) -> Result<()> {
        if !self.rules.contains_key(name) {
            return Err(SyncError::Config(format!("rule '{}' is not registered", name)));
        }
        self.disabled.insert(name.to_string(), ());

        let mut first_error = None;
        for lifecycle in self.engines_matching(|id| id.rule() == name) {
            if let Err(e) = lifecycle.stop().await {
                warn!(identifier = %lifecycle.identifier(), error = %e, "Engine stop failed");
                first_error.get_or_insert(e);
            }
        }
        info!(rule = %name, "Rule disabled");
        first_error.map_or(Ok(()), Err)
    }

    /// Start every stopped engine of a disabled rule.
    pub async fn enable_rule(&self, name: &str) -> Result<()> {
        if !self.rules.contains_key(name) {
            return Err(SyncError::Config(format!("rule '{}' is not registered", name)));
        }
        if self.disabled.remove(name).is_none() {
            debug!(rule = %name, "Rule already enabled");
            return Ok(());
        }

        let stopped: Vec<_> = self
            .engines_matching(|id| id.rule() == name)
            .into_iter()
            .filter(|l| l.state() == EngineState::Stopped)
            .collect();
        join_all(stopped.iter().map(|l| self.start_engine(l))).await;
        info!(rule = %name, engines = stopped.len(), "Rule enabled");
        Ok(())
    }

    // =========================================================================
    // Members
    // =========================================================================

    /// Start an engine for every registered rule on a new member.
    pub async fn member_joined(&self, endpoint: Endpoint) {
        if !self.accepting() {
            debug!(endpoint = %endpoint, "Member join ignored during shutdown");
            return;
        }
        if self.members.insert(endpoint.clone(), ()).is_some() {
            debug!(endpoint = %endpoint, "Member already known");
            return;
        }
        self.ctx.observer.member_joined(&endpoint);
        metrics::set_member_count(self.members.len());

        let rules: Vec<Arc<Rule>> = self.rules.iter().map(|r| Arc::clone(r.value())).collect();
        join_all(rules.iter().map(|r| self.ensure_engine(r, &endpoint))).await;
    }

    /// Shut down and forget every engine on a departed member.
    pub async fn member_left(&self, endpoint: &Endpoint) {
        if self.members.remove(endpoint).is_none() {
            debug!(endpoint = %endpoint, "Member not known");
            return;
        }
        self.ctx.observer.member_left(endpoint);
        metrics::set_member_count(self.members.len());

        let engines = self.take_engines(|id| id.endpoint() == endpoint);
        self.shutdown_engines(engines).await;
    }

    // =========================================================================
    // Engines
    // =========================================================================

    /// Create and start the engine of `(rule, endpoint)` if absent.
    async fn ensure_engine(&self, rule: &Arc<Rule>, endpoint: &Endpoint) {
        let identifier = Identifier::new(&rule.name, endpoint.clone());

        let lifecycle = match self.engines.entry(identifier.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                let rule_current = self
                    .rules
                    .get(&rule.name)
                    .map(|r| Arc::ptr_eq(r.value(), rule))
                    .unwrap_or(false);
                if !rule_current || !self.members.contains_key(endpoint) || !self.accepting() {
                    debug!(identifier = %identifier, "Pair no longer registered, engine not created");
                    return;
                }
                let engine = match self.capture.create(&identifier, rule) {
                    Ok(engine) => engine,
                    Err(e) => {
                        error!(identifier = %identifier, error = %e, "Capture engine creation failed");
                        return;
                    }
                };
                let lifecycle = Arc::new(EngineLifecycle::new(
                    identifier.clone(),
                    Arc::clone(rule),
                    engine,
                    self.ctx.clone(),
                ));
                slot.insert(Arc::clone(&lifecycle));
                lifecycle
            }
        };
        debug!(identifier = %identifier, "Engine created");

        if self.disabled.contains_key(&rule.name) {
            info!(identifier = %identifier, "Rule disabled, engine left stopped");
            return;
        }
        self.start_engine(&lifecycle).await;
    }

    /// Start an engine; a transient failure hands it to the retry path.
    async fn start_engine(&self, lifecycle: &Arc<EngineLifecycle>) {
        match lifecycle.start().await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                warn!(identifier = %lifecycle.identifier(), error = %e, "Engine start failed, retrying");
                if self.schedule_retry(lifecycle).await {
                    self.report_connector_failure(lifecycle, &e);
                }
            }
            Err(e) => {
                // Shut down concurrently by a removal.
                debug!(identifier = %lifecycle.identifier(), error = %e, "Engine not started");
            }
        }
    }

    /// Remove matching engines from the registry and return them.
    fn take_engines(&self, matches: impl Fn(&Identifier) -> bool) -> Vec<Arc<EngineLifecycle>> {
        let keys: Vec<Identifier> = self
            .engines
            .iter()
            .filter(|e| matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.iter()
            .filter_map(|k| self.engines.remove(k).map(|(_, l)| l))
            .collect()
    }

    fn engines_matching(&self, matches: impl Fn(&Identifier) -> bool) -> Vec<Arc<EngineLifecycle>> {
        self.engines
            .iter()
            .filter(|e| matches(e.key()))
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    async fn shutdown_engines(&self, engines: Vec<Arc<EngineLifecycle>>) {
        join_all(engines.iter().map(|lifecycle| async move {
            if let Err(e) = lifecycle.shutdown().await {
                warn!(identifier = %lifecycle.identifier(), error = %e, "Engine shutdown failed");
            }
        }))
        .await;
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn state(&self) -> OrchestratorState {
        *self.state_rx.borrow()
    }

    /// Watch orchestrator state changes.
    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.state_tx.subscribe()
    }

    /// Sender for inbound notifications.
    pub fn notifier(&self) -> Notifier {
        self.ctx.notifier.clone()
    }

    pub fn multiplexer(&self) -> &Arc<ConnectionMultiplexer> {
        &self.ctx.multiplexer
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Registered rule names, sorted.
    pub fn rules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rules.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    pub fn rule(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.get(name).map(|r| Arc::clone(r.value()))
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled.contains_key(name)
    }

    /// Known members, sorted.
    pub fn members(&self) -> Vec<Endpoint> {
        let mut members: Vec<Endpoint> = self.members.iter().map(|m| m.key().clone()).collect();
        members.sort();
        members
    }

    /// Identifiers of every registered engine, sorted.
    pub fn identifiers(&self) -> Vec<Identifier> {
        let mut ids: Vec<Identifier> = self.engines.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn lifecycle(&self, identifier: &Identifier) -> Option<Arc<EngineLifecycle>> {
        self.engines.get(identifier).map(|e| Arc::clone(e.value()))
    }

    pub fn engine_state(&self, identifier: &Identifier) -> Option<EngineState> {
        self.engines.get(identifier).map(|e| e.value().state())
    }

    /// Snapshot from cached state. No network I/O.
    pub fn health_check(&self) -> HealthCheck {
        let states: Vec<EngineState> = self.engines.iter().map(|e| e.value().state()).collect();
        let count = |s: EngineState| states.iter().filter(|&&x| x == s).count();
        let state = self.state();
        let engines_retrying = count(EngineState::Retrying);

        HealthCheck {
            state,
            rules: self.rules.len(),
            members: self.members.len(),
            connections: self.ctx.multiplexer.connection_count(),
            engines_total: states.len(),
            engines_running: count(EngineState::Running),
            engines_retrying,
            engines_stopped: count(EngineState::Stopped),
            healthy: state == OrchestratorState::Running && engines_retrying == 0,
        }
    }

    fn accepting(&self) -> bool {
        matches!(
            self.state(),
            OrchestratorState::Created | OrchestratorState::Running
        )
    }

    fn set_state(&self, state: OrchestratorState) {
        self.state_tx.send_replace(state);
        debug!(state = %state, "Orchestrator state changed");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state())
            .field("rules", &self.rules.len())
            .field("members", &self.members.len())
            .field("engines", &self.engines.len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
