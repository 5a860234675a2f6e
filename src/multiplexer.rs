// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared member connections.
//!
//! One physical connection per member endpoint, shared by every rule
//! syncing to that member:
//!
//! ```text
//! ConnectionMultiplexer
//! └── entries: Endpoint → ConnectionEntry
//!                         ├── connection (started / stopped)
//!                         ├── persistence (provisioned once)
//!                         └── backends: rule → Backend { store, running }
//! ```
//!
//! # Lifecycle
//!
//! - `start(id)` registers the rule's backend and starts the connection if
//!   it is not running. The first start is a fresh start; starting an entry
//!   whose backends had all stopped is a reconnect.
//! - `stop(id)` marks one backend not running. The connection stops once no
//!   backend is running, but the entry stays.
//! - `shutdown(id)` removes the backend. Removing the last one tears the
//!   connection down and drops the entry.
//!
//! Entry creation and backend registration happen under the registry's
//! per-key guard, and entry removal re-checks emptiness under the same
//! guard, so a concurrent `start` never lands on a torn-down entry.

use crate::coordinator::Notifier;
use crate::error::Result;
use crate::identifier::{Endpoint, Identifier};
use crate::observer::SyncObserver;
use crate::rule::Rule;
use crate::store::{CacheConnection, CacheStore, ConnectionFactory, ConnectionListener, EnginePersistence};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// put/remove target of one rule on one member.
pub struct Backend {
    rule: Arc<Rule>,
    store: RwLock<Arc<dyn CacheStore>>,
    running: AtomicBool,
}

impl Backend {
    fn new(rule: Arc<Rule>, store: Arc<dyn CacheStore>) -> Self {
        Self {
            rule,
            store: RwLock::new(store),
            running: AtomicBool::new(false),
        }
    }

    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    pub fn store(&self) -> Arc<dyn CacheStore> {
        match self.store.read() {
            Ok(store) => (*store).clone(),
            Err(poisoned) => (*poisoned.into_inner()).clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    fn rebind(&self, store: Arc<dyn CacheStore>) {
        match self.store.write() {
            Ok(mut slot) => *slot = store,
            Err(poisoned) => *poisoned.into_inner() = store,
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("rule", &self.rule.name)
            .field("running", &self.is_running())
            .finish()
    }
}

/// What `start()` hands to an engine.
#[derive(Clone)]
pub struct AttachedBackend {
    pub backend: Arc<Backend>,
    pub persistence: EnginePersistence,
}

#[derive(Default)]
struct EntryState {
    started: bool,
    persistence: Option<EnginePersistence>,
}

/// One member endpoint: the shared connection and its rule backends.
pub struct ConnectionEntry {
    endpoint: Endpoint,
    connection: Arc<dyn CacheConnection>,
    backends: DashMap<String, Arc<Backend>>,
    /// Serializes connection start/stop and backend running flags.
    state: Mutex<EntryState>,
    ever_started: AtomicBool,
}

impl ConnectionEntry {
    fn new(endpoint: Endpoint, connection: Arc<dyn CacheConnection>) -> Self {
        Self {
            endpoint,
            connection,
            backends: DashMap::new(),
            state: Mutex::new(EntryState::default()),
            ever_started: AtomicBool::new(false),
        }
    }

    fn backend_for(&self, rule: &Arc<Rule>) -> Arc<Backend> {
        let backend = self
            .backends
            .entry(rule.name.clone())
            .or_insert_with(|| {
                Arc::new(Backend::new(
                    Arc::clone(rule),
                    self.connection.store(&rule.name),
                ))
            });
        Arc::clone(backend.value())
    }

    fn any_running(&self) -> bool {
        self.backends.iter().any(|b| b.value().is_running())
    }

    /// Stop the connection if no backend is running. Caller holds `state`.
    async fn stop_if_idle(&self, state: &mut EntryState, observer: &dyn SyncObserver) -> Result<()> {
        if !state.started || self.any_running() {
            return Ok(());
        }
        state.started = false;
        let result = self.connection.stop().await;
        observer.backend_stopped(&self.endpoint);
        result
    }
}

/// Registry of shared member connections.
pub struct ConnectionMultiplexer {
    factory: Arc<dyn ConnectionFactory>,
    entries: DashMap<Endpoint, Arc<ConnectionEntry>>,
    observer: Arc<dyn SyncObserver>,
    notifier: Notifier,
}

impl ConnectionMultiplexer {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        observer: Arc<dyn SyncObserver>,
        notifier: Notifier,
    ) -> Self {
        Self {
            factory,
            entries: DashMap::new(),
            observer,
            notifier,
        }
    }

    /// Register and start the backend of `identifier`.
    ///
    /// Connection start and provisioning failures propagate; the backend
    /// then stays registered but not running.
    pub async fn start(&self, identifier: &Identifier, rule: &Arc<Rule>) -> Result<AttachedBackend> {
        let endpoint = identifier.endpoint();

        let (entry, backend) = {
            let slot = self.entries.entry(endpoint.clone()).or_try_insert_with(|| {
                let listener = ConnectionListener::new(endpoint.clone(), self.notifier.clone());
                let connection = self.factory.create(endpoint, listener)?;
                debug!(endpoint = %endpoint, "Connection entry created");
                Ok::<_, crate::error::SyncError>(Arc::new(ConnectionEntry::new(
                    endpoint.clone(),
                    connection,
                )))
            })?;
            let entry = Arc::clone(slot.value());
            let backend = entry.backend_for(rule);
            (entry, backend)
        };

        let mut state = entry.state.lock().await;
        if !state.started {
            entry.connection.start().await?;
            let reconnect = entry.ever_started.load(Ordering::Acquire);
            if state.persistence.is_none() {
                state.persistence = Some(entry.connection.provision().await?);
            }
            if reconnect {
                for b in entry.backends.iter() {
                    b.value().rebind(entry.connection.store(b.key()));
                }
                info!(
                    endpoint = %endpoint,
                    backends = entry.backends.len(),
                    "Connection reconnected"
                );
            }
            state.started = true;
            entry.ever_started.store(true, Ordering::Release);
            self.observer.backend_started(endpoint, reconnect);
        }
        backend.set_running(true);

        let persistence = match &state.persistence {
            Some(p) => p.clone(),
            None => entry.connection.provision().await?,
        };
        Ok(AttachedBackend {
            backend,
            persistence,
        })
    }

    /// Mark the backend of `identifier` not running.
    pub async fn stop(&self, identifier: &Identifier) -> Result<()> {
        let Some(entry) = self.entry(identifier.endpoint()) else {
            return Ok(());
        };
        let mut state = entry.state.lock().await;
        if let Some(backend) = entry.backends.get(identifier.rule()) {
            backend.set_running(false);
        }
        entry.stop_if_idle(&mut state, self.observer.as_ref()).await
    }

    /// Remove the backend of `identifier`, tearing the connection down if it
    /// was the last one.
    pub async fn shutdown(&self, identifier: &Identifier) -> Result<()> {
        let endpoint = identifier.endpoint();
        let Some(entry) = self.entry(endpoint) else {
            return Ok(());
        };

        let mut state = entry.state.lock().await;
        entry.backends.remove(identifier.rule());
        let removed = self
            .entries
            .remove_if(endpoint, |_, e| Arc::ptr_eq(e, &entry) && e.backends.is_empty())
            .is_some();

        if !removed {
            return entry.stop_if_idle(&mut state, self.observer.as_ref()).await;
        }

        info!(endpoint = %endpoint, "Connection entry removed");
        if !state.started {
            return Ok(());
        }
        state.started = false;
        let result = entry.connection.stop().await;
        if let Err(e) = &result {
            warn!(endpoint = %endpoint, error = %e, "Connection teardown failed");
        }
        self.observer.backend_stopped(endpoint);
        result
    }

    /// Whether the member behind `endpoint` answers.
    pub async fn healthy(&self, endpoint: &Endpoint) -> bool {
        let Some(entry) = self.entry(endpoint) else {
            return false;
        };
        match entry.connection.is_healthy().await {
            Ok(healthy) => healthy,
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "Health check failed");
                false
            }
        }
    }

    /// Whether the connection to `endpoint` has been started at least once.
    pub fn was_started(&self, endpoint: &Endpoint) -> bool {
        self.entry(endpoint)
            .map(|e| e.ever_started.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn backend(&self, identifier: &Identifier) -> Option<Arc<Backend>> {
        self.entry(identifier.endpoint())
            .and_then(|e| e.backends.get(identifier.rule()).map(|b| Arc::clone(b.value())))
    }

    pub fn has_connection(&self, endpoint: &Endpoint) -> bool {
        self.entries.contains_key(endpoint)
    }

    pub fn connection_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of backends registered under `endpoint`.
    pub fn backend_count(&self, endpoint: &Endpoint) -> usize {
        self.entry(endpoint).map(|e| e.backends.len()).unwrap_or(0)
    }

    fn entry(&self, endpoint: &Endpoint) -> Option<Arc<ConnectionEntry>> {
        self.entries.get(endpoint).map(|e| Arc::clone(e.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnectionFactory;
    use crate::observer::{ObservedEvent, RecordingObserver};
    use crate::rule::TableRef;

    struct Fixture {
        factory: Arc<MemoryConnectionFactory>,
        observer: Arc<RecordingObserver>,
        mux: ConnectionMultiplexer,
    }

    fn fixture() -> Fixture {
        let factory = Arc::new(MemoryConnectionFactory::new());
        let observer = Arc::new(RecordingObserver::new());
        let (notifier, _rx) = Notifier::channel();
        let mux = ConnectionMultiplexer::new(factory.clone(), observer.clone(), notifier);
        Fixture {
            factory,
            observer,
            mux,
        }
    }

    fn rule(name: &str) -> Arc<Rule> {
        Arc::new(Rule::new(name, TableRef::new(name), &["id"]))
    }

    fn ep() -> Endpoint {
        Endpoint::new("mem://a")
    }

    #[tokio::test]
    async fn test_two_rules_share_one_connection() {
        let f = fixture();
        let id1 = Identifier::new("r1", ep());
        let id2 = Identifier::new("r2", ep());

        let a1 = f.mux.start(&id1, &rule("r1")).await.unwrap();
        let a2 = f.mux.start(&id2, &rule("r2")).await.unwrap();

        assert_eq!(f.factory.created(), 1);
        assert_eq!(f.mux.connection_count(), 1);
        assert_eq!(f.mux.backend_count(&ep()), 2);
        assert!(!Arc::ptr_eq(&a1.backend, &a2.backend));
        assert!(a1.backend.is_running() && a2.backend.is_running());

        let conn = f.factory.connection(&ep()).unwrap();
        assert_eq!(conn.starts(), 1);
        assert_eq!(conn.provisions(), 1);

        // Stopping one leaves the other running.
        f.mux.stop(&id1).await.unwrap();
        assert!(!a1.backend.is_running());
        assert!(a2.backend.is_running());
        assert!(conn.is_started());

        // Torn down only once both are removed.
        f.mux.shutdown(&id1).await.unwrap();
        assert!(f.mux.has_connection(&ep()));
        assert!(conn.is_started());

        f.mux.shutdown(&id2).await.unwrap();
        assert!(!f.mux.has_connection(&ep()));
        assert!(!conn.is_started());
        assert_eq!(conn.stops(), 1);
    }

    #[tokio::test]
    async fn test_restart_after_full_stop_is_reconnect() {
        let f = fixture();
        let id = Identifier::new("r1", ep());
        let r = rule("r1");

        f.mux.start(&id, &r).await.unwrap();
        f.mux.stop(&id).await.unwrap();

        let conn = f.factory.connection(&ep()).unwrap();
        assert!(!conn.is_started());
        assert!(f.mux.has_connection(&ep()));

        let attached = f.mux.start(&id, &r).await.unwrap();
        assert!(attached.backend.is_running());
        assert_eq!(conn.starts(), 2);
        assert_eq!(conn.provisions(), 1);
        assert_eq!(f.factory.created(), 1);

        let started: Vec<bool> = f
            .observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::BackendStarted { reconnect, .. } => Some(reconnect),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec![false, true]);
        assert!(f.mux.was_started(&ep()));
    }

    #[tokio::test]
    async fn test_start_failure_propagates() {
        let f = fixture();
        let id = Identifier::new("r1", ep());
        f.factory.refuse(&ep(), true);

        let err = f.mux.start(&id, &rule("r1")).await.err().unwrap();
        assert!(err.is_retryable());
        let backend = f.mux.backend(&id).unwrap();
        assert!(!backend.is_running());
        assert!(!f.mux.was_started(&ep()));

        f.factory.refuse(&ep(), false);
        let attached = f.mux.start(&id, &rule("r1")).await.unwrap();
        assert!(attached.backend.is_running());
        assert_eq!(f.factory.created(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_after_stop_reports_one_backend_stop() {
        let f = fixture();
        let id = Identifier::new("r1", ep());

        f.mux.start(&id, &rule("r1")).await.unwrap();
        f.mux.stop(&id).await.unwrap();
        f.mux.shutdown(&id).await.unwrap();

        assert!(!f.mux.has_connection(&ep()));
        assert_eq!(f.factory.connection(&ep()).unwrap().stops(), 1);
        assert_eq!(
            f.observer.count(|e| matches!(e, ObservedEvent::BackendStopped(_))),
            1
        );
    }

    #[tokio::test]
    async fn test_healthy() {
        let f = fixture();
        assert!(!f.mux.healthy(&ep()).await);

        let id = Identifier::new("r1", ep());
        f.mux.start(&id, &rule("r1")).await.unwrap();
        assert!(f.mux.healthy(&ep()).await);

        f.factory.connection(&ep()).unwrap().set_healthy(false);
        assert!(!f.mux.healthy(&ep()).await);
    }

    #[tokio::test]
    async fn test_stop_and_shutdown_unknown_are_noops() {
        let f = fixture();
        let id = Identifier::new("r1", ep());
        f.mux.stop(&id).await.unwrap();
        f.mux.shutdown(&id).await.unwrap();
        assert_eq!(f.mux.connection_count(), 0);
        assert!(f.observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_backends_write_through_shared_connection() {
        let f = fixture();
        let a1 = f.mux.start(&Identifier::new("r1", ep()), &rule("r1")).await.unwrap();
        let a2 = f.mux.start(&Identifier::new("r2", ep()), &rule("r2")).await.unwrap();

        a1.backend.store().put("k".into(), "one".into()).await.unwrap();
        a2.backend.store().put("k".into(), "two".into()).await.unwrap();

        let conn = f.factory.connection(&ep()).unwrap();
        assert_eq!(conn.store_of("r1").get("k").as_deref(), Some("one"));
        assert_eq!(conn.store_of("r2").get("k").as_deref(), Some("two"));
    }
}
