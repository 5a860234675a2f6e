// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process cache cluster.
//!
//! Implements the [`crate::store`] contracts without a network: every member
//! is a [`MemoryConnection`] holding its data in maps. Health and failures
//! can be switched from the outside, which makes it the backbone of the
//! orchestration tests and of local runs without Redis.
//!
//! ```rust
//! # async fn example() -> cdc_cache_sync::Result<()> {
//! use cdc_cache_sync::memory::MemoryConnectionFactory;
//! use cdc_cache_sync::store::ConnectionFactory;
//! use cdc_cache_sync::{ConnectionListener, Endpoint, Notifier};
//!
//! let factory = MemoryConnectionFactory::new();
//! let (notifier, _rx) = Notifier::channel();
//! let ep = Endpoint::new("mem://a");
//! let conn = factory.create(&ep, ConnectionListener::new(ep.clone(), notifier))?;
//! conn.start().await?;
//! conn.store("orders").put("k".into(), "v".into()).await?;
//! assert_eq!(factory.connection(&ep).unwrap().store_of("orders").get("k").as_deref(), Some("v"));
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, SyncError};
use crate::identifier::Endpoint;
use crate::store::{
    BoxFuture, CacheConnection, CacheStore, ConnectionFactory, ConnectionListener,
    EnginePersistence, OffsetStore, SchemaHistory,
};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Factory
// =============================================================================

/// Creates [`MemoryConnection`]s and keeps the latest one per endpoint.
#[derive(Default)]
pub struct MemoryConnectionFactory {
    connections: DashMap<Endpoint, Arc<MemoryConnection>>,
    created: AtomicUsize,
    /// Endpoints whose next connections refuse to start.
    refusing: DashMap<Endpoint, ()>,
}

impl MemoryConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest connection created for `endpoint`.
    pub fn connection(&self, endpoint: &Endpoint) -> Option<Arc<MemoryConnection>> {
        self.connections.get(endpoint).map(|c| Arc::clone(c.value()))
    }

    /// Number of connections created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Make connections created from now on for `endpoint` fail to start.
    pub fn refuse(&self, endpoint: &Endpoint, refuse: bool) {
        if refuse {
            self.refusing.insert(endpoint.clone(), ());
        } else {
            self.refusing.remove(endpoint);
        }
        if let Some(conn) = self.connection(endpoint) {
            conn.set_fail_start(refuse);
        }
    }
}

impl ConnectionFactory for MemoryConnectionFactory {
    fn create(
        &self,
        endpoint: &Endpoint,
        listener: ConnectionListener,
    ) -> Result<Arc<dyn CacheConnection>> {
        let conn = Arc::new(MemoryConnection::new(endpoint.clone(), listener));
        if self.refusing.contains_key(endpoint) {
            conn.set_fail_start(true);
        }
        self.connections.insert(endpoint.clone(), Arc::clone(&conn));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(conn)
    }
}

// =============================================================================
// Connection
// =============================================================================

/// One simulated member connection.
pub struct MemoryConnection {
    endpoint: Endpoint,
    listener: ConnectionListener,
    started: AtomicBool,
    healthy: AtomicBool,
    fail_start: AtomicBool,
    /// Answers returned by `is_healthy()` before falling back to `healthy`.
    health_script: Mutex<VecDeque<bool>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    health_checks: AtomicUsize,
    provisions: AtomicUsize,
    stores: DashMap<String, Arc<MemoryStore>>,
    offsets: Arc<MemoryOffsetStore>,
    history: Arc<MemorySchemaHistory>,
}

impl MemoryConnection {
    pub fn new(endpoint: Endpoint, listener: ConnectionListener) -> Self {
        Self {
            endpoint,
            listener,
            started: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            fail_start: AtomicBool::new(false),
            health_script: Mutex::new(VecDeque::new()),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            health_checks: AtomicUsize::new(0),
            provisions: AtomicUsize::new(0),
            stores: DashMap::new(),
            offsets: Arc::new(MemoryOffsetStore::default()),
            history: Arc::new(MemorySchemaHistory::default()),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Queue answers for the next health checks.
    pub fn script_health(&self, answers: impl IntoIterator<Item = bool>) {
        lock(&self.health_script).extend(answers);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Simulate a dropped connection: reported once through the listener.
    pub fn fail(&self, message: &str) {
        self.started.store(false, Ordering::SeqCst);
        self.listener
            .failed(SyncError::connection(&self.endpoint, message));
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    pub fn provisions(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }

    /// Concrete store of one rule (created on first use).
    pub fn store_of(&self, rule: &str) -> Arc<MemoryStore> {
        Arc::clone(
            self.stores
                .entry(rule.to_string())
                .or_insert_with(|| Arc::new(MemoryStore::new(self.endpoint.clone())))
                .value(),
        )
    }

    pub fn offsets(&self) -> Arc<MemoryOffsetStore> {
        Arc::clone(&self.offsets)
    }

    pub fn history(&self) -> Arc<MemorySchemaHistory> {
        Arc::clone(&self.history)
    }
}

impl CacheConnection for MemoryConnection {
    fn start(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(SyncError::connection(&self.endpoint, "connection refused"));
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.started.store(false, Ordering::SeqCst);
            Ok(())
        })
    }

    fn is_healthy(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            self.health_checks.fetch_add(1, Ordering::SeqCst);
            let scripted = lock(&self.health_script).pop_front();
            Ok(scripted.unwrap_or_else(|| self.healthy.load(Ordering::SeqCst)))
        })
    }

    fn provision(&self) -> BoxFuture<'_, EnginePersistence> {
        Box::pin(async move {
            self.provisions.fetch_add(1, Ordering::SeqCst);
            Ok(EnginePersistence {
                offsets: self.offsets.clone(),
                history: self.history.clone(),
            })
        })
    }

    fn store(&self, rule: &str) -> Arc<dyn CacheStore> {
        self.store_of(rule)
    }
}

// =============================================================================
// Stores
// =============================================================================

/// One put/remove as seen by a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Put { key: String, value: String },
    Remove { key: String },
}

/// put/remove target keeping an operation log.
pub struct MemoryStore {
    endpoint: Endpoint,
    data: DashMap<String, String>,
    ops: Mutex<Vec<StoreOp>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            data: DashMap::new(),
            ops: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Every applied operation in application order.
    pub fn ops(&self) -> Vec<StoreOp> {
        lock(&self.ops).clone()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::backend(&self.endpoint, "write rejected"));
        }
        Ok(())
    }
}

impl CacheStore for MemoryStore {
    fn put(&self, key: String, value: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.check_writable()?;
            self.data.insert(key.clone(), value.clone());
            lock(&self.ops).push(StoreOp::Put { key, value });
            Ok(())
        })
    }

    fn remove(&self, key: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.check_writable()?;
            self.data.remove(&key);
            lock(&self.ops).push(StoreOp::Remove { key });
            Ok(())
        })
    }
}

/// Offset store backed by a map.
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    values: DashMap<String, String>,
}

impl OffsetStore for MemoryOffsetStore {
    fn get(&self, keys: Vec<String>) -> BoxFuture<'_, HashMap<String, String>> {
        Box::pin(async move {
            Ok(keys
                .into_iter()
                .filter_map(|k| self.values.get(&k).map(|v| (k, v.value().clone())))
                .collect())
        })
    }

    fn set(&self, values: HashMap<String, String>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for (k, v) in values {
                self.values.insert(k, v);
            }
            Ok(())
        })
    }
}

/// Schema history backed by a vector.
#[derive(Debug, Default)]
pub struct MemorySchemaHistory {
    records: Mutex<Vec<String>>,
}

impl SchemaHistory for MemorySchemaHistory {
    fn store(&self, record: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            lock(&self.records).push(record);
            Ok(())
        })
    }

    fn recover(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(lock(&self.records).clone()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{Notification, Notifier};

    fn factory_and_conn() -> (
        MemoryConnectionFactory,
        Arc<dyn CacheConnection>,
        tokio::sync::mpsc::UnboundedReceiver<Notification>,
    ) {
        let factory = MemoryConnectionFactory::new();
        let (notifier, rx) = Notifier::channel();
        let ep = Endpoint::new("mem://a");
        let conn = factory
            .create(&ep, ConnectionListener::new(ep.clone(), notifier))
            .unwrap();
        (factory, conn, rx)
    }

    #[tokio::test]
    async fn test_store_put_remove_logged() {
        let (factory, conn, _rx) = factory_and_conn();
        let store = conn.store("orders");
        store.put("k1".into(), "v1".into()).await.unwrap();
        store.remove("k1".into()).await.unwrap();

        let mem = factory.connection(&Endpoint::new("mem://a")).unwrap();
        let ops = mem.store_of("orders").ops();
        assert_eq!(
            ops,
            vec![
                StoreOp::Put { key: "k1".into(), value: "v1".into() },
                StoreOp::Remove { key: "k1".into() },
            ]
        );
        assert!(mem.store_of("orders").is_empty());
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let (factory, conn, _rx) = factory_and_conn();
        let mem = factory.connection(&Endpoint::new("mem://a")).unwrap();
        mem.store_of("orders").set_fail_writes(true);

        let err = conn.store("orders").put("k".into(), "v".into()).await.unwrap_err();
        assert!(matches!(err, SyncError::Backend { .. }));
        assert!(mem.store_of("orders").ops().is_empty());
    }

    #[tokio::test]
    async fn test_health_script_then_fallback() {
        let (factory, conn, _rx) = factory_and_conn();
        let mem = factory.connection(&Endpoint::new("mem://a")).unwrap();
        mem.set_healthy(true);
        mem.script_health([false, false]);

        assert!(!conn.is_healthy().await.unwrap());
        assert!(!conn.is_healthy().await.unwrap());
        assert!(conn.is_healthy().await.unwrap());
        assert_eq!(mem.health_checks(), 3);
    }

    #[tokio::test]
    async fn test_refused_start() {
        let factory = MemoryConnectionFactory::new();
        let (notifier, _rx) = Notifier::channel();
        let ep = Endpoint::new("mem://down");
        factory.refuse(&ep, true);

        let conn = factory
            .create(&ep, ConnectionListener::new(ep.clone(), notifier))
            .unwrap();
        assert!(conn.start().await.is_err());

        factory.refuse(&ep, false);
        conn.start().await.unwrap();
        assert_eq!(factory.connection(&ep).unwrap().starts(), 1);
    }

    #[tokio::test]
    async fn test_fail_notifies_listener() {
        let (factory, conn, mut rx) = factory_and_conn();
        conn.start().await.unwrap();
        let mem = factory.connection(&Endpoint::new("mem://a")).unwrap();
        mem.fail("reset by peer");

        assert!(!mem.is_started());
        match rx.recv().await {
            Some(Notification::BackendFailed { endpoint, error }) => {
                assert_eq!(endpoint, Endpoint::new("mem://a"));
                assert!(error.is_retryable());
            }
            other => panic!("unexpected notification: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_persistence_shared_and_ordered() {
        let (_factory, conn, _rx) = factory_and_conn();
        let p1 = conn.provision().await.unwrap();
        let p2 = conn.provision().await.unwrap();

        p1.offsets
            .set(HashMap::from([("lsn".to_string(), "42".to_string())]))
            .await
            .unwrap();
        let got = p2
            .offsets
            .get(vec!["lsn".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(got.get("lsn").map(String::as_str), Some("42"));
        assert!(!got.contains_key("missing"));

        p1.history.store("ddl-1".into()).await.unwrap();
        p2.history.store("ddl-2".into()).await.unwrap();
        assert_eq!(p1.history.recover().await.unwrap(), vec!["ddl-1", "ddl-2"]);
    }
}
