// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache cluster integration traits.
//!
//! Defines what the core needs from the client of the target cache cluster.
//! The wire protocol lives behind these traits; the crate ships a Redis
//! implementation ([`crate::redis_store`]) and an in-process one
//! ([`crate::memory`]).
//!
//! ```text
//! ConnectionFactory ──connect()──▶ CacheConnection (one per member)
//!                                    ├── provision() → EnginePersistence
//!                                    │                  ├── OffsetStore
//!                                    │                  └── SchemaHistory
//!                                    └── store(rule) → CacheStore (put/remove)
//! ```

use crate::coordinator::Notifier;
use crate::error::{Result, SyncError};
use crate::identifier::Endpoint;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for boxed async results (keeps trait signatures readable).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Target of one rule's put/remove operations on one member.
pub trait CacheStore: Send + Sync {
    fn put(&self, key: String, value: String) -> BoxFuture<'_, ()>;
    fn remove(&self, key: String) -> BoxFuture<'_, ()>;
}

/// Replay-offset storage handed to the capture engine.
pub trait OffsetStore: Send + Sync {
    /// Values for the requested keys; missing keys are absent from the map.
    fn get(&self, keys: Vec<String>) -> BoxFuture<'_, HashMap<String, String>>;
    fn set(&self, values: HashMap<String, String>) -> BoxFuture<'_, ()>;
}

/// Append-only schema history log handed to the capture engine.
pub trait SchemaHistory: Send + Sync {
    fn store(&self, record: String) -> BoxFuture<'_, ()>;
    /// All stored records in insertion order.
    fn recover(&self) -> BoxFuture<'_, Vec<String>>;
}

/// The two persistence structures a capture engine needs.
#[derive(Clone)]
pub struct EnginePersistence {
    pub offsets: Arc<dyn OffsetStore>,
    pub history: Arc<dyn SchemaHistory>,
}

/// One physical connection to a cache cluster member.
pub trait CacheConnection: Send + Sync {
    fn start(&self) -> BoxFuture<'_, ()>;
    fn stop(&self) -> BoxFuture<'_, ()>;
    /// Probe the member; used while a connector is retrying.
    fn is_healthy(&self) -> BoxFuture<'_, bool>;
    /// Create (if needed) and hand out the shared persistence structures.
    fn provision(&self) -> BoxFuture<'_, EnginePersistence>;
    /// put/remove target for one rule.
    fn store(&self, rule: &str) -> Arc<dyn CacheStore>;
}

/// Creates connections; does not connect them.
pub trait ConnectionFactory: Send + Sync {
    fn create(
        &self,
        endpoint: &Endpoint,
        listener: ConnectionListener,
    ) -> Result<Arc<dyn CacheConnection>>;
}

/// Handle a connection uses to report that it failed.
///
/// A failure is reported once per connection and fans out to every
/// backend sharing it.
#[derive(Clone)]
pub struct ConnectionListener {
    endpoint: Endpoint,
    notifier: Notifier,
}

impl ConnectionListener {
    pub fn new(endpoint: Endpoint, notifier: Notifier) -> Self {
        Self { endpoint, notifier }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn failed(&self, error: SyncError) {
        self.notifier.backend_failed(self.endpoint.clone(), error);
    }
}
