// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis implementation of the cache cluster contracts.
//!
//! One [`RedisConnection`] per member wraps a `redis::aio::ConnectionManager`
//! (multiplexed, so every rule backend and both persistence structures share
//! it). Layout on each member:
//!
//! | Structure | Redis type | Commands |
//! |-----------|------------|----------|
//! | `{prefix}offsets` | hash | `HMGET`, `HSET` |
//! | `{prefix}schema-history` | list | `RPUSH`, `LRANGE 0 -1` |
//! | cached rows | strings | `SET`, `DEL` |
//!
//! I/O-class errors (dropped/refused connections, timeouts) are reported to
//! the connection listener once per connect, which fans them out to every
//! rule sharing the member.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> cdc_cache_sync::Result<()> {
//! use cdc_cache_sync::config::SyncConfig;
//! use cdc_cache_sync::redis_store::RedisConnectionFactory;
//!
//! let factory = RedisConnectionFactory::from_config(&SyncConfig::default());
//! # let _ = factory;
//! # Ok(())
//! # }
//! ```

use crate::config::{StoreConfig, SyncConfig};
use crate::error::{Result, SyncError};
use crate::identifier::Endpoint;
use crate::resilience::with_timeout;
use crate::store::{
    BoxFuture, CacheConnection, CacheStore, ConnectionFactory, ConnectionListener,
    EnginePersistence, OffsetStore, SchemaHistory,
};
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Creates one [`RedisConnection`] per member endpoint.
#[derive(Debug, Clone)]
pub struct RedisConnectionFactory {
    store: StoreConfig,
    connection_timeout: Duration,
}

impl RedisConnectionFactory {
    pub fn new(store: StoreConfig, connection_timeout: Duration) -> Self {
        Self {
            store,
            connection_timeout,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.store.clone(),
            config.retry.connection_timeout_duration(),
        )
    }
}

impl ConnectionFactory for RedisConnectionFactory {
    fn create(
        &self,
        endpoint: &Endpoint,
        listener: ConnectionListener,
    ) -> Result<Arc<dyn CacheConnection>> {
        let client = Client::open(endpoint.as_str())
            .map_err(|e| SyncError::Config(format!("Invalid Redis URL for {}: {}", endpoint, e)))?;

        Ok(Arc::new(RedisConnection {
            shared: Arc::new(RedisShared {
                endpoint: endpoint.clone(),
                client,
                conn: RwLock::new(None),
                listener,
                reported: AtomicBool::new(false),
                offsets_key: self.store.offsets_key(),
                history_key: self.store.schema_history_key(),
                timeout: self.connection_timeout,
            }),
        }))
    }
}

/// State shared by a connection and the handles it gives out.
struct RedisShared {
    endpoint: Endpoint,
    client: Client,
    /// ConnectionManager is Clone and multiplexed, so sharing is cheap.
    conn: RwLock<Option<ConnectionManager>>,
    listener: ConnectionListener,
    /// Failure already reported for the current connect.
    reported: AtomicBool,
    offsets_key: String,
    history_key: String,
    timeout: Duration,
}

impl RedisShared {
    async fn connection(&self) -> Result<ConnectionManager> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| SyncError::connection(&self.endpoint, "Not connected"))
    }

    /// Wrap a command error, reporting connection-level ones to the listener.
    fn command_error(&self, operation: &str, e: RedisError) -> SyncError {
        let connection_level =
            e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout();
        if connection_level && !self.reported.swap(true, Ordering::AcqRel) {
            warn!(endpoint = %self.endpoint, operation, error = %e, "Connection to member failed");
            self.listener.failed(SyncError::connection(
                &self.endpoint,
                format!("{} failed: {}", operation, e),
            ));
        }
        SyncError::redis(operation, e)
    }

    async fn ping(&self) -> Result<bool> {
        let held = self.conn.read().await.clone();
        let reply: std::result::Result<String, RedisError> = match held {
            Some(mut conn) => redis::cmd("PING").query_async(&mut conn).await,
            None => {
                let mut conn = with_timeout(&self.endpoint, self.timeout, async {
                    self.client
                        .get_multiplexed_async_connection()
                        .await
                        .map_err(|e| SyncError::redis("connect", e))
                })
                .await?;
                redis::cmd("PING").query_async(&mut conn).await
            }
        };
        let reply = reply.map_err(|e| SyncError::redis("PING", e))?;
        Ok(reply == "PONG")
    }
}

/// One member connection.
pub struct RedisConnection {
    shared: Arc<RedisShared>,
}

impl CacheConnection for RedisConnection {
    fn start(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let shared = &self.shared;
            let conn = with_timeout(&shared.endpoint, shared.timeout, async {
                shared
                    .client
                    .get_connection_manager()
                    .await
                    .map_err(|e| SyncError::redis("connect", e))
            })
            .await?;

            *shared.conn.write().await = Some(conn);
            shared.reported.store(false, Ordering::Release);
            info!(endpoint = %shared.endpoint, "Connected to member");
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.shared.conn.write().await.take().is_some() {
                info!(endpoint = %self.shared.endpoint, "Disconnected from member");
            }
            Ok(())
        })
    }

    fn is_healthy(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let shared = &self.shared;
            match with_timeout(&shared.endpoint, shared.timeout, shared.ping()).await {
                Ok(healthy) => Ok(healthy),
                Err(e) => {
                    debug!(endpoint = %shared.endpoint, error = %e, "Health probe failed");
                    Ok(false)
                }
            }
        })
    }

    fn provision(&self) -> BoxFuture<'_, EnginePersistence> {
        Box::pin(async move {
            // Hash and list are created by their first write.
            let mut conn = self.shared.connection().await?;
            let _: () = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| self.shared.command_error("PING", e))?;

            debug!(
                endpoint = %self.shared.endpoint,
                offsets = %self.shared.offsets_key,
                history = %self.shared.history_key,
                "Persistence provisioned"
            );
            Ok(EnginePersistence {
                offsets: Arc::new(RedisOffsetStore {
                    shared: Arc::clone(&self.shared),
                }),
                history: Arc::new(RedisSchemaHistory {
                    shared: Arc::clone(&self.shared),
                }),
            })
        })
    }

    fn store(&self, rule: &str) -> Arc<dyn CacheStore> {
        Arc::new(RedisCacheStore {
            shared: Arc::clone(&self.shared),
            rule: rule.to_string(),
        })
    }
}

/// `SET`/`DEL` target of one rule.
struct RedisCacheStore {
    shared: Arc<RedisShared>,
    rule: String,
}

impl CacheStore for RedisCacheStore {
    fn put(&self, key: String, value: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.shared.connection().await?;
            let _: () = redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .query_async(&mut conn)
                .await
                .map_err(|e| self.shared.command_error("SET", e))?;
            debug!(rule = %self.rule, key = %key, "SET");
            Ok(())
        })
    }

    fn remove(&self, key: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.shared.connection().await?;
            let _: i64 = redis::cmd("DEL")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(|e| self.shared.command_error("DEL", e))?;
            debug!(rule = %self.rule, key = %key, "DEL");
            Ok(())
        })
    }
}

struct RedisOffsetStore {
    shared: Arc<RedisShared>,
}

impl OffsetStore for RedisOffsetStore {
    fn get(&self, keys: Vec<String>) -> BoxFuture<'_, HashMap<String, String>> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(HashMap::new());
            }
            let mut conn = self.shared.connection().await?;
            let values: Vec<Option<String>> = redis::cmd("HMGET")
                .arg(&self.shared.offsets_key)
                .arg(&keys)
                .query_async(&mut conn)
                .await
                .map_err(|e| self.shared.command_error("HMGET", e))?;

            Ok(keys
                .into_iter()
                .zip(values)
                .filter_map(|(k, v)| v.map(|v| (k, v)))
                .collect())
        })
    }

    fn set(&self, values: HashMap<String, String>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if values.is_empty() {
                return Ok(());
            }
            let mut conn = self.shared.connection().await?;
            let mut cmd = redis::cmd("HSET");
            cmd.arg(&self.shared.offsets_key);
            for (k, v) in &values {
                cmd.arg(k).arg(v);
            }
            let _: i64 = cmd
                .query_async(&mut conn)
                .await
                .map_err(|e| self.shared.command_error("HSET", e))?;
            Ok(())
        })
    }
}

struct RedisSchemaHistory {
    shared: Arc<RedisShared>,
}

impl SchemaHistory for RedisSchemaHistory {
    fn store(&self, record: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.shared.connection().await?;
            let _: i64 = redis::cmd("RPUSH")
                .arg(&self.shared.history_key)
                .arg(&record)
                .query_async(&mut conn)
                .await
                .map_err(|e| self.shared.command_error("RPUSH", e))?;
            Ok(())
        })
    }

    fn recover(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            let mut conn = self.shared.connection().await?;
            let records: Vec<String> = redis::cmd("LRANGE")
                .arg(&self.shared.history_key)
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await
                .map_err(|e| self.shared.command_error("LRANGE", e))?;
            Ok(records)
        })
    }
}
