//! # CDC Cache Sync
//!
//! Control plane that keeps a distributed cache in sync with a relational
//! source through change-data capture.
//!
//! ## Architecture
//!
//! One capture engine runs per `(rule, member)` pair. Engines on the same
//! member share one connection; each rule gets its own backend on it.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────────┐
//! │                               Orchestrator                                 │
//! │   rules × members ──▶ EngineLifecycle (per Identifier) ──▶ CaptureEngine   │
//! │         ▲                        │                              │          │
//! │         │ joined/left            │ start/stop                   │ batches  │
//! │  ┌──────────────────┐   ┌────────▼──────────────┐   ┌───────────▼───────┐  │
//! │  │MembershipListener│   │ ConnectionMultiplexer │◀──│ BatchCoordinator  │  │
//! │  │ (DNS poll)       │   │ one connection/member │   │ coalesce → apply  │  │
//! │  └──────────────────┘   └───────────────────────┘   └───────────────────┘  │
//! │                                                                            │
//! │   failures ──▶ stop ──▶ RetryTask(healthy? → restart) on the Scheduler     │
//! └────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cdc_cache_sync::{Orchestrator, RedisConnectionFactory, SyncConfig, TracingObserver};
//! use cdc_cache_sync::capture::CaptureEngineFactory;
//! use std::sync::Arc;
//!
//! async fn run(capture: Arc<dyn CaptureEngineFactory>) -> cdc_cache_sync::Result<()> {
//!     let config = SyncConfig::default();
//!     let connections = Arc::new(RedisConnectionFactory::from_config(&config));
//!     let orchestrator = Orchestrator::new(config, connections, capture, Arc::new(TracingObserver))?;
//!     orchestrator.start().await?;
//!
//!     // Runs until shutdown
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod capture;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod identifier;
pub mod lifecycle;
pub mod membership;
pub mod memory;
pub mod metrics;
pub mod multiplexer;
pub mod observer;
pub mod pipeline;
pub mod redis_store;
pub mod resilience;
pub mod retry;
pub mod rule;
pub mod store;

// Re-exports for convenience
pub use batch::{BatchCoordinator, BatchResult};
pub use capture::{CaptureEngine, CaptureEngineFactory, CaptureSession, RecordCommitter};
pub use config::{DiscoveryConfig, EndpointTemplate, SyncConfig};
pub use coordinator::{HealthCheck, Notification, Notifier, Orchestrator, OrchestratorState};
pub use error::{Result, SyncError};
pub use event::{Event, Operation, RawRecord, SourceTable};
pub use identifier::{Endpoint, Identifier};
pub use lifecycle::{EngineLifecycle, EngineState};
pub use membership::{Discovery, DnsDiscovery, MembershipListener};
pub use memory::MemoryConnectionFactory;
pub use multiplexer::ConnectionMultiplexer;
pub use observer::{BackendObserver, ConnectorObserver, SyncObserver, TracingObserver};
pub use pipeline::EventPipeline;
pub use redis_store::RedisConnectionFactory;
pub use retry::{RetryTask, Scheduler};
pub use rule::{Rule, TableRef};
pub use store::{CacheStore, ConnectionFactory, ConnectionListener};
