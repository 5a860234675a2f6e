//! Configuration for the synchronization core.
//!
//! Configuration is passed to [`Orchestrator::new()`](crate::Orchestrator::new),
//! validated once there, and never mutated afterwards. It can be built
//! programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use cdc_cache_sync::config::SyncConfig;
//!
//! let config = SyncConfig {
//!     members: vec!["redis://cache-1:6379".into()],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── members: Vec<String>          # static members (discovery disabled)
//! ├── rules: Vec<Rule>              # rules registered at start()
//! ├── discovery: DiscoveryConfig    # DNS membership polling
//! │   └── template: EndpointTemplate
//! ├── retry: ConnectorRetryConfig   # failed-connector recovery
//! ├── pipeline: PipelineConfig      # batch application
//! ├── store: StoreConfig            # names of provisioned structures
//! └── scheduler: SchedulerConfig    # retry/poll scheduler thread
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! discovery:
//!   enabled: true
//!   hostname: "cache.internal.svc"
//!   poll_interval: "15s"
//!   template:
//!     scheme: "redis"
//!     port: 6379
//!
//! retry:
//!   interval: "10s"
//!
//! rules:
//!   - name: "customers"
//!     table: { schema: "public", table: "customer" }
//!     key: { columns: ["id"] }
//! ```

use crate::error::{Result, SyncError};
use crate::identifier::Endpoint;
use crate::rule::Rule;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Orchestrator::new()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Static member endpoints. Joined once at start when discovery is disabled.
    #[serde(default)]
    pub members: Vec<String>,

    /// Rules registered at start.
    #[serde(default)]
    pub rules: Vec<Rule>,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub retry: ConnectorRetryConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl SyncConfig {
    /// Create a minimal config for testing: no discovery, shared runtime scheduler.
    pub fn for_testing() -> Self {
        Self {
            scheduler: SchedulerConfig {
                dedicated: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate once at construction.
    pub fn validate(&self) -> Result<()> {
        if self.discovery.enabled && self.discovery.hostname.trim().is_empty() {
            return Err(SyncError::Config(
                "discovery is enabled but no hostname is configured".into(),
            ));
        }
        if self.discovery.template.port == 0 {
            return Err(SyncError::Config("endpoint template port is 0".into()));
        }
        if self.pipeline.max_concurrent_applies == 0 {
            return Err(SyncError::Config(
                "pipeline.max_concurrent_applies must be at least 1".into(),
            ));
        }
        for member in &self.members {
            let endpoint = Endpoint::new(member);
            if endpoint.scheme().is_none() || endpoint.authority().is_empty() {
                return Err(SyncError::Config(format!(
                    "static member '{}' is not a URI",
                    member
                )));
            }
        }
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }

    /// Static members as endpoints.
    pub fn static_members(&self) -> Vec<Endpoint> {
        self.members.iter().map(Endpoint::new).collect()
    }
}

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

fn default_true() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// DiscoveryConfig: membership polling
// ═══════════════════════════════════════════════════════════════════════════════

/// DNS-based membership discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Hostname resolving to every member address.
    #[serde(default)]
    pub hostname: String,

    /// Poll interval as a duration string (e.g., "15s").
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    #[serde(default)]
    pub template: EndpointTemplate,
}

fn default_poll_interval() -> String {
    "15s".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hostname: String::new(),
            poll_interval: default_poll_interval(),
            template: EndpointTemplate::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn poll_interval_duration(&self) -> Duration {
        parse_duration_or(&self.poll_interval, Duration::from_secs(15))
    }
}

/// Turns a resolved address into a full member URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointTemplate {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Query string without the leading `?`.
    #[serde(default)]
    pub query: Option<String>,
}

fn default_scheme() -> String {
    "redis".to_string()
}

fn default_port() -> u16 {
    6379
}

impl Default for EndpointTemplate {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            username: None,
            password: None,
            port: default_port(),
            query: None,
        }
    }
}

impl EndpointTemplate {
    pub fn endpoint_for(&self, addr: IpAddr) -> Endpoint {
        let credentials = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
            (Some(user), None) => format!("{}@", user),
            (None, Some(pass)) => format!(":{}@", pass),
            (None, None) => String::new(),
        };
        let host = match addr {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{}]", v6),
        };
        let query = match &self.query {
            Some(q) if !q.is_empty() => format!("/?{}", q),
            _ => String::new(),
        };
        Endpoint::new(format!(
            "{}://{}{}:{}{}",
            self.scheme, credentials, host, self.port, query
        ))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConnectorRetryConfig: failed-connector recovery
// ═══════════════════════════════════════════════════════════════════════════════

/// Recovery of failed connectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorRetryConfig {
    /// Interval between health polls of a failed connector's member.
    #[serde(default = "default_retry_interval")]
    pub interval: String,

    /// Timeout for each connection attempt to a member.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: String,
}

fn default_retry_interval() -> String {
    "10s".to_string()
}

fn default_connection_timeout() -> String {
    "5s".to_string()
}

impl Default for ConnectorRetryConfig {
    fn default() -> Self {
        Self {
            interval: default_retry_interval(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

impl ConnectorRetryConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_duration_or(&self.interval, Duration::from_secs(10))
    }

    pub fn connection_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.connection_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PipelineConfig / StoreConfig / SchedulerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Batch application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum deduplicated events applied concurrently per batch.
    #[serde(default = "default_max_concurrent_applies")]
    pub max_concurrent_applies: usize,
}

fn default_max_concurrent_applies() -> usize {
    32
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_applies: default_max_concurrent_applies(),
        }
    }
}

/// Names of the structures provisioned on each member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Prefix of the offset-store and schema-history keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "__cdc_sync__:".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
        }
    }
}

impl StoreConfig {
    pub fn offsets_key(&self) -> String {
        format!("{}offsets", self.key_prefix)
    }

    pub fn schema_history_key(&self) -> String {
        format!("{}schema-history", self.key_prefix)
    }
}

/// Scheduler for retry loops and membership polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Run on a dedicated single-threaded runtime instead of the caller's.
    #[serde(default = "default_true")]
    pub dedicated: bool,

    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

fn default_thread_name() -> String {
    "cdc-sync-scheduler".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dedicated: true,
            thread_name: default_thread_name(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
