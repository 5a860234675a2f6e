// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the synchronization core.
//!
//! Errors are split into two families: transient failures that the retry
//! subsystem absorbs, and fatal errors that surface to the direct caller.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Connection` | Yes | Cache member unreachable, connection dropped |
//! | `Backend` | Yes | put/remove against a member failed |
//! | `Redis` | Yes | Redis command or transport error |
//! | `Capture` | Yes | Capture engine failed to start or stop |
//! | `Discovery` | Yes | Member hostname did not resolve |
//! | `Config` | No | Configuration invalid |
//! | `Decode` | No | Raw change record could not be decoded |
//! | `RuleConflict` | No | A rule with the same name and another definition exists |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `Shutdown` | No | The orchestrator is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`SyncError::is_retryable()`] is the failure predicate of every connector
//! retry loop: a retryable error reschedules the loop, anything else ends it.

use crate::identifier::Identifier;
use thiserror::Error;

/// Result type alias for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur in the synchronization core.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Connection to a cache member failed or was lost.
    #[error("Connection error ({endpoint}): {message}")]
    Connection { endpoint: String, message: String },

    /// A put/remove against a rule backend failed.
    #[error("Backend error ({endpoint}): {message}")]
    Backend { endpoint: String, message: String },

    /// Redis command or transport error.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// The capture engine reported an error.
    #[error("Capture engine error ({identifier}): {message}")]
    Capture { identifier: String, message: String },

    /// Member discovery failed.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Invalid or missing configuration.
    ///
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A raw change record could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Attempt to register a rule whose name is taken by another definition.
    ///
    /// Rules are immutable; update is unsupported.
    #[error("Rule '{rule}' already exists with a different definition")]
    RuleConflict { rule: String },

    /// Lifecycle state machine violation.
    ///
    /// Occurs when a transition is attempted from the wrong state
    /// (e.g. `start()` on a shut down engine). Indicates a bug in the caller.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a Redis error from a `redis::RedisError`.
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a connection error for an endpoint.
    pub fn connection(endpoint: impl ToString, message: impl Into<String>) -> Self {
        Self::Connection {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    /// Create a backend error for an endpoint.
    pub fn backend(endpoint: impl ToString, message: impl Into<String>) -> Self {
        Self::Backend {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    /// Create a capture engine error for an identifier.
    pub fn capture(identifier: &Identifier, message: impl Into<String>) -> Self {
        Self::Capture {
            identifier: identifier.to_string(),
            message: message.into(),
        }
    }

    /// Create an invalid-state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl ToString) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Backend { .. } => true,
            Self::Redis { .. } => true,
            Self::Capture { .. } => true,
            Self::Discovery(_) => true,
            Self::Config(_) => false,
            Self::Decode(_) => false,
            Self::RuleConflict { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<redis::RedisError> for SyncError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Endpoint;

    #[test]
    fn test_is_retryable_connection() {
        let err = SyncError::connection("redis://10.0.0.1:6379", "connection refused");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("10.0.0.1"));
    }

    #[test]
    fn test_is_retryable_backend() {
        let err = SyncError::backend("redis://a:6379", "SET failed");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("SET failed"));
    }

    #[test]
    fn test_is_retryable_capture() {
        let id = Identifier::new("customers", Endpoint::new("redis://a:6379"));
        let err = SyncError::capture(&id, "slot busy");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("customers"));
    }

    #[test]
    fn test_is_retryable_discovery() {
        assert!(SyncError::Discovery("NXDOMAIN".into()).is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = SyncError::invalid_state("Stopped", "Shutdown");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Stopped"));
        assert!(err.to_string().contains("Shutdown"));
    }

    #[test]
    fn test_not_retryable_rule_conflict() {
        let err = SyncError::RuleConflict {
            rule: "orders".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_not_retryable_misc() {
        assert!(!SyncError::Config("bad".into()).is_retryable());
        assert!(!SyncError::Decode("bad".into()).is_retryable());
        assert!(!SyncError::Shutdown.is_retryable());
        assert!(!SyncError::Internal("oops".into()).is_retryable());
    }

    #[test]
    fn test_redis_error_formatting() {
        let err = SyncError::Redis {
            operation: "HMGET".to_string(),
            message: "timeout".to_string(),
            source: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("Redis error"));
        assert!(msg.contains("HMGET"));
        assert!(msg.contains("timeout"));
        assert!(err.is_retryable());
    }
}
