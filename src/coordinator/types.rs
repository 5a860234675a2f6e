//! Orchestrator types.
//!
//! Defines the orchestrator state machine, the inbound notification
//! messages, and the health snapshot.
//!
//! # State Transitions
//!
//! ```text
//!            start()               shutdown()
//! Created ───────────→ Running ───────────→ ShuttingDown ───→ Stopped
//!    │                                                           ↑
//!    └───────────────────────── shutdown() ──────────────────────┘
//! ```

use crate::error::SyncError;
use crate::identifier::{Endpoint, Identifier};
use tokio::sync::mpsc;
use tracing::debug;

/// State of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Constructed; rules may be registered but no dispatcher runs yet.
    Created,
    /// Dispatcher and membership polling are running.
    Running,
    /// `shutdown()` in progress.
    ShuttingDown,
    /// Every engine has been shut down.
    Stopped,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorState::Created => write!(f, "Created"),
            OrchestratorState::Running => write!(f, "Running"),
            OrchestratorState::ShuttingDown => write!(f, "ShuttingDown"),
            OrchestratorState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Inbound notification handled by the orchestrator's dispatcher.
#[derive(Debug)]
pub enum Notification {
    /// A capture engine (or its batch application) failed.
    EngineFailed {
        identifier: Identifier,
        error: SyncError,
    },
    /// A shared connection to a member failed.
    BackendFailed { endpoint: Endpoint, error: SyncError },
    MemberJoined(Endpoint),
    MemberLeft(Endpoint),
}

/// Sending half of the orchestrator's notification channel.
///
/// Cloned into capture sessions, connections and the membership listener.
/// Sending never blocks; notifications sent after shutdown are dropped.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    /// Create a notifier and the receiver the dispatcher drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, notification: Notification) {
        if let Err(e) = self.tx.send(notification) {
            debug!(notification = ?e.0, "Orchestrator gone, notification dropped");
        }
    }

    pub fn engine_failed(&self, identifier: Identifier, error: SyncError) {
        self.send(Notification::EngineFailed { identifier, error });
    }

    pub fn backend_failed(&self, endpoint: Endpoint, error: SyncError) {
        self.send(Notification::BackendFailed { endpoint, error });
    }

    pub fn member_joined(&self, endpoint: Endpoint) {
        self.send(Notification::MemberJoined(endpoint));
    }

    pub fn member_left(&self, endpoint: Endpoint) {
        self.send(Notification::MemberLeft(endpoint));
    }
}

/// Point-in-time health snapshot for monitoring endpoints.
///
/// Built from cached state only; no network I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: OrchestratorState,
    pub rules: usize,
    pub members: usize,
    pub connections: usize,
    pub engines_total: usize,
    pub engines_running: usize,
    pub engines_retrying: usize,
    pub engines_stopped: usize,
    /// Running, and no engine is stuck retrying.
    pub healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestrator_state_display() {
        assert_eq!(OrchestratorState::Created.to_string(), "Created");
        assert_eq!(OrchestratorState::Running.to_string(), "Running");
        assert_eq!(OrchestratorState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(OrchestratorState::Stopped.to_string(), "Stopped");
    }

    #[tokio::test]
    async fn test_notifier_delivers_in_order() {
        let (notifier, mut rx) = Notifier::channel();
        let ep = Endpoint::new("redis://a:6379");

        notifier.member_joined(ep.clone());
        notifier.member_left(ep.clone());

        assert!(matches!(rx.recv().await, Some(Notification::MemberJoined(e)) if e == ep));
        assert!(matches!(rx.recv().await, Some(Notification::MemberLeft(e)) if e == ep));
    }

    #[test]
    fn test_notifier_after_receiver_dropped() {
        let (notifier, rx) = Notifier::channel();
        drop(rx);
        // Dropped silently.
        notifier.member_joined(Endpoint::new("redis://a:6379"));
    }
}
