// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound notifications for operators and metrics.
//!
//! The orchestrator holds one injected [`SyncObserver`], which is anything
//! implementing both [`ConnectorObserver`] and [`BackendObserver`].
//! [`TracingObserver`] is the default: it logs every notification and
//! records it through [`crate::metrics`].

use crate::error::SyncError;
use crate::identifier::{Endpoint, Identifier};
use crate::metrics;
use tracing::{error, info, warn};

/// Connector (engine instance) notifications.
pub trait ConnectorObserver: Send + Sync {
    fn connector_started(&self, identifier: &Identifier);
    fn connector_stopped(&self, identifier: &Identifier);
    fn connector_failed(&self, identifier: &Identifier, error: &SyncError);
}

/// Backend connection and membership notifications.
pub trait BackendObserver: Send + Sync {
    /// `reconnect` is true when a previously stopped connection came back.
    fn backend_started(&self, endpoint: &Endpoint, reconnect: bool);
    fn backend_stopped(&self, endpoint: &Endpoint);
    fn backend_failed(&self, endpoint: &Endpoint, error: &SyncError, reconnect: bool);
    fn member_joined(&self, endpoint: &Endpoint);
    fn member_left(&self, endpoint: &Endpoint);
}

/// Full observer capability set.
pub trait SyncObserver: ConnectorObserver + BackendObserver {}

impl<T: ConnectorObserver + BackendObserver> SyncObserver for T {}

/// Logs notifications and records them as metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ConnectorObserver for TracingObserver {
    fn connector_started(&self, identifier: &Identifier) {
        info!(identifier = %identifier, "Connector started");
        metrics::set_connector_state(identifier, "running");
    }

    fn connector_stopped(&self, identifier: &Identifier) {
        info!(identifier = %identifier, "Connector stopped");
        metrics::set_connector_state(identifier, "stopped");
    }

    fn connector_failed(&self, identifier: &Identifier, error: &SyncError) {
        warn!(identifier = %identifier, error = %error, "Connector failed");
        metrics::record_connector_failure(identifier);
    }
}

impl BackendObserver for TracingObserver {
    fn backend_started(&self, endpoint: &Endpoint, reconnect: bool) {
        if reconnect {
            info!(endpoint = %endpoint, "Backend reconnected");
            metrics::record_backend_reconnect(endpoint);
        } else {
            info!(endpoint = %endpoint, "Backend started");
        }
        metrics::set_backend_connected(endpoint, true);
    }

    fn backend_stopped(&self, endpoint: &Endpoint) {
        info!(endpoint = %endpoint, "Backend stopped");
        metrics::set_backend_connected(endpoint, false);
    }

    fn backend_failed(&self, endpoint: &Endpoint, error: &SyncError, reconnect: bool) {
        error!(endpoint = %endpoint, error = %error, reconnect, "Backend failed");
        metrics::set_backend_connected(endpoint, false);
    }

    fn member_joined(&self, endpoint: &Endpoint) {
        info!(endpoint = %endpoint, "Member joined");
        metrics::record_member_change("joined");
    }

    fn member_left(&self, endpoint: &Endpoint) {
        info!(endpoint = %endpoint, "Member left");
        metrics::record_member_change("left");
    }
}

/// One notification captured by [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedEvent {
    ConnectorStarted(Identifier),
    ConnectorStopped(Identifier),
    ConnectorFailed(Identifier),
    BackendStarted { endpoint: Endpoint, reconnect: bool },
    BackendStopped(Endpoint),
    BackendFailed { endpoint: Endpoint, reconnect: bool },
    MemberJoined(Endpoint),
    MemberLeft(Endpoint),
}

/// Observer that keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications in the order they were received.
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, predicate: impl Fn(&ObservedEvent) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }

    fn push(&self, event: ObservedEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl ConnectorObserver for RecordingObserver {
    fn connector_started(&self, identifier: &Identifier) {
        self.push(ObservedEvent::ConnectorStarted(identifier.clone()));
    }

    fn connector_stopped(&self, identifier: &Identifier) {
        self.push(ObservedEvent::ConnectorStopped(identifier.clone()));
    }

    fn connector_failed(&self, identifier: &Identifier, _error: &SyncError) {
        self.push(ObservedEvent::ConnectorFailed(identifier.clone()));
    }
}

impl BackendObserver for RecordingObserver {
    fn backend_started(&self, endpoint: &Endpoint, reconnect: bool) {
        self.push(ObservedEvent::BackendStarted {
            endpoint: endpoint.clone(),
            reconnect,
        });
    }

    fn backend_stopped(&self, endpoint: &Endpoint) {
        self.push(ObservedEvent::BackendStopped(endpoint.clone()));
    }

    fn backend_failed(&self, endpoint: &Endpoint, _error: &SyncError, reconnect: bool) {
        self.push(ObservedEvent::BackendFailed {
            endpoint: endpoint.clone(),
            reconnect,
        });
    }

    fn member_joined(&self, endpoint: &Endpoint) {
        self.push(ObservedEvent::MemberJoined(endpoint.clone()));
    }

    fn member_left(&self, endpoint: &Endpoint) {
        self.push(ObservedEvent::MemberLeft(endpoint.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer_order() {
        let observer = RecordingObserver::new();
        let ep = Endpoint::new("redis://a:6379");
        let id = Identifier::new("orders", ep.clone());

        observer.member_joined(&ep);
        observer.backend_started(&ep, false);
        observer.connector_started(&id);
        observer.connector_failed(&id, &SyncError::Shutdown);

        assert_eq!(
            observer.events(),
            vec![
                ObservedEvent::MemberJoined(ep.clone()),
                ObservedEvent::BackendStarted { endpoint: ep, reconnect: false },
                ObservedEvent::ConnectorStarted(id.clone()),
                ObservedEvent::ConnectorFailed(id),
            ]
        );
        assert_eq!(
            observer.count(|e| matches!(e, ObservedEvent::ConnectorStarted(_))),
            1
        );
    }

    #[test]
    fn test_tracing_observer_is_sync_observer() {
        fn assert_observer<O: SyncObserver>(_: &O) {}
        assert_observer(&TracingObserver);
        assert_observer(&RecordingObserver::new());
    }
}
