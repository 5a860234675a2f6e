// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cluster membership polling.
//!
//! The [`MembershipListener`] resolves a hostname at a fixed interval, turns
//! every address into a member endpoint through the [`EndpointTemplate`],
//! and reports the difference with the previous poll:
//!
//! ```text
//! resolve(hostname) ─▶ {10.0.0.1, 10.0.0.2} ─▶ template ─▶ {redis://10.0.0.1:6379, ...}
//!                                                              │
//!                            known set ◀── diff ───────────────┘
//!                                           ├── current − known → member_joined
//!                                           └── known − current → member_left
//! ```
//!
//! The poll loop is a [`RetryTask`] that never finishes: a failed resolution
//! is logged and treated as "no change" until the next poll.

use crate::config::{DiscoveryConfig, EndpointTemplate};
use crate::coordinator::Notifier;
use crate::error::{Result, SyncError};
use crate::identifier::Endpoint;
use crate::metrics;
use crate::retry::{RetryTask, Scheduler};
use crate::store::BoxFuture;
use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Resolves a hostname to the addresses of the cluster members.
pub trait Discovery: Send + Sync {
    fn resolve(&self, hostname: &str) -> BoxFuture<'_, HashSet<IpAddr>>;
}

/// Discovery through the system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsDiscovery;

impl Discovery for DnsDiscovery {
    fn resolve(&self, hostname: &str) -> BoxFuture<'_, HashSet<IpAddr>> {
        let hostname = hostname.to_string();
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((hostname.as_str(), 0))
                .await
                .map_err(|e| SyncError::Discovery(format!("resolving {}: {}", hostname, e)))?;
            Ok(addrs.map(|a| a.ip()).collect())
        })
    }
}

struct PollState {
    discovery: Arc<dyn Discovery>,
    hostname: String,
    template: EndpointTemplate,
    notifier: Notifier,
    known: Mutex<HashSet<Endpoint>>,
}

impl PollState {
    async fn poll(&self) -> Result<()> {
        let addrs = match self.discovery.resolve(&self.hostname).await {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!(hostname = %self.hostname, error = %e, "Member discovery failed, keeping current members");
                metrics::record_discovery_failure();
                return Ok(());
            }
        };
        let current: HashSet<Endpoint> = addrs
            .into_iter()
            .map(|addr| self.template.endpoint_for(addr))
            .collect();

        let mut known = self
            .known
            .lock()
            .map_err(|_| SyncError::Internal("membership lock poisoned".into()))?;

        // Sorted for stable notification order.
        let left: BTreeSet<&Endpoint> = known.difference(&current).collect();
        let joined: BTreeSet<&Endpoint> = current.difference(&known).collect();
        if left.is_empty() && joined.is_empty() {
            debug!(hostname = %self.hostname, members = current.len(), "Membership unchanged");
            return Ok(());
        }

        for endpoint in &left {
            info!(endpoint = %endpoint, "Member no longer resolves");
            self.notifier.member_left((*endpoint).clone());
        }
        for endpoint in &joined {
            info!(endpoint = %endpoint, "New member resolved");
            self.notifier.member_joined((*endpoint).clone());
        }
        drop(left);
        drop(joined);

        *known = current;
        Ok(())
    }
}

/// Periodic membership poll.
pub struct MembershipListener {
    state: Arc<PollState>,
    task: RetryTask<()>,
}

impl MembershipListener {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        hostname: impl Into<String>,
        template: EndpointTemplate,
        interval: Duration,
        scheduler: Scheduler,
        notifier: Notifier,
    ) -> Self {
        let hostname = hostname.into();
        let state = Arc::new(PollState {
            discovery,
            hostname: hostname.clone(),
            template,
            notifier,
            known: Mutex::new(HashSet::new()),
        });

        let op_state = Arc::clone(&state);
        let task = RetryTask::new(
            format!("membership:{}", hostname),
            scheduler,
            interval,
            move || {
                let state = Arc::clone(&op_state);
                Box::pin(async move { state.poll().await })
            },
            |_| false,
            |_| true,
        );

        Self { state, task }
    }

    pub fn from_config(
        config: &DiscoveryConfig,
        discovery: Arc<dyn Discovery>,
        scheduler: Scheduler,
        notifier: Notifier,
    ) -> Self {
        Self::new(
            discovery,
            config.hostname.clone(),
            config.template.clone(),
            config.poll_interval_duration(),
            scheduler,
            notifier,
        )
    }

    /// Run one poll now.
    pub async fn poll(&self) -> Result<()> {
        self.state.poll().await
    }

    /// Start polling at the configured interval.
    pub fn start(&self) {
        info!(
            hostname = %self.state.hostname,
            interval = %humantime::format_duration(self.task.delay()),
            "Membership polling started"
        );
        self.task.schedule();
    }

    pub fn close(&self) {
        self.task.close();
    }

    /// Members seen by the last successful poll.
    pub fn known(&self) -> Vec<Endpoint> {
        let mut members: Vec<Endpoint> = match self.state.known.lock() {
            Ok(known) => known.iter().cloned().collect(),
            Err(_) => Vec::new(),
        };
        members.sort();
        members
    }
}
