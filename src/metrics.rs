//! Metrics for observability.
//!
//! Records through the `metrics` facade; installing an exporter is left to
//! the embedding process. Covers:
//! - Connector state, failures and restarts
//! - Retry loop attempts
//! - Backend connections and reconnects
//! - Membership changes
//! - Batch application stats
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `cdc_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)

use crate::identifier::{Endpoint, Identifier};
use metrics::{counter, gauge, histogram};
use std::time::Duration;

fn state_value(state: &str) -> f64 {
    match state {
        "running" => 1.0,
        "retrying" => 2.0,
        "stopping" => 3.0,
        "shutdown" => 4.0,
        _ => 0.0,
    }
}

/// Set the connector state gauge (0=stopped, 1=running, 2=retrying, 3=stopping, 4=shutdown).
pub fn set_connector_state(identifier: &Identifier, state: &str) {
    gauge!(
        "cdc_sync_connector_state",
        "rule" => identifier.rule().to_string(),
        "endpoint" => identifier.endpoint().to_string()
    )
    .set(state_value(state));
}

/// Record a connector failure.
pub fn record_connector_failure(identifier: &Identifier) {
    counter!(
        "cdc_sync_connector_failures_total",
        "rule" => identifier.rule().to_string(),
        "endpoint" => identifier.endpoint().to_string()
    )
    .increment(1);
}

/// Record a connector restarted by its retry loop.
pub fn record_connector_restart(identifier: &Identifier) {
    counter!(
        "cdc_sync_connector_restarts_total",
        "rule" => identifier.rule().to_string(),
        "endpoint" => identifier.endpoint().to_string()
    )
    .increment(1);
}

/// Record one run of a retry loop's operation.
pub fn record_retry_attempt(task: &str, outcome: &str) {
    counter!("cdc_sync_retry_attempts_total", "task" => task.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record a backend connection that came back after being stopped.
pub fn record_backend_reconnect(endpoint: &Endpoint) {
    counter!("cdc_sync_backend_reconnects_total", "endpoint" => endpoint.to_string()).increment(1);
}

/// Set whether the connection to a member is up.
pub fn set_backend_connected(endpoint: &Endpoint, connected: bool) {
    gauge!("cdc_sync_backend_connected", "endpoint" => endpoint.to_string())
        .set(if connected { 1.0 } else { 0.0 });
}

/// Record a membership change (`joined` / `left`).
pub fn record_member_change(kind: &str) {
    counter!("cdc_sync_member_changes_total", "kind" => kind.to_string()).increment(1);
}

/// Set the number of members the orchestrator has registered.
pub fn set_member_count(count: usize) {
    gauge!("cdc_sync_members").set(count as f64);
}

/// Record a failed discovery poll.
pub fn record_discovery_failure() {
    counter!("cdc_sync_discovery_failures_total").increment(1);
}

/// Record an applied batch.
pub fn record_batch(
    rule: &str,
    total: usize,
    applied: usize,
    squashed: usize,
    filtered: usize,
    duration: Duration,
) {
    let rule = rule.to_string();
    counter!("cdc_sync_records_total", "rule" => rule.clone()).increment(total as u64);
    counter!("cdc_sync_records_applied_total", "rule" => rule.clone()).increment(applied as u64);
    counter!("cdc_sync_records_squashed_total", "rule" => rule.clone()).increment(squashed as u64);
    counter!("cdc_sync_records_filtered_total", "rule" => rule.clone()).increment(filtered as u64);
    histogram!("cdc_sync_batch_size", "rule" => rule.clone()).record(total as f64);
    histogram!("cdc_sync_batch_duration_seconds", "rule" => rule).record(duration.as_secs_f64());
}

/// Record a batch aborted by a failed dispatch.
pub fn record_batch_failure(rule: &str) {
    counter!("cdc_sync_batch_failures_total", "rule" => rule.to_string()).increment(1);
}
