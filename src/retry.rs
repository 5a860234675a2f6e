// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Self-rescheduling retry loops.
//!
//! A [`RetryTask`] runs an async operation after a fixed delay, then decides
//! from the outcome whether to run it again:
//!
//! ```text
//!   schedule() ──▶ sleep(delay) ──▶ operation() ──┬─ Ok(v),  is_done(v)      → stop
//!        ▲                                        ├─ Ok(v), !is_done(v)      → reschedule
//!        │                                        ├─ Err(e), should_retry(e) → reschedule
//!        └────────────────────────────────────────┴─ Err(e), !should_retry   → log, stop
//! ```
//!
//! Every loop runs on a [`Scheduler`]. The orchestrator owns one, so all
//! connector retries and membership polls are serialized onto a single
//! thread.
//!
//! # Cancellation
//!
//! [`RetryTask::close()`] swaps the pending slot to `Closed` and aborts the
//! sleeping future it replaced. Rescheduling checks the slot under the same
//! lock before spawning, so a closed task is never resurrected. An operation
//! already in flight is not cancelled; its outcome is discarded.

use crate::error::{Result, SyncError};
use crate::metrics;
use crate::store::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, warn};

// =============================================================================
// Scheduler
// =============================================================================

/// Where retry loops and membership polls run.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    name: String,
    handle: Handle,
    /// Set for dedicated schedulers; dropping/sending stops the thread.
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl Scheduler {
    /// Use the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| SyncError::Internal(format!("no tokio runtime: {}", e)))?;
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                name: "current".to_string(),
                handle,
                stop: Mutex::new(None),
            }),
        })
    }

    /// Run a single-threaded runtime on its own OS thread.
    pub fn dedicated(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SyncError::Internal(format!("scheduler runtime: {}", e)))?;
        let handle = runtime.handle().clone();
        let (tx, rx) = oneshot::channel::<()>();

        let thread_name = name.clone();
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = rx.await;
                });
                debug!(scheduler = %thread_name, "Scheduler thread exiting");
            })
            .map_err(|e| SyncError::Internal(format!("scheduler thread: {}", e)))?;

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                name,
                handle,
                stop: Mutex::new(Some(tx)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_dedicated(&self) -> bool {
        lock(&self.inner.stop).is_some()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    /// Stop a dedicated scheduler thread. Pending loops are dropped.
    pub fn shutdown(&self) {
        if let Some(tx) = lock(&self.inner.stop).take() {
            debug!(scheduler = %self.inner.name, "Stopping scheduler");
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// RetryTask
// =============================================================================

type Operation<T> = Box<dyn Fn() -> BoxFuture<'static, T> + Send + Sync>;
type DonePredicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;
type RetryPredicate = Box<dyn Fn(&SyncError) -> bool + Send + Sync>;

/// What the task is doing right now.
enum Pending {
    /// Not scheduled (never scheduled, or the loop ended).
    Idle,
    /// Waiting for the delay to elapse.
    Sleeping(AbortHandle),
    /// Operation in flight.
    Running,
    /// Closed; never scheduled again.
    Closed,
}

impl Pending {
    fn as_str(&self) -> &'static str {
        match self {
            Pending::Idle => "idle",
            Pending::Sleeping(_) => "sleeping",
            Pending::Running => "running",
            Pending::Closed => "closed",
        }
    }
}

/// A cancellable, self-rescheduling async operation.
///
/// Cloning yields another handle to the same loop.
pub struct RetryTask<T> {
    inner: Arc<RetryInner<T>>,
}

impl<T> Clone for RetryTask<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct RetryInner<T> {
    name: String,
    scheduler: Scheduler,
    delay: Duration,
    operation: Operation<T>,
    is_done: DonePredicate<T>,
    should_retry: RetryPredicate,
    pending: Mutex<Pending>,
}

impl<T: Send + 'static> RetryTask<T> {
    /// Build a task; nothing runs until [`schedule()`](Self::schedule).
    ///
    /// - `is_done`: on success, `true` stops the loop.
    /// - `should_retry`: on failure, `true` reschedules, `false` ends the loop.
    pub fn new<Op, Done, Retry>(
        name: impl Into<String>,
        scheduler: Scheduler,
        delay: Duration,
        operation: Op,
        is_done: Done,
        should_retry: Retry,
    ) -> Self
    where
        Op: Fn() -> BoxFuture<'static, T> + Send + Sync + 'static,
        Done: Fn(&T) -> bool + Send + Sync + 'static,
        Retry: Fn(&SyncError) -> bool + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(RetryInner {
                name: name.into(),
                scheduler,
                delay,
                operation: Box::new(operation),
                is_done: Box::new(is_done),
                should_retry: Box::new(should_retry),
                pending: Mutex::new(Pending::Idle),
            }),
        }
    }

    /// Run the operation after the delay. No-op if closed or already scheduled.
    pub fn schedule(&self) -> Self {
        let mut pending = lock(&self.inner.pending);
        if matches!(*pending, Pending::Idle) {
            RetryInner::spawn_locked(&self.inner, &mut pending);
        } else {
            debug!(task = %self.inner.name, pending = pending.as_str(), "Schedule ignored");
        }
        self.clone()
    }

    /// Cancel the pending run and prevent any further one.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *lock(&self.inner.pending), Pending::Closed);
        if let Pending::Sleeping(handle) = previous {
            handle.abort();
        }
        debug!(task = %self.inner.name, "Retry task closed");
    }

    pub fn is_closed(&self) -> bool {
        matches!(*lock(&self.inner.pending), Pending::Closed)
    }

    /// Whether a run is sleeping or in flight.
    pub fn is_scheduled(&self) -> bool {
        matches!(
            *lock(&self.inner.pending),
            Pending::Sleeping(_) | Pending::Running
        )
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }
}

impl<T: Send + 'static> RetryInner<T> {
    /// Spawn the next run. Caller holds the pending lock and has checked it
    /// is not `Closed`.
    fn spawn_locked(inner: &Arc<Self>, pending: &mut Pending) {
        let handle = inner.scheduler.spawn(Self::run(Arc::clone(inner)));
        *pending = Pending::Sleeping(handle.abort_handle());
    }

    async fn run(inner: Arc<Self>) {
        tokio::time::sleep(inner.delay).await;

        if !inner.begin() {
            return;
        }

        let result = (inner.operation)().await;
        let reschedule = match &result {
            Ok(value) if (inner.is_done)(value) => {
                metrics::record_retry_attempt(&inner.name, "done");
                false
            }
            Ok(_) => {
                metrics::record_retry_attempt(&inner.name, "rescheduled");
                true
            }
            Err(e) if (inner.should_retry)(e) => {
                warn!(task = %inner.name, error = %e, "Retry attempt failed, rescheduling");
                metrics::record_retry_attempt(&inner.name, "failed");
                true
            }
            Err(e) => {
                error!(task = %inner.name, error = %e, "Retry loop aborted");
                metrics::record_retry_attempt(&inner.name, "aborted");
                false
            }
        };

        inner.finish(reschedule);
    }

    /// Claim the slot for an in-flight run. False if closed meanwhile.
    fn begin(&self) -> bool {
        let mut pending = lock(&self.pending);
        if matches!(*pending, Pending::Closed) {
            return false;
        }
        *pending = Pending::Running;
        true
    }

    fn finish(self: &Arc<Self>, reschedule: bool) {
        let mut pending = lock(&self.pending);
        if matches!(*pending, Pending::Closed) {
            debug!(task = %self.name, "Closed while running, result discarded");
            return;
        }
        if reschedule {
            Self::spawn_locked(self, &mut pending);
        } else {
            *pending = Pending::Idle;
        }
    }
}

impl<T> std::fmt::Debug for RetryTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryTask")
            .field("name", &self.inner.name)
            .field("delay", &self.inner.delay)
            .field("pending", &lock(&self.inner.pending).as_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DELAY: Duration = Duration::from_secs(10);

    fn counting_task(
        calls: Arc<AtomicUsize>,
        outcome: impl Fn(usize) -> Result<usize> + Send + Sync + 'static,
        done_at: usize,
    ) -> RetryTask<usize> {
        let outcome = Arc::new(outcome);
        RetryTask::new(
            "test",
            Scheduler::current().unwrap(),
            DELAY,
            move || {
                let calls = Arc::clone(&calls);
                let outcome = Arc::clone(&outcome);
                Box::pin(async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    outcome(n)
                })
            },
            move |n| *n >= done_at,
            SyncError::is_retryable,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_before_delay_never_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counting_task(Arc::clone(&calls), Ok, 1).schedule();
        assert!(task.is_scheduled());

        tokio::time::sleep(DELAY / 2).await;
        task.close();
        tokio::time::sleep(DELAY * 5).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(task.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedules_until_done() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counting_task(Arc::clone(&calls), Ok, 3).schedule();

        tokio::time::sleep(DELAY + Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(DELAY * 10).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!task.is_scheduled());
        assert!(!task.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_reschedules() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counting_task(
            Arc::clone(&calls),
            |n| {
                if n < 3 {
                    Err(SyncError::connection("redis://a:6379", "refused"))
                } else {
                    Ok(n)
                }
            },
            1,
        )
        .schedule();

        tokio::time::sleep(DELAY * 10).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!task.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_aborts_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counting_task(
            Arc::clone(&calls),
            |_| Err(SyncError::invalid_state("Stopped", "Shutdown")),
            usize::MAX,
        )
        .schedule();

        tokio::time::sleep(DELAY * 10).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!task.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_after_close_is_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counting_task(Arc::clone(&calls), Ok, 1);
        task.close();
        task.schedule();
        assert!(!task.is_scheduled());

        tokio::time::sleep(DELAY * 3).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_schedule_runs_one_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counting_task(Arc::clone(&calls), Ok, 1);
        task.schedule();
        task.schedule();

        tokio::time::sleep(DELAY * 3).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_run_discards_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_op = Arc::clone(&calls);
        let task: RetryTask<bool> = RetryTask::new(
            "slow",
            Scheduler::current().unwrap(),
            DELAY,
            move || {
                let calls = Arc::clone(&calls_op);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(false)
                })
            },
            |done| *done,
            |_| true,
        )
        .schedule();

        tokio::time::sleep(DELAY + Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(task.is_scheduled());

        // In flight: not cancelled, but never rescheduled.
        task.close();
        tokio::time::sleep(DELAY * 5).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(task.is_closed());
    }

    #[tokio::test]
    async fn test_dedicated_scheduler_runs_on_own_thread() {
        let scheduler = Scheduler::dedicated("retry-test-scheduler").unwrap();
        assert!(scheduler.is_dedicated());

        let (tx, rx) = oneshot::channel();
        scheduler.spawn(async move {
            let name = std::thread::current().name().map(str::to_string);
            let _ = tx.send(name);
        });
        assert_eq!(rx.await.unwrap().as_deref(), Some("retry-test-scheduler"));

        scheduler.shutdown();
        assert!(!scheduler.is_dedicated());
        // Idempotent
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_current_scheduler() {
        let scheduler = Scheduler::current().unwrap();
        assert!(!scheduler.is_dedicated());
        let handle = scheduler.spawn(async {});
        handle.await.unwrap();
    }

    #[test]
    fn test_current_scheduler_outside_runtime() {
        assert!(matches!(Scheduler::current(), Err(SyncError::Internal(_))));
    }
}
