//! Mock capture engines for testing.
//!
//! Each engine keeps the session it was last started with, so a test can
//! push batches through the real batch coordinator and report failures the
//! way a log reader would.

use cdc_cache_sync::batch::BatchResult;
use cdc_cache_sync::capture::{
    CaptureEngine, CaptureEngineFactory, CaptureSession, CollectingCommitter,
};
use cdc_cache_sync::store::BoxFuture;
use cdc_cache_sync::{Identifier, RawRecord, Result, Rule, SyncError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records start/stop calls and holds the running session.
#[derive(Debug)]
pub struct MockCaptureEngine {
    identifier: Identifier,
    session: Mutex<Option<CaptureSession>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_start: AtomicBool,
    start_delay: Duration,
}

impl MockCaptureEngine {
    fn new(identifier: Identifier, start_delay: Duration, fail_start: bool) -> Self {
        Self {
            identifier,
            session: Mutex::new(None),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_start: AtomicBool::new(fail_start),
            start_delay,
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.session.lock().unwrap().is_some()
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Deliver one batch through the running session.
    pub async fn deliver(
        &self,
        records: Vec<RawRecord>,
    ) -> (Result<BatchResult>, Arc<CollectingCommitter>) {
        let session = self
            .session
            .lock()
            .unwrap()
            .clone()
            .expect("engine not running");
        let committer = Arc::new(CollectingCommitter::new());
        let result = session.deliver(records, committer.as_ref()).await;
        (result, committer)
    }

    /// Report an engine failure through the running session.
    pub fn fail(&self, message: &str) {
        let session = self.session.lock().unwrap().clone();
        if let Some(session) = session {
            session.failed(SyncError::capture(&self.identifier, message));
        }
    }
}

impl CaptureEngine for MockCaptureEngine {
    fn start(&self, session: CaptureSession) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.start_delay.is_zero() {
                tokio::time::sleep(self.start_delay).await;
            }
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(SyncError::capture(&self.identifier, "start refused"));
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.session.lock().unwrap() = Some(session);
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.stops.fetch_add(1, Ordering::SeqCst);
            *self.session.lock().unwrap() = None;
            Ok(())
        })
    }
}

/// Creates [`MockCaptureEngine`]s and keeps the latest one per identifier.
#[derive(Default)]
pub struct MockCaptureFactory {
    engines: DashMap<Identifier, Arc<MockCaptureEngine>>,
    created: AtomicUsize,
    slow_failing_start: Mutex<Option<Duration>>,
}

impl MockCaptureFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engine(&self, identifier: &Identifier) -> Option<Arc<MockCaptureEngine>> {
        self.engines.get(identifier).map(|e| Arc::clone(e.value()))
    }

    /// Engines created from now on take `delay` to start and then fail.
    pub fn fail_starts_after(&self, delay: Duration) {
        *self.slow_failing_start.lock().unwrap() = Some(delay);
    }

    /// Engines created so far, including replaced ones.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl CaptureEngineFactory for MockCaptureFactory {
    fn create(&self, identifier: &Identifier, _rule: &Rule) -> Result<Arc<dyn CaptureEngine>> {
        let slow_failing_start = *self.slow_failing_start.lock().unwrap();
        let engine = Arc::new(MockCaptureEngine::new(
            identifier.clone(),
            slow_failing_start.unwrap_or_default(),
            slow_failing_start.is_some(),
        ));
        self.engines.insert(identifier.clone(), Arc::clone(&engine));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(engine)
    }
}
