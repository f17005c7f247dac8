//! Qualification engine: concurrent probing, progress counters and merge
//!
//! A run probes each distinct candidate once on a bounded worker pool. Each
//! run owns a [`RunContext`] holding its cancellation token and counters.
//! Cancelled runs discard their outcomes and reset the counters; completed
//! runs merge their working links into the [`ResultStore`].

use crate::error::StoreError;
use crate::proxy::models::QualificationOutcome;
use crate::proxy::probe::{EngineProbe, Probe, ProbeTarget};
use crate::proxy::store::ResultStore;
use crate::Result;
use anyhow::anyhow;
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Default number of concurrent probes
const DEFAULT_WORKERS: usize = 8;

/// Default probe timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Default URL to probe through each candidate
const DEFAULT_TEST_URL: &str = "https://www.google.com/";

/// Default bound on waiting for in-flight probes after a stop
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

/// Configuration for the qualification engine
#[derive(Debug, Clone)]
pub struct QualifierConfig {
    /// Number of probes running at once
    pub workers: usize,
    /// Timeout of each probe request
    pub timeout: Duration,
    /// URL requested through each candidate
    pub test_url: String,
    /// How long `stop` waits for in-flight probes before aborting them
    pub stop_timeout: Duration,
}

impl Default for QualifierConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            test_url: DEFAULT_TEST_URL.to_string(),
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS),
        }
    }
}

impl QualifierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_test_url(mut self, url: String) -> Self {
        self.test_url = url;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    fn target(&self) -> ProbeTarget {
        ProbeTarget::new(self.test_url.clone(), self.timeout)
    }
}

/// Snapshot of a run's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    pub tested: usize,
    pub working: usize,
}

/// Per-run state shared between the run and its observers
#[derive(Debug)]
pub struct RunContext {
    id: Uuid,
    cancel: CancellationToken,
    total: AtomicUsize,
    tested: AtomicUsize,
    working: AtomicUsize,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            total: AtomicUsize::new(0),
            tested: AtomicUsize::new(0),
            working: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Signal the run to stop; no new probe starts afterwards
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn progress(&self) -> Progress {
        Progress {
            total: self.total.load(Ordering::SeqCst),
            tested: self.tested.load(Ordering::SeqCst),
            working: self.working.load(Ordering::SeqCst),
        }
    }

    fn reset_counters(&self) {
        self.total.store(0, Ordering::SeqCst);
        self.tested.store(0, Ordering::SeqCst);
        self.working.store(0, Ordering::SeqCst);
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcomes of one qualification pass, before merging
#[derive(Debug, Clone, Default)]
pub struct Qualification {
    /// Every outcome in completion order
    pub outcomes: Vec<QualificationOutcome>,
    /// Distinct working outcomes in completion order
    pub working: Vec<QualificationOutcome>,
    pub cancelled: bool,
}

/// Result of a complete run
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Every outcome in completion order
    pub outcomes: Vec<QualificationOutcome>,
    /// Currently working links, fastest first
    pub working: Vec<QualificationOutcome>,
    /// Store contents after the merge
    pub persisted: Vec<String>,
    pub cancelled: bool,
}

impl RunReport {
    fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Default::default()
        }
    }
}

/// Qualification engine over a probe backend
pub struct Qualifier<P: Probe = EngineProbe> {
    probe: Arc<P>,
    config: QualifierConfig,
    store: ResultStore,
}

impl<P: Probe> Qualifier<P> {
    pub fn new(probe: P, config: QualifierConfig, store: ResultStore) -> Self {
        Self {
            probe: Arc::new(probe),
            config,
            store,
        }
    }

    pub fn config(&self) -> &QualifierConfig {
        &self.config
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Probe each distinct candidate once and collect outcomes
    ///
    /// Queued probes are dropped when the run is cancelled; probes already
    /// running finish their own cleanup but their outcomes are discarded.
    pub async fn qualify<I>(
        &self,
        candidates: I,
        ctx: &RunContext,
        events: Option<&UnboundedSender<QualificationOutcome>>,
    ) -> Qualification
    where
        I: IntoIterator<Item = String>,
    {
        let mut seen = HashSet::new();
        let distinct: Vec<String> = candidates
            .into_iter()
            .filter(|uri| seen.insert(uri.clone()))
            .collect();

        ctx.reset_counters();
        ctx.total.store(distinct.len(), Ordering::SeqCst);

        let target = self.config.target();
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();

        for uri in distinct {
            let probe = Arc::clone(&self.probe);
            let semaphore = Arc::clone(&semaphore);
            let cancel = ctx.cancel.clone();
            let target = target.clone();
            tasks.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    permit = semaphore.acquire_owned() => permit.ok()?,
                };
                if cancel.is_cancelled() {
                    return None;
                }
                let outcome = AssertUnwindSafe(probe.probe(&uri, &target, &cancel))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        warn!(uri = %uri, "probe panicked");
                        QualificationOutcome::unreachable(uri.as_str())
                    });
                Some(outcome)
            });
        }

        let mut outcomes = Vec::new();
        let mut working = Vec::new();
        let mut recorded = HashSet::new();

        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(Some(outcome)) => outcome,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "probe task failed");
                    continue;
                }
            };
            if ctx.is_cancelled() {
                continue;
            }

            ctx.tested.fetch_add(1, Ordering::SeqCst);
            if outcome.is_working() && recorded.insert(outcome.uri.clone()) {
                ctx.working.fetch_add(1, Ordering::SeqCst);
                working.push(outcome.clone());
            }
            if let Some(events) = events {
                let _ = events.send(outcome.clone());
            }
            outcomes.push(outcome);
        }

        if ctx.is_cancelled() {
            ctx.reset_counters();
            return Qualification {
                cancelled: true,
                ..Default::default()
            };
        }

        Qualification {
            outcomes,
            working,
            cancelled: false,
        }
    }

    /// Qualify candidates and merge the working ones into the store
    pub async fn run<I>(
        &self,
        candidates: I,
        ctx: &RunContext,
        events: Option<&UnboundedSender<QualificationOutcome>>,
    ) -> std::result::Result<RunReport, StoreError>
    where
        I: IntoIterator<Item = String>,
    {
        let span = info_span!("run", id = %ctx.id());
        self.qualify_and_merge(candidates, ctx, events)
            .instrument(span)
            .await
    }

    async fn qualify_and_merge<I>(
        &self,
        candidates: I,
        ctx: &RunContext,
        events: Option<&UnboundedSender<QualificationOutcome>>,
    ) -> std::result::Result<RunReport, StoreError>
    where
        I: IntoIterator<Item = String>,
    {
        let qualification = self.qualify(candidates, ctx, events).await;
        if qualification.cancelled {
            info!("run cancelled, outcomes discarded");
            return Ok(RunReport::cancelled());
        }

        let new_uris: Vec<String> = qualification
            .working
            .iter()
            .map(|o| o.uri.clone())
            .collect();
        let persisted = self.store.merge(&new_uris)?;

        let mut working = qualification.working;
        working.sort_by_key(|o| o.latency);
        let progress = ctx.progress();
        info!(
            tested = progress.tested,
            working = progress.working,
            persisted = persisted.len(),
            "run complete"
        );

        Ok(RunReport {
            outcomes: qualification.outcomes,
            working,
            persisted,
            cancelled: false,
        })
    }

    /// Re-probe everything in the store
    ///
    /// Entries that fail stay persisted but are not reported as working.
    pub async fn refresh(
        &self,
        ctx: &RunContext,
        events: Option<&UnboundedSender<QualificationOutcome>>,
    ) -> std::result::Result<RunReport, StoreError> {
        let existing = self.store.load()?;
        self.run(existing, ctx, events).await
    }

    /// Start a run in the background with a fresh context
    ///
    /// Outcomes are streamed on the returned receiver as they complete.
    pub fn spawn(
        self: &Arc<Self>,
        candidates: Vec<String>,
    ) -> (RunHandle, UnboundedReceiver<QualificationOutcome>) {
        let context = Arc::new(RunContext::new());
        let (tx, rx) = mpsc::unbounded_channel();

        let qualifier = Arc::clone(self);
        let ctx = Arc::clone(&context);
        let task = tokio::spawn(async move { qualifier.run(candidates, &ctx, Some(&tx)).await });

        let handle = RunHandle {
            context,
            task,
            stop_timeout: self.config.stop_timeout,
        };
        (handle, rx)
    }
}

/// Handle to a background run
pub struct RunHandle {
    context: Arc<RunContext>,
    task: JoinHandle<std::result::Result<RunReport, StoreError>>,
    stop_timeout: Duration,
}

impl RunHandle {
    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn progress(&self) -> Progress {
        self.context.progress()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to finish on its own
    pub async fn join(self) -> Result<RunReport> {
        Ok(self.task.await.map_err(|e| anyhow!("run task failed: {}", e))??)
    }

    /// Cancel the run and wait a bounded time for in-flight probes
    ///
    /// Probes still running after the timeout are aborted; their engine
    /// processes are killed and temp files removed when they are dropped.
    pub async fn stop(mut self) -> Result<RunReport> {
        self.context.cancel();
        match tokio::time::timeout(self.stop_timeout, &mut self.task).await {
            Ok(joined) => Ok(joined.map_err(|e| anyhow!("run task failed: {}", e))??),
            Err(_) => {
                warn!(run = %self.context.id(), "stop timed out, aborting probes");
                self.task.abort();
                let _ = (&mut self.task).await;
                self.context.reset_counters();
                Ok(RunReport::cancelled())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::Latency;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Probe backend with scripted latencies
    #[derive(Default)]
    struct ScriptedProbe {
        latencies: HashMap<String, u64>,
        delay: Option<Duration>,
        cancel_after: Option<usize>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProbe {
        fn working(latencies: &[(&str, u64)]) -> Self {
            Self {
                latencies: latencies
                    .iter()
                    .map(|(uri, ms)| (uri.to_string(), *ms))
                    .collect(),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Probe for ScriptedProbe {
        async fn probe(
            &self,
            uri: &str,
            _target: &ProbeTarget,
            cancel: &CancellationToken,
        ) -> QualificationOutcome {
            let call_count = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(uri.to_string());
                calls.len()
            };
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.cancel_after == Some(call_count) {
                cancel.cancel();
            }
            match self.latencies.get(uri) {
                Some(ms) => QualificationOutcome::working(uri, *ms),
                None => QualificationOutcome::unreachable(uri),
            }
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn build_qualifier(
        probe: ScriptedProbe,
        workers: usize,
    ) -> (Qualifier<ScriptedProbe>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path().join("working.txt"));
        let config = QualifierConfig::new()
            .with_workers(workers)
            .with_stop_timeout(Duration::from_secs(5));
        (Qualifier::new(probe, config, store), dir)
    }

    #[test]
    fn test_qualifier_config_builder() {
        let config = QualifierConfig::new()
            .with_workers(32)
            .with_timeout(Duration::from_secs(2))
            .with_test_url("http://example.com".to_string());
        assert_eq!(config.workers, 32);
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.test_url, "http://example.com");
    }

    #[tokio::test]
    async fn test_duplicates_probed_once() {
        let (qualifier, _dir) = build_qualifier(ScriptedProbe::working(&[("a", 10)]), 4);
        let ctx = RunContext::new();
        let result = qualifier
            .qualify(strings(&["a", "b", "a", "c", "b", "a"]), &ctx, None)
            .await;

        assert_eq!(result.outcomes.len(), 3);
        let mut calls = qualifier.probe.calls();
        calls.sort();
        assert_eq!(calls, strings(&["a", "b", "c"]));
        assert_eq!(
            ctx.progress(),
            Progress {
                total: 3,
                tested: 3,
                working: 1
            }
        );
    }

    #[tokio::test]
    async fn test_mixed_outcomes_merge_working_only() {
        let probe = ScriptedProbe::working(&[("vless://fast", 50), ("vless://slow", 80)]);
        let (qualifier, _dir) = build_qualifier(probe, 2);
        let ctx = RunContext::new();
        let candidates = strings(&[
            "vless://slow",
            "vless://dead1",
            "vless://fast",
            "vless://dead2",
            "vless://dead3",
        ]);

        let report = qualifier.run(candidates, &ctx, None).await.unwrap();

        assert!(!report.cancelled);
        assert_eq!(report.outcomes.len(), 5);
        let finite = report.outcomes.iter().filter(|o| o.is_working()).count();
        assert_eq!(finite, 2);
        assert_eq!(
            report
                .working
                .iter()
                .map(|o| (o.uri.as_str(), o.latency))
                .collect::<Vec<_>>(),
            vec![
                ("vless://fast", Latency::Millis(50)),
                ("vless://slow", Latency::Millis(80))
            ]
        );
        assert_eq!(report.persisted, strings(&["vless://fast", "vless://slow"]));
        assert_eq!(
            qualifier.store().load().unwrap(),
            strings(&["vless://fast", "vless://slow"])
        );
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let probe = ScriptedProbe::working(&[("c", 1), ("a", 1), ("b", 1)]);
        let (qualifier, _dir) = build_qualifier(probe, 3);
        let candidates = strings(&["c", "a", "b"]);

        qualifier
            .run(candidates.clone(), &RunContext::new(), None)
            .await
            .unwrap();
        let first = std::fs::read_to_string(qualifier.store().path()).unwrap();
        qualifier
            .run(candidates, &RunContext::new(), None)
            .await
            .unwrap();
        let second = std::fs::read_to_string(qualifier.store().path()).unwrap();

        assert_eq!(first, "a\nb\nc\n");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_cancellation_discards_everything() {
        let candidates = strings(&["a", "b", "c", "d", "e"]);
        for k in 1..=4 {
            let probe = ScriptedProbe {
                cancel_after: Some(k),
                ..ScriptedProbe::working(&[("a", 5), ("b", 5), ("c", 5), ("d", 5), ("e", 5)])
            };
            let (qualifier, _dir) = build_qualifier(probe, 1);
            let ctx = RunContext::new();

            let report = qualifier.run(candidates.clone(), &ctx, None).await.unwrap();

            assert!(report.cancelled, "k = {}", k);
            assert!(report.outcomes.is_empty());
            assert!(report.persisted.is_empty());
            assert!(qualifier.store().load().unwrap().is_empty());
            assert_eq!(ctx.progress(), Progress::default());
            // queued probes never started once the token was signaled
            assert_eq!(qualifier.probe.calls().len(), k);
        }
    }

    #[tokio::test]
    async fn test_refresh_keeps_stale_entries() {
        let probe = ScriptedProbe::working(&[("alive", 30)]);
        let (qualifier, _dir) = build_qualifier(probe, 2);
        qualifier
            .store()
            .merge(&strings(&["alive", "stale"]))
            .unwrap();

        let report = qualifier.refresh(&RunContext::new(), None).await.unwrap();

        assert_eq!(report.working.len(), 1);
        assert_eq!(report.working[0].uri, "alive");
        assert_eq!(report.persisted, strings(&["alive", "stale"]));
    }

    #[tokio::test]
    async fn test_spawn_streams_outcomes() {
        let probe = ScriptedProbe::working(&[("a", 5)]);
        let (qualifier, _dir) = build_qualifier(probe, 2);
        let qualifier = Arc::new(qualifier);

        let (handle, mut rx) = qualifier.spawn(strings(&["a", "b"]));
        let report = handle.join().await.unwrap();

        let mut streamed = Vec::new();
        while let Some(outcome) = rx.recv().await {
            streamed.push(outcome.uri);
        }
        streamed.sort();
        assert_eq!(streamed, strings(&["a", "b"]));
        assert_eq!(report.persisted, strings(&["a"]));
    }

    #[tokio::test]
    async fn test_stop_handle_resets_and_skips_merge() {
        let probe = ScriptedProbe {
            delay: Some(Duration::from_millis(50)),
            ..ScriptedProbe::working(&[("a", 1), ("b", 1), ("c", 1), ("d", 1)])
        };
        let (qualifier, _dir) = build_qualifier(probe, 1);
        let qualifier = Arc::new(qualifier);

        let candidates: Vec<String> = (0..20)
            .map(|i| format!("x{}", i))
            .chain(strings(&["a", "b"]))
            .collect();
        let (handle, _rx) = qualifier.spawn(candidates);
        tokio::time::sleep(Duration::from_millis(120)).await;

        let report = handle.stop().await.unwrap();
        assert!(report.cancelled);
        assert!(qualifier.store().load().unwrap().is_empty());
        assert!(qualifier.probe.calls().len() < 22);
    }
}
