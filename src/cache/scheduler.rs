//! Periodic background refresh.
//!
//! Every cached resource gets its own long-lived worker, plus one worker that
//! rebuilds the views. Workers tick on a shared period, starting immediately,
//! and run their cycles strictly one after another. A failed cycle is either
//! skipped (the previous stored value stays) or, for the repository worker
//! under [`FailurePolicy::Shutdown`], cancels the whole process.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::gate::{refresh_gate, RefreshSignal, RefreshWaiter};
use super::model::CachedResource;
use super::{CacheError, CacheManager, ViewBuilder};
use crate::config::{CacheConfig, FailurePolicy};
use crate::metrics::{MetricsRegistry, RefreshOutcome};

/// One unit of periodic work.
#[async_trait]
pub trait RefreshCycle: Send {
    /// Resource label used in logs and metrics.
    fn name(&self) -> &str;

    async fn run_cycle(&mut self) -> Result<(), CacheError>;
}

// ---------------------------------------------------------------------------
// Cycles
// ---------------------------------------------------------------------------

/// Refreshes one resource that nothing downstream depends on.
pub struct ResourceCycle {
    manager: CacheManager,
    resource: CachedResource,
}

impl ResourceCycle {
    pub fn new(manager: CacheManager, resource: CachedResource) -> Self {
        Self { manager, resource }
    }
}

#[async_trait]
impl RefreshCycle for ResourceCycle {
    fn name(&self) -> &str {
        &self.resource.path
    }

    async fn run_cycle(&mut self) -> Result<(), CacheError> {
        self.manager.refresh_resource(&self.resource).await?;
        Ok(())
    }
}

/// Refreshes the repository collection and signals the view worker once the
/// new snapshot is stored.
pub struct RepositoryCycle {
    manager: CacheManager,
    resource: CachedResource,
    signal: RefreshSignal,
}

impl RepositoryCycle {
    pub fn new(manager: CacheManager, resource: CachedResource, signal: RefreshSignal) -> Self {
        Self {
            manager,
            resource,
            signal,
        }
    }
}

#[async_trait]
impl RefreshCycle for RepositoryCycle {
    fn name(&self) -> &str {
        &self.resource.path
    }

    async fn run_cycle(&mut self) -> Result<(), CacheError> {
        self.manager.refresh_resource(&self.resource).await?;
        let generation = self.signal.notify();
        debug!(generation, "repository snapshot published");
        Ok(())
    }
}

/// Rebuilds the views from the newest repository snapshot.
///
/// Each cycle first parks on the gate, so a tick with no new snapshot since
/// the last rebuild does nothing until the repository worker succeeds again.
pub struct ViewCycle {
    manager: CacheManager,
    views: ViewBuilder,
    repos_path: String,
    waiter: RefreshWaiter,
}

impl ViewCycle {
    pub fn new(
        manager: CacheManager,
        views: ViewBuilder,
        repos_path: String,
        waiter: RefreshWaiter,
    ) -> Self {
        Self {
            manager,
            views,
            repos_path,
            waiter,
        }
    }
}

#[async_trait]
impl RefreshCycle for ViewCycle {
    fn name(&self) -> &str {
        "views"
    }

    async fn run_cycle(&mut self) -> Result<(), CacheError> {
        let generation = self.waiter.wait_for_fresh().await?;
        let repos = self.manager.repositories(&self.repos_path).await?;
        let report = self.views.build_views(&repos).await;
        debug!(
            generation,
            persisted = report.persisted.len(),
            failed = report.failed.len(),
            "views rebuilt from snapshot"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RefreshScheduler {
    period: Duration,
    shutdown: CancellationToken,
    metrics: MetricsRegistry,
}

impl RefreshScheduler {
    pub fn new(period: Duration, shutdown: CancellationToken, metrics: MetricsRegistry) -> Self {
        Self {
            period,
            shutdown,
            metrics,
        }
    }

    /// Drive `cycle` until shutdown.
    ///
    /// Returns `Ok` on cancellation or when the gate a cycle waits on closes.
    /// Returns the cycle's error only when `policy` is
    /// [`FailurePolicy::Shutdown`], after cancelling every other worker.
    pub async fn run<C: RefreshCycle>(
        &self,
        mut cycle: C,
        policy: FailurePolicy,
    ) -> Result<(), CacheError> {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            resource = cycle.name(),
            period_secs = self.period.as_secs(),
            ?policy,
            "refresh worker started"
        );

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let started = Instant::now();
            let result = tokio::select! {
                () = self.shutdown.cancelled() => break,
                result = cycle.run_cycle() => result,
            };
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(()) => {
                    self.metrics
                        .metrics
                        .record_refresh(cycle.name(), RefreshOutcome::Success, elapsed);
                    debug!(resource = cycle.name(), elapsed, "refresh cycle complete");
                }
                Err(CacheError::GateClosed) => {
                    info!(resource = cycle.name(), "refresh gate closed, worker exiting");
                    return Ok(());
                }
                Err(e) => {
                    self.metrics
                        .metrics
                        .record_refresh(cycle.name(), RefreshOutcome::Failure, elapsed);
                    match policy {
                        FailurePolicy::Skip => {
                            warn!(
                                resource = cycle.name(),
                                error = %e,
                                "refresh cycle failed, keeping previous value"
                            );
                        }
                        FailurePolicy::Shutdown => {
                            error!(
                                resource = cycle.name(),
                                error = %e,
                                "refresh cycle failed, shutting down"
                            );
                            self.shutdown.cancel();
                            return Err(e);
                        }
                    }
                }
            }
        }

        info!(resource = cycle.name(), "refresh worker stopped");
        Ok(())
    }

    fn worker<C>(
        &self,
        cycle: C,
        policy: FailurePolicy,
    ) -> impl Future<Output = Result<(), CacheError>> + Send + 'static
    where
        C: RefreshCycle + 'static,
    {
        let scheduler = self.clone();
        let span = tracing::info_span!("refresh", resource = cycle.name());
        async move { scheduler.run(cycle, policy).await }.instrument(span)
    }
}

pub type Workers = JoinSet<Result<(), CacheError>>;

/// Start one worker per configured resource plus the view worker.
///
/// Only the repository worker honours `repos_failure_policy`; every other
/// resource skips a failed cycle.
pub fn spawn_workers(
    config: &CacheConfig,
    manager: CacheManager,
    views: ViewBuilder,
    metrics: MetricsRegistry,
    shutdown: CancellationToken,
) -> Workers {
    let scheduler = RefreshScheduler::new(config.refresh_period(), shutdown, metrics);
    let repos_path = config.repos_path();
    let (signal, waiter) = refresh_gate();
    let mut signal = Some(signal);
    let mut workers = JoinSet::new();

    for resource in CachedResource::from_config(config) {
        if resource.path == repos_path {
            if let Some(signal) = signal.take() {
                let cycle = RepositoryCycle::new(manager.clone(), resource, signal);
                workers.spawn(scheduler.worker(cycle, config.repos_failure_policy));
                continue;
            }
        }
        let cycle = ResourceCycle::new(manager.clone(), resource);
        workers.spawn(scheduler.worker(cycle, FailurePolicy::Skip));
    }

    let cycle = ViewCycle::new(manager, views, repos_path, waiter);
    workers.spawn(scheduler.worker(cycle, FailurePolicy::Skip));

    info!(workers = workers.len(), "refresh workers spawned");
    workers
}

/// Wait for every worker to finish, in completion order.
///
/// A panicked worker cancels `shutdown` as soon as it is observed so the
/// remaining workers wind down. Returns the first failure seen.
pub async fn join_workers(
    mut workers: Workers,
    shutdown: &CancellationToken,
) -> Result<(), CacheError> {
    let mut first_failure = None;
    while let Some(joined) = workers.join_next().await {
        let failure = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(e) => {
                error!(error = %e, "refresh worker panicked");
                shutdown.cancel();
                CacheError::WorkerAborted(e.to_string())
            }
        };
        first_failure.get_or_insert(failure);
    }
    first_failure.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::cache::manager::tests::{repo_json, ScriptedFetcher};
    use crate::cache::ViewKey;
    use crate::storage::InMemoryStore;

    const PERIOD: Duration = Duration::from_secs(60);

    struct CountingCycle {
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl RefreshCycle for CountingCycle {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run_cycle(&mut self) -> Result<(), CacheError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CacheError::UpstreamStatus {
                    path: "/counting".to_string(),
                    status: 500,
                })
            } else {
                Ok(())
            }
        }
    }

    fn counting(fail: bool) -> (Arc<AtomicUsize>, CountingCycle) {
        let runs = Arc::new(AtomicUsize::new(0));
        let cycle = CountingCycle {
            runs: runs.clone(),
            fail,
        };
        (runs, cycle)
    }

    fn scheduler(shutdown: &CancellationToken) -> RefreshScheduler {
        RefreshScheduler::new(PERIOD, shutdown.clone(), MetricsRegistry::new())
    }

    #[tokio::test(start_paused = true)]
    async fn first_cycle_runs_immediately_then_every_period() {
        let shutdown = CancellationToken::new();
        let (runs, cycle) = counting(false);
        let handle = tokio::spawn(scheduler(&shutdown).worker(cycle, FailurePolicy::Skip));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(PERIOD).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn skip_policy_keeps_worker_alive() {
        let shutdown = CancellationToken::new();
        let (runs, cycle) = counting(true);
        let handle = tokio::spawn(scheduler(&shutdown).worker(cycle, FailurePolicy::Skip));

        tokio::time::sleep(PERIOD * 2 + Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(!handle.is_finished());
        assert!(!shutdown.is_cancelled());

        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_policy_cancels_everything() {
        let shutdown = CancellationToken::new();
        let (runs, cycle) = counting(true);
        let result = scheduler(&shutdown).run(cycle, FailurePolicy::Shutdown).await;

        assert!(matches!(
            result,
            Err(CacheError::UpstreamStatus { status: 500, .. })
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(shutdown.is_cancelled());
    }

    fn repos_fetcher(responses: Vec<Result<Vec<serde_json::Value>, u16>>) -> ScriptedFetcher {
        ScriptedFetcher::default()
            .with_raw("/", Ok(bytes::Bytes::from_static(b"{}")))
            .with_raw("/orgs/acme", Ok(bytes::Bytes::from_static(b"{}")))
            .with_collection("/orgs/acme/members", vec![Ok(vec![])])
            .with_collection("/orgs/acme/repos", responses)
    }

    struct Harness {
        fetcher: Arc<ScriptedFetcher>,
        views: ViewBuilder,
        metrics: MetricsRegistry,
        shutdown: CancellationToken,
        workers: Workers,
    }

    fn start(fetcher: ScriptedFetcher, policy: FailurePolicy) -> Harness {
        let mut config = crate::config::test_config("acme").cache;
        config.repos_failure_policy = policy;

        let fetcher = Arc::new(fetcher);
        let store = Arc::new(InMemoryStore::new());
        let metrics = MetricsRegistry::new();
        let manager = CacheManager::new(fetcher.clone(), store.clone());
        let views = ViewBuilder::new(store, metrics.clone());
        let shutdown = CancellationToken::new();
        let workers = spawn_workers(
            &config,
            manager,
            views.clone(),
            metrics.clone(),
            shutdown.clone(),
        );
        Harness {
            fetcher,
            views,
            metrics,
            shutdown,
            workers,
        }
    }

    async fn top_forks(views: &ViewBuilder) -> Vec<String> {
        views
            .get_view(ViewKey::ByForks, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.repo)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn views_follow_each_repository_snapshot() {
        let harness = start(
            repos_fetcher(vec![
                Ok(vec![repo_json("acme/a", 1, 0)]),
                Ok(vec![repo_json("acme/a", 1, 0), repo_json("acme/b", 9, 0)]),
            ]),
            FailurePolicy::Shutdown,
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(top_forks(&harness.views).await, vec!["acme/a"]);

        tokio::time::sleep(PERIOD).await;
        assert_eq!(top_forks(&harness.views).await, vec!["acme/b", "acme/a"]);
        assert_eq!(harness.metrics.metrics.view_builds_total.get(), 2);

        // every resource gets its own worker, all on the same period
        assert_eq!(harness.fetcher.call_count("/orgs/acme/members"), 2);
        assert_eq!(harness.fetcher.call_count("/"), 2);

        harness.shutdown.cancel();
        assert!(join_workers(harness.workers, &harness.shutdown).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_repository_refresh_suppresses_view_rebuild() {
        let harness = start(
            repos_fetcher(vec![
                Ok(vec![repo_json("acme/a", 1, 0)]),
                Err(502),
            ]),
            FailurePolicy::Skip,
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(harness.metrics.metrics.view_builds_total.get(), 1);

        tokio::time::sleep(PERIOD * 2).await;
        assert_eq!(harness.metrics.metrics.view_builds_total.get(), 1);
        assert_eq!(top_forks(&harness.views).await, vec!["acme/a"]);
        assert!(!harness.shutdown.is_cancelled());

        harness.shutdown.cancel();
        assert!(join_workers(harness.workers, &harness.shutdown).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_repository_failure_stops_all_workers() {
        let harness = start(repos_fetcher(vec![Err(500)]), FailurePolicy::Shutdown);

        let result = join_workers(harness.workers, &harness.shutdown).await;
        assert!(matches!(
            result,
            Err(CacheError::UpstreamStatus { status: 500, .. })
        ));
        assert!(harness.shutdown.is_cancelled());
        assert!(top_forks(&harness.views).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn other_resources_skip_failures() {
        let fetcher = ScriptedFetcher::default()
            .with_raw("/", Err(503))
            .with_raw("/orgs/acme", Err(503))
            .with_collection("/orgs/acme/members", vec![Err(503)])
            .with_collection("/orgs/acme/repos", vec![Ok(vec![])]);
        let harness = start(fetcher, FailurePolicy::Shutdown);

        tokio::time::sleep(PERIOD + Duration::from_secs(1)).await;
        assert!(!harness.shutdown.is_cancelled());
        assert_eq!(harness.fetcher.call_count("/orgs/acme"), 2);

        harness.shutdown.cancel();
        assert!(join_workers(harness.workers, &harness.shutdown).await.is_ok());
    }

    #[tokio::test]
    async fn panicked_worker_stops_the_rest_without_waiting_on_them() {
        let shutdown = CancellationToken::new();
        let mut workers = Workers::new();
        let token = shutdown.clone();
        workers.spawn(async move {
            token.cancelled().await;
            Ok(())
        });
        workers.spawn(async { panic!("refresh worker blew up") });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            join_workers(workers, &shutdown),
        )
        .await
        .expect("a panic must cancel the remaining workers");
        assert!(matches!(result, Err(CacheError::WorkerAborted(_))));
        assert!(shutdown.is_cancelled());
    }
}
