//! Job runner: the worker loop driving claim -> handler -> mark done.
//!
//! Each worker task polls [`LeaseManager::claim_next_for`] restricted to the
//! kinds that have a handler. A separate task sweeps stale leases on its own,
//! slower schedule. Failed handlers leave the job IN_PROGRESS; the sweep
//! hands it out again once the lease times out.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use leaseq_core::{Job, JobKind, RunnerId};

use crate::config::QueueConfig;

use super::lease::{Completion, LeaseManager};
use super::reclaimer::StaleLeaseReclaimer;
use super::store::JobStore;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Executes the side effect of a job.
///
/// Delivery is at-least-once, so handlers must be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        (self)(job.clone()).await
    }
}

/// Job runner configuration.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Name for logging
    pub name: String,
    /// Number of concurrent worker tasks
    pub workers: usize,
    pub poll_interval: Duration,
    pub reclaim_interval: Duration,
    pub lease_timeout: Duration,
    /// Run the stale lease sweep alongside the workers.
    pub reclaim: bool,
    /// Renew the lease this often while a handler runs.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for JobRunnerConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            name: "job-runner".to_string(),
            workers: 4,
            poll_interval: config.poll_interval,
            reclaim_interval: config.reclaim_interval,
            lease_timeout: config.lease_timeout,
            reclaim: true,
            heartbeat_interval: None,
        }
    }
}

impl JobRunnerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn without_reclaimer(mut self) -> Self {
        self.reclaim = false;
        self
    }
}

/// Runner statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RunnerStats {
    pub jobs_claimed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    /// Completion reported after the lease was reclaimed.
    pub leases_lost: u64,
    pub leases_renewed: u64,
    pub jobs_reclaimed: u64,
    pub storage_errors: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

type SharedStats = Arc<Mutex<RunnerStats>>;

fn update_stats(stats: &SharedStats, f: impl FnOnce(&mut RunnerStats)) {
    let mut guard = stats.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard);
}

/// Handle to a running [`JobRunner`].
#[derive(Debug)]
pub struct JobRunnerHandle {
    runner_id: RunnerId,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: SharedStats,
    started: Instant,
}

impl JobRunnerHandle {
    pub fn runner_id(&self) -> RunnerId {
        self.runner_id
    }

    /// Current statistics.
    pub fn stats(&self) -> RunnerStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Signal every task to stop and wait for them. A job being handled is
    /// finished first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(runner_id = %self.runner_id, error = %e, "runner task panicked");
            }
        }
    }
}

/// Background job runner.
pub struct JobRunner<S> {
    leases: LeaseManager<S>,
    reclaimer: StaleLeaseReclaimer<S>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl<S: JobStore + Clone + 'static> JobRunner<S> {
    pub fn new(store: S, config: &QueueConfig) -> Self {
        Self {
            leases: LeaseManager::with_config(store.clone(), config),
            reclaimer: StaleLeaseReclaimer::new(store),
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a job kind, replacing any previous one.
    pub fn register_handler<H>(&mut self, kind: JobKind, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
    }

    /// Kinds this runner will claim.
    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Spawn the worker and sweep tasks on the current tokio runtime.
    pub fn spawn(self, config: JobRunnerConfig) -> JobRunnerHandle {
        let runner_id = RunnerId::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats: SharedStats = Arc::new(Mutex::new(RunnerStats::default()));
        let runner = Arc::new(self);
        let config = Arc::new(config);

        info!(
            runner = %config.name,
            %runner_id,
            workers = config.workers,
            kinds = ?runner.kinds(),
            "job runner started"
        );

        let mut tasks = Vec::with_capacity(config.workers + 1);
        for worker in 0..config.workers.max(1) {
            tasks.push(tokio::spawn(worker_loop(
                runner.clone(),
                config.clone(),
                worker,
                shutdown_rx.clone(),
                stats.clone(),
            )));
        }
        if config.reclaim {
            tasks.push(tokio::spawn(reclaim_loop(
                runner.clone(),
                config.clone(),
                shutdown_rx,
                stats.clone(),
            )));
        }

        JobRunnerHandle {
            runner_id,
            shutdown: shutdown_tx,
            tasks,
            stats,
            started: Instant::now(),
        }
    }

    /// Run the handler for one claimed job and report the outcome.
    ///
    /// The handler runs in its own task so a panic fails the job instead of
    /// the worker.
    async fn process(&self, job: Job, heartbeat: Option<Duration>, stats: &SharedStats) {
        let Some(handler) = self.handlers.get(&job.kind).cloned() else {
            // Claims are filtered by registered kinds.
            warn!(job = %job.key(), "no handler for claimed job");
            return;
        };

        update_stats(stats, |s| {
            s.jobs_claimed += 1;
            s.current_running += 1;
        });

        let mut lease = job.clone();
        let mut work = tokio::spawn(async move { handler.handle(&job).await });
        let joined = match heartbeat {
            None => (&mut work).await,
            Some(every) => loop {
                tokio::select! {
                    joined = &mut work => break joined,
                    _ = tokio::time::sleep(every) => {
                        if let Some(renewed) = self.heartbeat(&lease, stats).await {
                            lease = renewed;
                        }
                    }
                }
            },
        };

        update_stats(stats, |s| s.current_running = s.current_running.saturating_sub(1));

        let result = joined.unwrap_or_else(|e| {
            if e.is_panic() {
                error!(job = %lease.key(), "job handler panicked");
            }
            Err(HandlerError::from(e))
        });

        match result {
            Ok(()) => match self.leases.mark_done(&lease).await {
                Ok(Completion::Completed) | Ok(Completion::AlreadyDone) => {
                    update_stats(stats, |s| s.jobs_succeeded += 1);
                }
                Ok(Completion::LeaseLost) => {
                    warn!(job = %lease.key(), "lease lost before completion; job will run again");
                    update_stats(stats, |s| s.leases_lost += 1);
                }
                Err(e) => {
                    error!(job = %lease.key(), error = %e, "failed to mark job done");
                    update_stats(stats, |s| s.storage_errors += 1);
                }
            },
            Err(e) => {
                warn!(job = %lease.key(), error = %e, "job handler failed; lease left to expire");
                update_stats(stats, |s| s.jobs_failed += 1);
            }
        }
    }

    /// Renew the lease; the returned job carries the new stamp.
    async fn heartbeat(&self, job: &Job, stats: &SharedStats) -> Option<Job> {
        match self.leases.renew(job).await {
            Ok(Some(renewed)) => {
                update_stats(stats, |s| s.leases_renewed += 1);
                Some(renewed)
            }
            Ok(None) => {
                debug!(job = %job.key(), "lease no longer held");
                None
            }
            Err(e) => {
                warn!(job = %job.key(), error = %e, "failed to renew lease");
                update_stats(stats, |s| s.storage_errors += 1);
                None
            }
        }
    }
}

/// Sleep for `delay` unless shutdown is signalled first. Returns true to stop.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    let closed = tokio::select! {
        changed = shutdown.changed() => changed.is_err(),
        _ = tokio::time::sleep(delay) => false,
    };
    closed || *shutdown.borrow()
}

async fn worker_loop<S: JobStore + Clone + 'static>(
    runner: Arc<JobRunner<S>>,
    config: Arc<JobRunnerConfig>,
    worker: usize,
    mut shutdown: watch::Receiver<bool>,
    stats: SharedStats,
) {
    let kinds = runner.kinds();
    debug!(runner = %config.name, worker, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match runner.leases.claim_next_for(&kinds, Utc::now()).await {
            Ok(Some(job)) => {
                runner.process(job, config.heartbeat_interval, &stats).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                error!(runner = %config.name, worker, error = %e, "failed to claim job");
                update_stats(&stats, |s| s.storage_errors += 1);
            }
        }

        if wait_or_shutdown(&mut shutdown, config.poll_interval).await {
            break;
        }
    }

    debug!(runner = %config.name, worker, "worker stopped");
}

async fn reclaim_loop<S: JobStore + Clone + 'static>(
    runner: Arc<JobRunner<S>>,
    config: Arc<JobRunnerConfig>,
    mut shutdown: watch::Receiver<bool>,
    stats: SharedStats,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match runner.reclaimer.reclaim_stale(config.lease_timeout).await {
            Ok(count) => update_stats(&stats, |s| s.jobs_reclaimed += count),
            Err(e) => {
                error!(runner = %config.name, error = %e, "stale lease sweep failed");
                update_stats(&stats, |s| s.storage_errors += 1);
            }
        }

        if wait_or_shutdown(&mut shutdown, config.reclaim_interval).await {
            break;
        }
    }

    info!(runner = %config.name, "job runner stopped");
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use leaseq_core::{JobStatus, SubjectId};

    use super::*;
    use crate::jobs::producer::JobProducer;
    use crate::jobs::store::{InMemoryJobStore, OnConflict};

    fn fast_config() -> JobRunnerConfig {
        JobRunnerConfig::default()
            .with_workers(2)
            .with_poll_interval(Duration::from_millis(10))
            .with_reclaim_interval(Duration::from_millis(20))
    }

    async fn wait_for(handle: &JobRunnerHandle, done: impl Fn(&RunnerStats) -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !done(&handle.stats()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "runner did not reach expected state: {:?}", handle.stats());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_handlers_and_marks_jobs_done() {
        let store = InMemoryJobStore::arc();
        let producer = JobProducer::new(store.clone());
        for subject in ["S1", "S2", "S3"] {
            producer.enqueue(subject, &[JobKind::Notify]).await.unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut runner = JobRunner::new(store.clone(), &QueueConfig::default());
        let sink = seen.clone();
        runner.register_handler(JobKind::Notify, move |job: Job| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(job.subject_id.to_string());
                Ok::<(), HandlerError>(())
            }
        });

        let handle = runner.spawn(fast_config());
        wait_for(&handle, |s| s.jobs_succeeded == 3).await;
        handle.shutdown().await;

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["S1", "S2", "S3"]);
        assert_eq!(store.stats().await.unwrap().done, 3);
    }

    #[tokio::test]
    async fn failed_handler_leaves_job_in_progress() {
        let store = InMemoryJobStore::arc();
        JobProducer::new(store.clone())
            .enqueue("S1", &[JobKind::Publish])
            .await
            .unwrap();

        let mut runner = JobRunner::new(store.clone(), &QueueConfig::default());
        runner.register_handler(JobKind::Publish, |_job: Job| async {
            Err::<(), HandlerError>("registry unreachable".into())
        });

        let handle = runner.spawn(fast_config());
        wait_for(&handle, |s| s.jobs_failed == 1).await;
        handle.shutdown().await;

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.done, 0);
    }

    #[tokio::test]
    async fn kinds_without_handler_are_not_claimed() {
        let store = InMemoryJobStore::arc();
        JobProducer::new(store.clone())
            .enqueue("S1", &[JobKind::Notify, JobKind::RegistrySync])
            .await
            .unwrap();

        let mut runner = JobRunner::new(store.clone(), &QueueConfig::default());
        runner.register_handler(JobKind::Notify, |_job: Job| async { Ok::<(), HandlerError>(()) });
        assert_eq!(runner.kinds(), vec![JobKind::Notify]);

        let handle = runner.spawn(fast_config());
        wait_for(&handle, |s| s.jobs_succeeded == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.done, 1);
        assert_eq!(stats.new, 1);
    }

    #[tokio::test]
    async fn sweep_recovers_abandoned_jobs() {
        let store = InMemoryJobStore::arc();
        let mut abandoned = Job::new(
            SubjectId::new("crashed").unwrap(),
            JobKind::Notify,
            Utc::now() - ChronoDuration::hours(2),
        );
        store.insert_jobs(&[abandoned.clone()], OnConflict::Fail).await.unwrap();
        abandoned
            .mark_in_progress(Utc::now() - ChronoDuration::hours(1))
            .unwrap();
        store.update_job(&abandoned, JobStatus::New).await.unwrap();

        let mut runner = JobRunner::new(store.clone(), &QueueConfig::default());
        runner.register_handler(JobKind::Notify, |_job: Job| async { Ok::<(), HandlerError>(()) });

        let handle = runner.spawn(fast_config().with_lease_timeout(Duration::from_secs(60)));
        wait_for(&handle, |s| s.jobs_reclaimed >= 1 && s.jobs_succeeded == 1).await;
        handle.shutdown().await;

        assert_eq!(store.stats().await.unwrap().done, 1);
    }

    #[tokio::test]
    async fn heartbeat_renews_long_running_jobs() {
        let store = InMemoryJobStore::arc();
        JobProducer::new(store.clone())
            .enqueue("S1", &[JobKind::RegistrySync])
            .await
            .unwrap();

        let mut runner = JobRunner::new(store.clone(), &QueueConfig::default());
        runner.register_handler(JobKind::RegistrySync, |_job: Job| async {
            tokio::time::sleep(Duration::from_millis(120)).await;
            Ok::<(), HandlerError>(())
        });

        let handle = runner.spawn(
            fast_config()
                .with_workers(1)
                .without_reclaimer()
                .with_heartbeat(Duration::from_millis(20)),
        );
        wait_for(&handle, |s| s.jobs_succeeded == 1).await;
        let stats = handle.stats();
        handle.shutdown().await;

        assert!(stats.leases_renewed >= 1, "{stats:?}");
        assert_eq!(stats.leases_lost, 0, "completion must use the renewed lease");
        assert_eq!(store.stats().await.unwrap().done, 1);
    }

    #[tokio::test]
    async fn panicking_handler_fails_the_job_and_keeps_the_worker() {
        let store = InMemoryJobStore::arc();
        let producer = JobProducer::new(store.clone());
        producer.enqueue("poison", &[JobKind::Notify]).await.unwrap();

        let mut runner = JobRunner::new(store.clone(), &QueueConfig::default());
        runner.register_handler(JobKind::Notify, |job: Job| async move {
            if job.subject_id.as_str() == "poison" {
                panic!("handler bug");
            }
            Ok::<(), HandlerError>(())
        });

        let handle = runner.spawn(fast_config().with_workers(1).without_reclaimer());
        wait_for(&handle, |s| s.jobs_failed == 1).await;
        assert_eq!(handle.stats().current_running, 0);

        // The single worker is still alive.
        producer.enqueue("S2", &[JobKind::Notify]).await.unwrap();
        wait_for(&handle, |s| s.jobs_succeeded == 1).await;
        handle.shutdown().await;

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.done, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_idle_workers() {
        let mut runner = JobRunner::new(InMemoryJobStore::arc(), &QueueConfig::default());
        runner.register_handler(JobKind::Notify, |_job: Job| async { Ok::<(), HandlerError>(()) });
        let handle = runner.spawn(JobRunnerConfig::default().with_workers(3));

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("shutdown must not wait for the poll interval");
    }
}
