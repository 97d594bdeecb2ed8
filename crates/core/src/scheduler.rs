//! Scheduler and worker pool.
//!
//! Two cooperating halves: a **planner** that decides when each mirror is due
//! and enqueues jobs, and a fixed pool of **workers** that drain the queue
//! under the per-mirror lease. Manual triggers from the external surface go
//! through [`SchedulerHandle`], which coalesces to `AlreadyRunning` instead
//! of queuing behind an in-flight sync.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classify::ErrorClass;
use crate::config::AppConfig;
use crate::engine::SyncEngine;
use crate::errors::StoreError;
use crate::models::{Outcome, Trigger};
use crate::store::{LeaseCompletion, MirrorFilter, Store};

/// Queue depth; enqueue refusals beyond this mean the pool is badly behind.
const QUEUE_CAPACITY: usize = 1024;

/// Scheduler settings, derived from the application config.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker pool size.
    pub workers: usize,
    /// Default sync interval for mirrors without an override.
    pub default_interval: Duration,
    /// Lease TTL handed to the store on acquisition.
    pub lease_ttl: Duration,
    /// Cap on job-level retry chains.
    pub retry_max: u32,
    /// Base for the chain's capped exponential backoff.
    pub retry_backoff_base: Duration,
    /// Upper bound on planner sleep so newly added mirrors are noticed.
    pub planner_max_sleep: Duration,
    /// How long shutdown waits for workers to drain before giving up.
    pub shutdown_grace: Duration,
}

impl SchedulerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            workers: config.sync.max_concurrent.max(1),
            default_interval: config.sync.default_interval(),
            lease_ttl: config.sync.lease_ttl(),
            retry_max: config.sync.retry_max,
            retry_backoff_base: Duration::from_secs(30),
            planner_max_sleep: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Result of a manual trigger request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Job enqueued.
    Accepted,
    /// A sync for this mirror is running or already queued; not queued again.
    AlreadyRunning,
    /// No such mirror.
    NotFound,
}

/// One unit of work for the pool.
#[derive(Debug, Clone)]
struct Job {
    mirror_id: String,
    trigger: Trigger,
    /// Retry-chain depth; 0 for fresh jobs.
    chain: u32,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    store: Arc<Store>,
    tx: mpsc::Sender<Job>,
    /// Mirror ids queued but not yet picked up, for trigger coalescing.
    pending: StdMutex<HashSet<String>>,
    /// Cancellation token per in-flight mirror sync.
    active: StdMutex<HashMap<String, CancellationToken>>,
    /// Root token: cancelling it stops the planner, the workers, and every
    /// in-flight job (their tokens are children of this one).
    root: CancellationToken,
    /// Wakes the planner out of its due-time sleep.
    planner_notify: Notify,
    cfg: SchedulerConfig,
}

impl Shared {
    /// Enqueue a job unless the mirror is already queued or leased.
    async fn enqueue(&self, mirror_id: &str, trigger: Trigger, chain: u32) -> Result<bool, StoreError> {
        if self.root.is_cancelled() {
            return Ok(false);
        }
        if self.store.lease_live(mirror_id)? {
            return Ok(false);
        }
        {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            if !pending.insert(mirror_id.to_string()) {
                return Ok(false);
            }
        }
        let job = Job {
            mirror_id: mirror_id.to_string(),
            trigger,
            chain,
        };
        if self.tx.send(job).await.is_err() {
            self.remove_pending(mirror_id);
            return Ok(false);
        }
        Ok(true)
    }

    fn remove_pending(&self, mirror_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(mirror_id);
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle the external surface uses to drive the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Manually trigger a sync. Bypasses `enabled` and the due check, but
    /// still obeys the lease: a running or queued sync coalesces into
    /// [`TriggerOutcome::AlreadyRunning`].
    pub async fn trigger(&self, mirror_id: &str) -> Result<TriggerOutcome, StoreError> {
        if self.shared.store.get_mirror(mirror_id)?.is_none() {
            return Ok(TriggerOutcome::NotFound);
        }
        if self.shared.enqueue(mirror_id, Trigger::Manual, 0).await? {
            self.shared.planner_notify.notify_one();
            Ok(TriggerOutcome::Accepted)
        } else {
            Ok(TriggerOutcome::AlreadyRunning)
        }
    }

    /// Enqueue every enabled mirror. Returns how many jobs were queued.
    pub async fn trigger_all(&self) -> Result<usize, StoreError> {
        let mirrors = self
            .shared
            .store
            .list_mirrors(MirrorFilter { enabled_only: true })?;
        let mut queued = 0;
        for mirror in mirrors {
            if self.shared.enqueue(&mirror.id, Trigger::Manual, 0).await? {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Cancel an in-flight sync. Returns `false` when nothing is running for
    /// the mirror.
    pub fn cancel(&self, mirror_id: &str) -> bool {
        let active = self
            .shared
            .active
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        match active.get(mirror_id) {
            Some(token) => {
                info!(mirror_id, "cancelling in-flight sync");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a sync is currently running for the mirror.
    pub fn is_running(&self, mirror_id: &str) -> bool {
        self.shared
            .active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(mirror_id)
    }

    /// Begin shutdown: the planner stops, queued jobs are dropped, and every
    /// in-flight job's cancellation token trips.
    pub fn shutdown(&self) {
        info!("scheduler shutdown requested");
        self.shared.root.cancel();
        self.shared.planner_notify.notify_one();
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// The scheduler: planner plus worker pool.
pub struct Scheduler {
    shared: Arc<Shared>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    engine: Arc<SyncEngine>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, cfg: SchedulerConfig) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            store: engine.store().clone(),
            tx,
            pending: StdMutex::new(HashSet::new()),
            active: StdMutex::new(HashMap::new()),
            root: CancellationToken::new(),
            planner_notify: Notify::new(),
            cfg,
        });
        let handle = SchedulerHandle {
            shared: shared.clone(),
        };
        let scheduler = Self {
            shared,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            engine,
        };
        (scheduler, handle)
    }

    /// Run until shutdown, then drain workers within the grace window.
    pub async fn run(self) {
        let cfg = self.shared.cfg.clone();
        info!(
            workers = cfg.workers,
            interval_secs = cfg.default_interval.as_secs(),
            "scheduler started"
        );

        let planner = tokio::spawn(planner_loop(self.shared.clone()));

        let mut workers = Vec::with_capacity(cfg.workers);
        for n in 0..cfg.workers {
            workers.push(tokio::spawn(worker_loop(
                n,
                self.shared.clone(),
                self.rx.clone(),
                self.engine.clone(),
            )));
        }

        self.shared.root.cancelled().await;

        // Grace window for in-flight jobs to observe cancellation and
        // finalize their attempts.
        let drain = async {
            let _ = planner.await;
            for worker in workers {
                let _ = worker.await;
            }
        };
        match tokio::time::timeout(cfg.shutdown_grace, drain).await {
            Ok(()) => info!("scheduler stopped gracefully"),
            Err(_) => warn!(
                grace_secs = cfg.shutdown_grace.as_secs(),
                "scheduler drain exceeded grace period"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Enqueue due mirrors, then sleep until the nearest due instant (bounded),
/// waking early on explicit triggers.
async fn planner_loop(shared: Arc<Shared>) {
    loop {
        if shared.root.is_cancelled() {
            break;
        }

        match shared.store.due_mirrors(shared.cfg.default_interval) {
            Ok(due) => {
                for mirror in due {
                    match shared.enqueue(&mirror.id, Trigger::Scheduled, 0).await {
                        Ok(true) => debug!(mirror = %mirror.name, "enqueued scheduled sync"),
                        Ok(false) => {}
                        Err(e) => error!(mirror = %mirror.name, error = %e, "failed to enqueue"),
                    }
                }
            }
            Err(e) => error!(error = %e, "planner failed to query due mirrors"),
        }

        let sleep_for = next_due_in(&shared)
            .unwrap_or(shared.cfg.planner_max_sleep)
            .min(shared.cfg.planner_max_sleep)
            .max(Duration::from_millis(100));

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = shared.planner_notify.notified() => {}
            _ = shared.root.cancelled() => break,
        }
    }
    debug!("planner stopped");
}

/// Time until the nearest enabled mirror becomes due.
fn next_due_in(shared: &Shared) -> Option<Duration> {
    let mirrors = shared
        .store
        .list_mirrors(MirrorFilter { enabled_only: true })
        .ok()?;
    let now = Utc::now();
    mirrors
        .iter()
        .map(|m| {
            let interval = m
                .sync_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(shared.cfg.default_interval);
            match m.last_attempt_at {
                None => Duration::ZERO,
                Some(last) => {
                    let due_at = last + chrono::Duration::from_std(interval).unwrap_or_default();
                    (due_at - now).to_std().unwrap_or(Duration::ZERO)
                }
            }
        })
        .min()
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Drain the queue: lease, sync, release. Jobs whose lease is contended are
/// dropped; the next planner tick re-enqueues them.
async fn worker_loop(
    n: usize,
    shared: Arc<Shared>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    engine: Arc<SyncEngine>,
) {
    let worker_id = format!("worker-{n}-{}", Uuid::new_v4());
    debug!(worker = %worker_id, "worker started");

    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                job = rx.recv() => job,
                _ = shared.root.cancelled() => None,
            }
        };
        let Some(job) = job else { break };
        shared.remove_pending(&job.mirror_id);
        if shared.root.is_cancelled() {
            break;
        }

        run_job(&shared, &engine, &worker_id, job).await;
    }
    debug!(worker = %worker_id, "worker stopped");
}

async fn run_job(shared: &Arc<Shared>, engine: &Arc<SyncEngine>, worker_id: &str, job: Job) {
    match shared
        .store
        .acquire_lease(&job.mirror_id, worker_id, shared.cfg.lease_ttl)
    {
        Ok(true) => {}
        Ok(false) => {
            debug!(mirror_id = %job.mirror_id, "lease contended; dropping job");
            return;
        }
        Err(e) => {
            error!(mirror_id = %job.mirror_id, error = %e, "lease acquisition failed");
            return;
        }
    }

    let token = shared.root.child_token();
    shared
        .active
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .insert(job.mirror_id.clone(), token.clone());

    let result = engine.sync(&job.mirror_id, job.trigger, &token).await;

    shared
        .active
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .remove(&job.mirror_id);

    match result {
        Ok(attempt) => {
            // `last_success_at` records the successful attempt's start, so
            // it can never exceed `last_attempt_at`.
            let completion = match attempt.outcome {
                Some(Outcome::Success) => LeaseCompletion::Success {
                    at: attempt.started_at,
                },
                Some(Outcome::Cancelled) | None => LeaseCompletion::Abandoned,
                Some(_) => LeaseCompletion::Failed {
                    summary: SyncEngine::completion_summary(&attempt)
                        .unwrap_or_else(|| "sync failed".to_string()),
                },
            };
            if let Err(e) = shared
                .store
                .release_lease(&job.mirror_id, worker_id, &completion)
            {
                error!(mirror_id = %job.mirror_id, error = %e, "lease release failed");
            }
            schedule_chain_retry(shared, &job, &attempt);
        }
        Err(e) => {
            error!(mirror_id = %job.mirror_id, error = %e, "sync aborted");
            if let Err(e) = shared
                .store
                .release_lease(&job.mirror_id, worker_id, &LeaseCompletion::Abandoned)
            {
                error!(mirror_id = %job.mirror_id, error = %e, "lease release failed");
            }
        }
    }
}

/// After a retryable failure, re-enqueue the mirror with `trigger=retry` and
/// capped exponential backoff, bounded by the class's chain budget.
fn schedule_chain_retry(shared: &Arc<Shared>, job: &Job, attempt: &crate::models::SyncAttempt) {
    let retryable = match (&attempt.outcome, &attempt.error_class) {
        (Some(Outcome::Failed) | Some(Outcome::Timeout), Some(class)) => {
            let class = ErrorClass::from_str_val(class);
            job.chain < class.retry_budget(shared.cfg.retry_max)
        }
        _ => false,
    };
    if !retryable || shared.root.is_cancelled() {
        return;
    }

    let delay = shared
        .cfg
        .retry_backoff_base
        .saturating_mul(1u32 << job.chain.min(5))
        .min(Duration::from_secs(900));
    info!(
        mirror_id = %job.mirror_id,
        chain = job.chain + 1,
        delay_secs = delay.as_secs(),
        "scheduling retry"
    );

    let shared = shared.clone();
    let mirror_id = job.mirror_id.clone();
    let chain = job.chain + 1;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                if let Err(e) = shared.enqueue(&mirror_id, Trigger::Retry, chain).await {
                    error!(mirror_id = %mirror_id, error = %e, "failed to enqueue retry");
                }
            }
            _ = shared.root.cancelled() => {}
        }
    });
}
