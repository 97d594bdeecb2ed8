//! End-to-end tests for the scheduler and worker pool.
//!
//! Exercises the real planner/worker machinery against local git
//! repositories and a slow `RepoHost` fake, verifying trigger coalescing,
//! per-mirror serialization, and graceful shutdown. Tests skip gracefully if
//! `git` is not installed.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use gitmirror_core::engine::{EngineConfig, SyncEngine};
use gitmirror_core::errors::GiteaError;
use gitmirror_core::git::GitDriver;
use gitmirror_core::gitea::{CreateRepoOpts, RepoHost};
use gitmirror_core::models::{MirrorSpec, MirrorStatus, Outcome, Trigger};
use gitmirror_core::scheduler::{Scheduler, SchedulerConfig, TriggerOutcome};
use gitmirror_core::scrub::Scrubber;
use gitmirror_core::store::Store;

// ===========================================================================
// Helpers
// ===========================================================================

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn create_upstream(root: &Path, name: &str) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    run_git(&dir, &["init"]);
    run_git(&dir, &["config", "user.email", "dev@example.com"]);
    run_git(&dir, &["config", "user.name", "Dev"]);
    std::fs::write(dir.join("README.md"), "# demo\n").unwrap();
    run_git(&dir, &["add", "."]);
    run_git(&dir, &["commit", "-m", "initial commit"]);
    dir
}

/// Poll until `predicate` holds or the deadline passes.
async fn wait_until<F>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ===========================================================================
// Slow host fake
// ===========================================================================

/// Minimal host whose existence check sleeps, widening the window in which a
/// sync is observably "running".
struct SlowHost {
    push_root: PathBuf,
    created: Mutex<Vec<String>>,
    delay: Duration,
}

impl SlowHost {
    fn bare_path(&self, owner: &str, name: &str) -> PathBuf {
        self.push_root.join(owner).join(format!("{name}.git"))
    }
}

#[async_trait]
impl RepoHost for SlowHost {
    async fn whoami(&self) -> Result<String, GiteaError> {
        Ok("svc".into())
    }

    async fn repo_exists(&self, owner: &str, name: &str) -> Result<bool, GiteaError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.bare_path(owner, name).exists())
    }

    async fn create_user_repo(&self, name: &str, _opts: &CreateRepoOpts) -> Result<(), GiteaError> {
        let path = self.bare_path("svc", name);
        std::fs::create_dir_all(&path).unwrap();
        let output = Command::new("git")
            .args(["init", "--bare", path.to_str().unwrap()])
            .output()
            .unwrap();
        assert!(output.status.success());
        self.created.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn create_org_repo(
        &self,
        org: &str,
        name: &str,
        _opts: &CreateRepoOpts,
    ) -> Result<(), GiteaError> {
        let path = self.bare_path(org, name);
        std::fs::create_dir_all(&path).unwrap();
        let output = Command::new("git")
            .args(["init", "--bare", path.to_str().unwrap()])
            .output()
            .unwrap();
        assert!(output.status.success());
        Ok(())
    }

    async fn delete_repo(&self, _owner: &str, _name: &str) -> Result<(), GiteaError> {
        Ok(())
    }

    fn push_url(&self, owner: &str, name: &str) -> String {
        self.bare_path(owner, name).to_string_lossy().to_string()
    }
}

// ===========================================================================
// Fixture
// ===========================================================================

struct Fixture {
    _tmp: TempDir,
    root: PathBuf,
    store: Arc<Store>,
    engine: Arc<SyncEngine>,
}

fn fixture(host_delay: Duration) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().to_path_buf();

    let store = Arc::new(Store::in_memory().unwrap());
    store.initialize().unwrap();

    let host = Arc::new(SlowHost {
        push_root: root.join("gitea"),
        created: Mutex::new(Vec::new()),
        delay: host_delay,
    });
    std::fs::create_dir_all(&host.push_root).unwrap();
    let git = GitDriver::new(None, &root.join("helpers"), None).unwrap();

    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        git,
        host,
        Scrubber::default(),
        EngineConfig {
            upstream_base: "https://github.com".into(),
            service_user: "svc".into(),
            clone_root: root.join("clones"),
            stage_timeout: Duration::from_secs(60),
            retry_max: 2,
        },
    ));

    Fixture {
        _tmp: tmp,
        root,
        store,
        engine,
    }
}

fn scheduler_config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        workers,
        default_interval: Duration::from_secs(3600),
        lease_ttl: Duration::from_secs(120),
        retry_max: 2,
        retry_backoff_base: Duration::from_millis(50),
        planner_max_sleep: Duration::from_millis(200),
        shutdown_grace: Duration::from_secs(10),
    }
}

fn register_mirror(fx: &Fixture, name: &str, upstream: &Path) -> String {
    let spec = MirrorSpec {
        name: name.to_string(),
        upstream_url: upstream.to_string_lossy().to_string(),
        downstream_owner: String::new(),
        downstream_name: name.to_string(),
        enabled: true,
        sync_interval_secs: None,
        priority: 0,
    };
    fx.store.upsert_mirror(&spec).unwrap().id
}

fn finished_attempts(store: &Store, mirror_id: &str) -> Vec<gitmirror_core::models::SyncAttempt> {
    store
        .recent_history(Some(mirror_id), 100)
        .unwrap()
        .into_iter()
        .filter(|a| a.outcome.is_some())
        .collect()
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn planner_syncs_never_attempted_mirror() {
    if !git_available() {
        eprintln!("skipping: git not installed");
        return;
    }
    let fx = fixture(Duration::ZERO);
    let upstream = create_upstream(&fx.root, "upstream-auto");
    let mirror_id = register_mirror(&fx, "auto", &upstream);

    let (scheduler, handle) = Scheduler::new(fx.engine.clone(), scheduler_config(2));
    let task = tokio::spawn(scheduler.run());

    // Never-attempted mirrors are due immediately; the planner picks it up
    // without any manual trigger.
    let store = fx.store.clone();
    let id = mirror_id.clone();
    wait_until(Duration::from_secs(30), || {
        finished_attempts(&store, &id)
            .iter()
            .any(|a| a.outcome == Some(Outcome::Success) && a.trigger == Trigger::Scheduled)
    })
    .await;

    let mirror = fx.store.get_mirror(&mirror_id).unwrap().unwrap();
    assert_eq!(mirror.last_status, MirrorStatus::Success);
    assert!(mirror.last_success_at.unwrap() <= mirror.last_attempt_at.unwrap());

    handle.shutdown();
    let _ = task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s5_manual_trigger_during_running_sync_coalesces() {
    if !git_available() {
        eprintln!("skipping: git not installed");
        return;
    }
    // The slow host keeps each sync in ensure_downstream for a while.
    let fx = fixture(Duration::from_millis(800));
    let upstream = create_upstream(&fx.root, "upstream-coalesce");
    let mirror_id = register_mirror(&fx, "demo", &upstream);

    // Long planner sleep so only manual triggers drive this test.
    let mut cfg = scheduler_config(2);
    cfg.planner_max_sleep = Duration::from_secs(60);
    // Mark the mirror as recently attempted so the planner stays out.
    fx.store.begin_attempt(&mirror_id, Trigger::Manual).and_then(|id| {
        fx.store
            .finalize_attempt(&id, Outcome::Failed, Some("unknown"), None, 0, 0)
            .map(|_| ())
    })
    .unwrap();

    let (scheduler, handle) = Scheduler::new(fx.engine.clone(), cfg);
    let task = tokio::spawn(scheduler.run());

    assert_eq!(handle.trigger(&mirror_id).await.unwrap(), TriggerOutcome::Accepted);

    // Wait until the job holds the lease, then trigger again: the caller is
    // told "already running" instead of being queued behind it.
    let store = fx.store.clone();
    let id = mirror_id.clone();
    wait_until(Duration::from_secs(10), || store.lease_live(&id).unwrap()).await;
    assert_eq!(
        handle.trigger(&mirror_id).await.unwrap(),
        TriggerOutcome::AlreadyRunning
    );

    // Only the accepted trigger produced an attempt.
    let store = fx.store.clone();
    let id = mirror_id.clone();
    wait_until(Duration::from_secs(30), || {
        !store.lease_live(&id).unwrap()
            && finished_attempts(&store, &id)
                .iter()
                .any(|a| a.outcome == Some(Outcome::Success))
    })
    .await;

    let manual_attempts: Vec<_> = finished_attempts(&fx.store, &mirror_id)
        .into_iter()
        .filter(|a| a.trigger == Trigger::Manual && a.outcome == Some(Outcome::Success))
        .collect();
    assert_eq!(manual_attempts.len(), 1);

    handle.shutdown();
    let _ = task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn attempts_for_one_mirror_never_overlap() {
    if !git_available() {
        eprintln!("skipping: git not installed");
        return;
    }
    let fx = fixture(Duration::from_millis(200));
    let upstream = create_upstream(&fx.root, "upstream-serial");
    let mirror_id = register_mirror(&fx, "demo", &upstream);

    let (scheduler, handle) = Scheduler::new(fx.engine.clone(), scheduler_config(3));
    let task = tokio::spawn(scheduler.run());

    // Hammer the trigger while the planner also runs; the lease must keep
    // every executed attempt strictly serialized.
    for _ in 0..10 {
        let _ = handle.trigger(&mirror_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
    }

    let store = fx.store.clone();
    let id = mirror_id.clone();
    wait_until(Duration::from_secs(60), || {
        !store.lease_live(&id).unwrap()
            && !finished_attempts(&store, &id).is_empty()
    })
    .await;
    handle.shutdown();
    let _ = task.await;

    let mut attempts = finished_attempts(&fx.store, &mirror_id);
    attempts.sort_by_key(|a| a.started_at);
    for pair in attempts.windows(2) {
        let earlier = &pair[0];
        let later = &pair[1];
        assert!(
            earlier.finished_at.unwrap() <= later.started_at,
            "attempts overlap: {} and {}",
            earlier.id,
            later.id
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_cancels_in_flight_sync() {
    if !git_available() {
        eprintln!("skipping: git not installed");
        return;
    }
    // Long host delay: the sync will be mid-ensure_downstream at shutdown.
    let fx = fixture(Duration::from_secs(20));
    let upstream = create_upstream(&fx.root, "upstream-shutdown");
    let mirror_id = register_mirror(&fx, "demo", &upstream);

    let (scheduler, handle) = Scheduler::new(fx.engine.clone(), scheduler_config(1));
    let task = tokio::spawn(scheduler.run());

    assert_eq!(handle.trigger(&mirror_id).await.unwrap(), TriggerOutcome::Accepted);
    let store = fx.store.clone();
    let id = mirror_id.clone();
    wait_until(Duration::from_secs(10), || store.lease_live(&id).unwrap()).await;

    handle.shutdown();
    let _ = task.await;

    // The in-flight attempt was finalized as cancelled and the lease
    // released, restoring the pre-sync status.
    let attempts = finished_attempts(&fx.store, &mirror_id);
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, Some(Outcome::Cancelled));
    assert!(!fx.store.lease_live(&mirror_id).unwrap());
    let mirror = fx.store.get_mirror(&mirror_id).unwrap().unwrap();
    assert_ne!(mirror.last_status, MirrorStatus::Running);
}
