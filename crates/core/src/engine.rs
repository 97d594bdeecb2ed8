//! The mirror synchronization engine.
//!
//! [`SyncEngine::sync`] drives one mirror end-to-end through the pipeline
//! `init → ensure_remote → fetch → ensure_downstream → push → done`,
//! producing exactly one finalized [`SyncAttempt`] row. Sync-level failures
//! never surface as `Err`: they are classified, scrubbed, and encoded in the
//! attempt's `outcome` + `error_class`. The caller must already hold the
//! mirror's lease.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{self, Classified, ErrorClass};
use crate::config::AppConfig;
use crate::errors::{EngineError, GitError, GiteaError, StoreError};
use crate::git::{dir_size_bytes, urls, GitCmdResult, GitDriver};
use crate::gitea::{CreateRepoOpts, RepoHost};
use crate::models::{Mirror, Outcome, Stage, SyncAttempt, Trigger};
use crate::scrub::Scrubber;
use crate::store::Store;

/// Linear backoff base between in-job retries (5s, 10s, 15s, …).
const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Engine settings, derived from the application config.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL bare `owner/repo` upstream specs resolve against.
    pub upstream_base: String,
    /// Service user namespace for mirrors without a downstream owner.
    pub service_user: String,
    /// Root directory holding one clone per mirror id.
    pub clone_root: PathBuf,
    /// Per-stage timeout for fetch and push.
    pub stage_timeout: Duration,
    /// In-job retry cap.
    pub retry_max: u32,
}

impl EngineConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            upstream_base: config.upstream.base.clone(),
            service_user: config.downstream.user.clone(),
            clone_root: config.sync.local_clone_root.clone(),
            stage_timeout: config.sync.stage_timeout(),
            retry_max: config.sync.retry_max,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline bookkeeping
// ---------------------------------------------------------------------------

/// Per-job mutable state: retry accounting and best-effort counters.
#[derive(Debug, Default)]
struct JobCtx {
    retries_used: u32,
    retry_log: Vec<String>,
    bytes_transferred: u64,
    refs_updated: u64,
}

/// Why the pipeline stopped.
enum PipelineAbort {
    /// Cancellation tripped during the given stage.
    Cancelled(Stage),
    /// A stage failed with a classified error (detail already scrubbed).
    Stage(Stage, Classified),
    /// The store itself failed; nothing more can be recorded.
    Store(StoreError),
}

impl From<StoreError> for PipelineAbort {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The mirror sync engine.
pub struct SyncEngine {
    store: Arc<Store>,
    git: GitDriver,
    host: Arc<dyn RepoHost>,
    scrubber: Scrubber,
    cfg: EngineConfig,
}

impl SyncEngine {
    pub fn new(
        store: Arc<Store>,
        git: GitDriver,
        host: Arc<dyn RepoHost>,
        scrubber: Scrubber,
        cfg: EngineConfig,
    ) -> Self {
        info!(clone_root = %cfg.clone_root.display(), "initializing sync engine");
        Self {
            store,
            git,
            host,
            scrubber,
            cfg,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Local clone directory for a mirror.
    pub fn clone_dir(&self, mirror_id: &str) -> PathBuf {
        self.cfg.clone_root.join(mirror_id)
    }

    /// Delete a mirror together with its history rows (store cascade) and
    /// its local clone directory.
    pub async fn delete_mirror(&self, mirror_id: &str) -> Result<bool, EngineError> {
        let deleted = self.store.delete_mirror(mirror_id)?;
        if deleted {
            if let Err(e) = self.git.remove_clone(&self.clone_dir(mirror_id)).await {
                warn!(mirror_id, error = %e, "failed to remove local clone");
            }
        }
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Execute one sync for `mirror_id`, returning the finalized attempt.
    ///
    /// Precondition: the caller holds the mirror's lease. The mirror row is
    /// snapshotted at `init`; concurrent reconfiguration takes effect on the
    /// next run.
    pub async fn sync(
        &self,
        mirror_id: &str,
        trigger: Trigger,
        cancel: &CancellationToken,
    ) -> Result<SyncAttempt, EngineError> {
        let mirror = self
            .store
            .get_mirror(mirror_id)?
            .ok_or_else(|| EngineError::MirrorNotFound(mirror_id.to_string()))?;

        let attempt_id = self.store.begin_attempt(&mirror.id, trigger)?;
        info!(
            mirror = %mirror.name,
            attempt = %attempt_id,
            %trigger,
            "starting sync"
        );

        let mut ctx = JobCtx::default();
        let result = self.run_pipeline(&mirror, &attempt_id, cancel, &mut ctx).await;

        let (outcome, error_class, error_detail) = match result {
            Ok(()) => (Outcome::Success, None, None),
            Err(PipelineAbort::Cancelled(stage)) => (
                Outcome::Cancelled,
                None,
                Some(format!("cancelled during {stage}")),
            ),
            Err(PipelineAbort::Stage(_, classified)) => {
                let outcome = if classified.class == ErrorClass::Timeout {
                    Outcome::Timeout
                } else {
                    Outcome::Failed
                };
                let mut detail = classified.detail;
                if !ctx.retry_log.is_empty() {
                    detail.push('\n');
                    detail.push_str(&ctx.retry_log.join("\n"));
                }
                (outcome, Some(classified.class), Some(detail))
            }
            Err(PipelineAbort::Store(e)) => return Err(EngineError::Store(e)),
        };

        self.store.finalize_attempt(
            &attempt_id,
            outcome,
            error_class.map(|c| c.as_str()),
            error_detail.as_deref(),
            ctx.bytes_transferred,
            ctx.refs_updated,
        )?;

        let attempt = self.store.get_attempt(&attempt_id)?.ok_or(StoreError::NotFound {
            entity: "sync_attempt",
            id: attempt_id.clone(),
        })?;

        match outcome {
            Outcome::Success => info!(
                mirror = %mirror.name,
                refs = ctx.refs_updated,
                bytes = ctx.bytes_transferred,
                "sync succeeded"
            ),
            _ => warn!(
                mirror = %mirror.name,
                %outcome,
                stage = %attempt.stage_reached,
                class = error_class.map(|c| c.as_str()).unwrap_or("-"),
                "sync did not succeed"
            ),
        }

        Ok(attempt)
    }

    /// Operator-facing summary for a finished attempt, for the mirror row.
    pub fn completion_summary(attempt: &SyncAttempt) -> Option<String> {
        match attempt.outcome {
            Some(Outcome::Success) | None => None,
            Some(Outcome::Cancelled) => Some("sync cancelled".to_string()),
            Some(_) => Some(
                attempt
                    .error_class
                    .as_deref()
                    .map(|c| ErrorClass::from_str_val(c).summary().to_string())
                    .unwrap_or_else(|| "sync failed".to_string()),
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Pipeline stages
    // -----------------------------------------------------------------------

    async fn run_pipeline(
        &self,
        mirror: &Mirror,
        attempt_id: &str,
        cancel: &CancellationToken,
        ctx: &mut JobCtx,
    ) -> Result<(), PipelineAbort> {
        // init: the attempt row exists (stage defaults to init); make sure
        // the clone root does too.
        if let Err(e) = std::fs::create_dir_all(&self.cfg.clone_root) {
            let classified = classify::classify_io(Stage::Init, &e);
            return Err(self.stage_failure(Stage::Init, classified));
        }
        if cancel.is_cancelled() {
            return Err(PipelineAbort::Cancelled(Stage::Init));
        }

        let dir = self.clone_dir(&mirror.id);
        let upstream = urls::resolve_upstream_url(&self.cfg.upstream_base, &mirror.upstream_url);

        self.store.advance_attempt_stage(attempt_id, Stage::EnsureRemote)?;
        self.ensure_remote(mirror, &dir, &upstream, cancel, ctx).await?;

        self.store.advance_attempt_stage(attempt_id, Stage::Fetch)?;
        self.fetch(&dir, cancel, ctx).await?;

        self.store
            .advance_attempt_stage(attempt_id, Stage::EnsureDownstream)?;
        self.ensure_downstream(mirror, cancel, ctx).await?;

        self.store.advance_attempt_stage(attempt_id, Stage::Push)?;
        self.push(mirror, &dir, cancel, ctx).await?;

        self.store.advance_attempt_stage(attempt_id, Stage::Done)?;

        // Best-effort size statistics.
        let size_mb = dir_size_bytes(&dir) as f64 / (1024.0 * 1024.0);
        if let Err(e) = self.store.update_mirror_size(&mirror.id, size_mb) {
            warn!(mirror = %mirror.name, error = %e, "failed to record clone size");
        }

        Ok(())
    }

    /// Ensure the local clone exists, is healthy, and points at the current
    /// upstream. A corrupt clone or a reconfigured upstream URL causes the
    /// clone to be deleted and recreated from scratch.
    async fn ensure_remote(
        &self,
        mirror: &Mirror,
        dir: &Path,
        upstream: &str,
        cancel: &CancellationToken,
        ctx: &mut JobCtx,
    ) -> Result<(), PipelineAbort> {
        let stage = Stage::EnsureRemote;

        let healthy = self
            .git
            .sanity_check(dir)
            .await
            .map_err(|e| self.git_error(stage, e))?;

        if healthy {
            let current = self
                .git
                .remote_url(dir)
                .await
                .map_err(|e| self.git_error(stage, e))?;
            if current.as_deref() == Some(upstream) {
                debug!(mirror = %mirror.name, "local clone is healthy");
                return Ok(());
            }
            info!(
                mirror = %mirror.name,
                "upstream URL changed; recreating local clone"
            );
            self.git
                .remove_clone(dir)
                .await
                .map_err(|e| self.git_error(stage, e))?;
        } else if dir.exists() {
            warn!(
                mirror = %mirror.name,
                "local clone failed sanity check; recreating"
            );
            self.git
                .remove_clone(dir)
                .await
                .map_err(|e| self.git_error(stage, e))?;
        }

        self.run_git_with_retry(stage, cancel, ctx, || {
            self.git
                .clone_mirror(upstream, dir, self.cfg.stage_timeout, cancel)
        })
        .await?;
        Ok(())
    }

    async fn fetch(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
        ctx: &mut JobCtx,
    ) -> Result<(), PipelineAbort> {
        let before = dir_size_bytes(dir);
        let result = self
            .run_git_with_retry(Stage::Fetch, cancel, ctx, || {
                self.git.fetch_prune(dir, self.cfg.stage_timeout, cancel)
            })
            .await?;
        ctx.refs_updated += result.refs_updated;
        ctx.bytes_transferred += dir_size_bytes(dir).saturating_sub(before);
        Ok(())
    }

    /// Verify the downstream repository exists, creating it in the correct
    /// namespace if not. `downstream_owner` set means the **organization**
    /// endpoint, unconditionally: Gitea rejects push-to-create for org
    /// namespaces, and falling back to the user endpoint would silently
    /// mirror into the wrong namespace.
    async fn ensure_downstream(
        &self,
        mirror: &Mirror,
        cancel: &CancellationToken,
        ctx: &mut JobCtx,
    ) -> Result<(), PipelineAbort> {
        let stage = Stage::EnsureDownstream;
        let owner = mirror.downstream_namespace(&self.cfg.service_user).to_string();

        loop {
            let result = tokio::select! {
                result = self.try_ensure_downstream(mirror, &owner) => result,
                _ = cancel.cancelled() => return Err(PipelineAbort::Cancelled(stage)),
            };
            match result {
                Ok(()) => return Ok(()),
                // Already exists: the idempotent outcome we wanted.
                Err(GiteaError::Conflict(_)) => {
                    debug!(owner = %owner, name = %mirror.downstream_name, "repository already exists");
                    return Ok(());
                }
                Err(e) => {
                    let classified = classify::classify_gitea(stage, &e);
                    self.backoff_or_fail(stage, classified, cancel, ctx).await?;
                }
            }
        }
    }

    async fn try_ensure_downstream(
        &self,
        mirror: &Mirror,
        owner: &str,
    ) -> Result<(), GiteaError> {
        if self
            .host
            .repo_exists(owner, &mirror.downstream_name)
            .await?
        {
            return Ok(());
        }
        info!(
            owner,
            name = %mirror.downstream_name,
            org = mirror.targets_org(),
            "downstream repository missing; creating"
        );
        let opts = CreateRepoOpts::mirror_of(&mirror.upstream_url);
        if mirror.targets_org() {
            self.host
                .create_org_repo(&mirror.downstream_owner, &mirror.downstream_name, &opts)
                .await
        } else {
            self.host
                .create_user_repo(&mirror.downstream_name, &opts)
                .await
        }
    }

    async fn push(
        &self,
        mirror: &Mirror,
        dir: &Path,
        cancel: &CancellationToken,
        ctx: &mut JobCtx,
    ) -> Result<(), PipelineAbort> {
        let owner = mirror.downstream_namespace(&self.cfg.service_user);
        let push_url = self.host.push_url(owner, &mirror.downstream_name);
        debug!(
            mirror = %mirror.name,
            target = %self.scrubber.scrub_url(&push_url),
            "pushing mirror"
        );
        let result = self
            .run_git_with_retry(Stage::Push, cancel, ctx, || {
                self.git
                    .push_mirror(dir, &push_url, self.cfg.stage_timeout, cancel)
            })
            .await?;
        ctx.refs_updated += result.refs_updated;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Retry plumbing
    // -----------------------------------------------------------------------

    /// Run a git operation, retrying retryable failures in-job with linear
    /// backoff up to the class's budget. Retries never create new attempt
    /// rows; they are recorded in the retry log for `error_detail`.
    async fn run_git_with_retry<F, Fut>(
        &self,
        stage: Stage,
        cancel: &CancellationToken,
        ctx: &mut JobCtx,
        mut op: F,
    ) -> Result<GitCmdResult, PipelineAbort>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<GitCmdResult, GitError>>,
    {
        loop {
            if cancel.is_cancelled() {
                return Err(PipelineAbort::Cancelled(stage));
            }
            let result = op().await.map_err(|e| self.git_error(stage, e))?;
            if result.success() {
                return Ok(result);
            }
            if result.cancelled {
                return Err(PipelineAbort::Cancelled(stage));
            }
            let classified = classify::classify_git(stage, &result);
            self.backoff_or_fail(stage, classified, cancel, ctx).await?;
        }
    }

    /// Shared retry decision: either sleep before the next try or convert
    /// the classified failure into a pipeline abort.
    async fn backoff_or_fail(
        &self,
        stage: Stage,
        classified: Classified,
        cancel: &CancellationToken,
        ctx: &mut JobCtx,
    ) -> Result<(), PipelineAbort> {
        let budget = classified.class.retry_budget(self.cfg.retry_max);
        if !classified.class.retryable() || ctx.retries_used >= budget {
            return Err(self.stage_failure(stage, classified));
        }

        ctx.retries_used += 1;
        let delay = classified
            .retry_after
            .unwrap_or(RETRY_BACKOFF_BASE * ctx.retries_used);
        let line = format!(
            "retry {} at {stage} ({}) after {:?}",
            ctx.retries_used,
            classified.class.as_str(),
            delay
        );
        warn!(
            stage = %stage,
            class = classified.class.as_str(),
            retry = ctx.retries_used,
            delay_secs = delay.as_secs(),
            "retryable failure, backing off"
        );
        ctx.retry_log.push(line);

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(PipelineAbort::Cancelled(stage)),
        }
    }

    /// Wrap a driver-level error (spawn failure, missing binary, local I/O)
    /// as a classified stage failure.
    fn git_error(&self, stage: Stage, error: GitError) -> PipelineAbort {
        let classified = match &error {
            GitError::Io(io) => classify::classify_io(stage, io),
            _ => Classified {
                class: ErrorClass::LocalIo,
                detail: format!("{stage}: {error}"),
                retry_after: None,
            },
        };
        self.stage_failure(stage, classified)
    }

    /// Scrub the diagnostic text before it can reach persistence or logs.
    fn stage_failure(&self, stage: Stage, mut classified: Classified) -> PipelineAbort {
        classified.detail = self.scrubber.scrub(&classified.detail);
        PipelineAbort::Stage(stage, classified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_summary() {
        let mut attempt = SyncAttempt {
            id: "a1".into(),
            mirror_id: "m1".into(),
            trigger: Trigger::Manual,
            outcome: Some(Outcome::Success),
            stage_reached: Stage::Done,
            error_class: None,
            error_detail: None,
            bytes_transferred: 0,
            refs_updated: 0,
            started_at: chrono::Utc::now(),
            finished_at: Some(chrono::Utc::now()),
        };
        assert!(SyncEngine::completion_summary(&attempt).is_none());

        attempt.outcome = Some(Outcome::Failed);
        attempt.error_class = Some("downstream_forbidden".into());
        let summary = SyncEngine::completion_summary(&attempt).unwrap();
        assert!(summary.contains("write:organization"));

        attempt.outcome = Some(Outcome::Cancelled);
        assert_eq!(
            SyncEngine::completion_summary(&attempt).as_deref(),
            Some("sync cancelled")
        );
    }
}
