//! Domain model types used throughout GitMirror.
//!
//! These types bridge the sync engine, scheduler, and store layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Mirror
// ---------------------------------------------------------------------------

/// One upstream→downstream repository mapping.
///
/// `downstream_owner` is an **organization name** when non-empty; the mirror
/// is then created and pushed under that org. When empty the mirror lives
/// under the configured service user's namespace. The two must never be
/// conflated: Gitea rejects push-to-create for organization namespaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mirror {
    pub id: String,
    pub name: String,
    pub upstream_url: String,
    pub downstream_owner: String,
    pub downstream_name: String,
    pub enabled: bool,
    /// Per-mirror override of the global sync interval, in seconds.
    pub sync_interval_secs: Option<u64>,
    /// Planner ordering hint: higher syncs first among due mirrors.
    pub priority: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_status: MirrorStatus,
    pub last_error_summary: Option<String>,
    /// Best-effort size of the local clone, refreshed after each success.
    pub size_mb: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mirror {
    /// The downstream namespace this mirror targets: the organization if one
    /// is configured, otherwise the given service user.
    pub fn downstream_namespace<'a>(&'a self, service_user: &'a str) -> &'a str {
        if self.downstream_owner.is_empty() {
            service_user
        } else {
            &self.downstream_owner
        }
    }

    /// Whether the mirror targets an organization namespace.
    pub fn targets_org(&self) -> bool {
        !self.downstream_owner.is_empty()
    }
}

/// Fields supplied when creating or updating a mirror.
///
/// Status fields are owned by the engine and cannot be set through upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorSpec {
    pub name: String,
    pub upstream_url: String,
    #[serde(default)]
    pub downstream_owner: String,
    pub downstream_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub sync_interval_secs: Option<u64>,
    #[serde(default)]
    pub priority: i64,
}

fn default_enabled() -> bool {
    true
}

/// Last observed status of a mirror.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MirrorStatus {
    Never,
    Success,
    Failed,
    Running,
}

impl MirrorStatus {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "failed" => Self::Failed,
            "running" => Self::Running,
            _ => Self::Never,
        }
    }
}

impl std::fmt::Display for MirrorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => write!(f, "never"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Running => write!(f, "running"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync attempts
// ---------------------------------------------------------------------------

/// What caused a sync to run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
    Retry,
}

impl Trigger {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "manual" => Self::Manual,
            "retry" => Self::Retry,
            _ => Self::Scheduled,
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Manual => write!(f, "manual"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

/// Terminal result of a sync attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
    Cancelled,
    Timeout,
}

impl Outcome {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "cancelled" => Self::Cancelled,
            "timeout" => Self::Timeout,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Pipeline stages, in execution order. `stage_reached` on an attempt records
/// the furthest stage entered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    EnsureRemote,
    Fetch,
    EnsureDownstream,
    Push,
    Done,
}

impl Stage {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "ensure_remote" => Self::EnsureRemote,
            "fetch" => Self::Fetch,
            "ensure_downstream" => Self::EnsureDownstream,
            "push" => Self::Push,
            "done" => Self::Done,
            _ => Self::Init,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::EnsureRemote => write!(f, "ensure_remote"),
            Self::Fetch => write!(f, "fetch"),
            Self::EnsureDownstream => write!(f, "ensure_downstream"),
            Self::Push => write!(f, "push"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// One durable record of a sync execution. Append-only: once finalized
/// (`outcome` set, `finished_at` set) a row is never mutated again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncAttempt {
    pub id: String,
    pub mirror_id: String,
    pub trigger: Trigger,
    /// `None` while the attempt is in flight.
    pub outcome: Option<Outcome>,
    pub stage_reached: Stage,
    pub error_class: Option<String>,
    pub error_detail: Option<String>,
    pub bytes_transferred: u64,
    pub refs_updated: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

/// A short-lived exclusivity token for one mirror.
///
/// Acquired atomically through the store; an expired lease may be stolen so a
/// crashed worker cannot block future syncs indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub mirror_id: String,
    pub holder_id: String,
    /// Mirror status before acquisition, restored on cancellation.
    pub prev_status: MirrorStatus,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
