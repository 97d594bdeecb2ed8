//! Failure classification.
//!
//! Translates raw git/Gitea failures into a small, stable taxonomy that
//! drives retry policy and the operator-facing `last_error_summary`. The
//! stderr pattern lists mirror what git actually prints for each family of
//! failure; they are matched case-insensitively.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::GiteaError;
use crate::git::GitCmdResult;
use crate::models::Stage;

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

/// Stable failure classes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    UpstreamAuth,
    UpstreamNotFound,
    DownstreamAuth,
    DownstreamForbidden,
    DownstreamConflict,
    NetworkTransient,
    Timeout,
    RateLimited,
    DiskFull,
    LocalIo,
    Corrupt,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpstreamAuth => "upstream_auth",
            Self::UpstreamNotFound => "upstream_not_found",
            Self::DownstreamAuth => "downstream_auth",
            Self::DownstreamForbidden => "downstream_forbidden",
            Self::DownstreamConflict => "downstream_conflict",
            Self::NetworkTransient => "network_transient",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::DiskFull => "disk_full",
            Self::LocalIo => "local_io",
            Self::Corrupt => "corrupt",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str_val(s: &str) -> Self {
        match s {
            "upstream_auth" => Self::UpstreamAuth,
            "upstream_not_found" => Self::UpstreamNotFound,
            "downstream_auth" => Self::DownstreamAuth,
            "downstream_forbidden" => Self::DownstreamForbidden,
            "downstream_conflict" => Self::DownstreamConflict,
            "network_transient" => Self::NetworkTransient,
            "timeout" => Self::Timeout,
            "rate_limited" => Self::RateLimited,
            "disk_full" => Self::DiskFull,
            "local_io" => Self::LocalIo,
            "corrupt" => Self::Corrupt,
            _ => Self::Unknown,
        }
    }

    /// Whether in-job retries make sense at all.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkTransient | Self::Timeout | Self::RateLimited | Self::Unknown
        )
    }

    /// Retry budget for this class given the configured cap.
    ///
    /// Timeouts and unknown failures get a reduced budget: each attempt is
    /// expensive and unlikely to behave differently within the same job.
    pub fn retry_budget(&self, retry_max: u32) -> u32 {
        match self {
            Self::NetworkTransient | Self::RateLimited => retry_max,
            Self::Timeout | Self::Unknown => retry_max.min(1),
            _ => 0,
        }
    }

    /// Operator-facing one-line summary for `last_error_summary`.
    pub fn summary(&self) -> &'static str {
        match self {
            Self::UpstreamAuth => "upstream authentication failed; check the upstream token",
            Self::UpstreamNotFound => "upstream repository not found",
            Self::DownstreamAuth => "gitea rejected the token; check the downstream token",
            Self::DownstreamForbidden => {
                "gitea token lacks permission (org creation needs write:organization)"
            }
            Self::DownstreamConflict => "downstream repository already exists",
            Self::NetworkTransient => "transient network failure",
            Self::Timeout => "operation timed out",
            Self::RateLimited => "rate limited by gitea",
            Self::DiskFull => "local disk full under the clone root",
            Self::LocalIo => "local filesystem error under the clone root",
            Self::Corrupt => "local clone is corrupt; it will be recreated on the next run",
            Self::Unknown => "sync failed for an unrecognized reason",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure: the class plus diagnostic detail and any
/// server-provided retry delay.
#[derive(Debug, Clone)]
pub struct Classified {
    pub class: ErrorClass,
    pub detail: String,
    pub retry_after: Option<Duration>,
}

impl Classified {
    fn new(class: ErrorClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: detail.into(),
            retry_after: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Pattern tables
// ---------------------------------------------------------------------------

/// Stderr fragments indicating a transient network failure.
const TRANSIENT_PATTERNS: &[&str] = &[
    "connection timed out",
    "connection reset",
    "connection refused",
    "could not resolve host",
    "temporary failure",
    "network is unreachable",
    "no address associated",
    "early eof",
    "rpc failed",
    "transferred a partial file",
    "unexpected disconnect",
    "fetch-pack: unable",
    "index-pack failed",
    "curl 18",
    "curl 56",
    "http2 framing layer",
    "remote unpack failed",
    "gnutls",
    "ssl_error",
    "operation timed out",
];

/// Stderr fragments indicating an authentication failure.
const AUTH_PATTERNS: &[&str] = &[
    "authentication failed",
    "could not read username",
    "could not read password",
    "invalid username or password",
    "http 401",
    "401 unauthorized",
    "requested url returned error: 401",
];

/// Stderr fragments indicating a missing remote repository.
const NOT_FOUND_PATTERNS: &[&str] = &[
    "repository not found",
    "requested url returned error: 404",
    "not found",
];

/// Stderr fragments indicating a corrupt local object database.
const CORRUPT_PATTERNS: &[&str] = &[
    "object file",
    "loose object",
    "bad object",
    "corrupt",
    "missing blob",
    "unable to read tree",
    "not a git repository",
];

const DISK_FULL_PATTERNS: &[&str] = &["no space left on device", "disk quota exceeded"];

const LOCAL_IO_PATTERNS: &[&str] = &[
    "unable to create file",
    "read-only file system",
    "input/output error",
    "unable to write",
];

// ---------------------------------------------------------------------------
// Classification entry points
// ---------------------------------------------------------------------------

/// Classify a failed git invocation, using the stage to attribute auth and
/// not-found failures to the correct side (fetch/clone talk upstream, push
/// talks downstream).
pub fn classify_git(stage: Stage, result: &GitCmdResult) -> Classified {
    if result.timed_out {
        return Classified::new(
            ErrorClass::Timeout,
            format!("{stage} timed out after {:.0?}", result.wall_time),
        );
    }

    let stderr = result.stderr.to_ascii_lowercase();
    let detail = format!("{stage} exited {}: {}", result.exit_code, result.stderr.trim());

    if matches_any(&stderr, DISK_FULL_PATTERNS) {
        return Classified::new(ErrorClass::DiskFull, detail);
    }
    if matches_any(&stderr, CORRUPT_PATTERNS) {
        return Classified::new(ErrorClass::Corrupt, detail);
    }
    if matches_any(&stderr, AUTH_PATTERNS) {
        let class = if stage == Stage::Push {
            ErrorClass::DownstreamAuth
        } else {
            ErrorClass::UpstreamAuth
        };
        return Classified::new(class, detail);
    }
    if stderr.contains("403") || stderr.contains("forbidden") {
        let class = if stage == Stage::Push {
            ErrorClass::DownstreamForbidden
        } else {
            ErrorClass::UpstreamAuth
        };
        return Classified::new(class, detail);
    }
    if stage != Stage::Push && matches_any(&stderr, NOT_FOUND_PATTERNS) {
        return Classified::new(ErrorClass::UpstreamNotFound, detail);
    }
    if matches_any(&stderr, LOCAL_IO_PATTERNS) {
        return Classified::new(ErrorClass::LocalIo, detail);
    }
    if matches_any(&stderr, TRANSIENT_PATTERNS) {
        return Classified::new(ErrorClass::NetworkTransient, detail);
    }

    Classified::new(ErrorClass::Unknown, detail)
}

/// Classify a Gitea client error.
///
/// A 404 from repository creation means the organization does not exist;
/// like a missing scope it is an operator configuration problem, so it
/// shares the `DownstreamForbidden` disposition (no retry, clear summary).
pub fn classify_gitea(stage: Stage, error: &GiteaError) -> Classified {
    let detail = format!("{stage}: {error}");
    match error {
        GiteaError::Unauthorized => Classified::new(ErrorClass::DownstreamAuth, detail),
        GiteaError::Forbidden(_) => Classified::new(ErrorClass::DownstreamForbidden, detail),
        GiteaError::NotFound(_) => Classified::new(ErrorClass::DownstreamForbidden, detail),
        GiteaError::Conflict(_) => Classified::new(ErrorClass::DownstreamConflict, detail),
        GiteaError::RateLimited { retry_after_secs } => Classified {
            class: ErrorClass::RateLimited,
            detail,
            retry_after: Some(Duration::from_secs(*retry_after_secs)),
        },
        GiteaError::Transport(_) => Classified::new(ErrorClass::NetworkTransient, detail),
        GiteaError::Api { status, .. } if *status >= 500 => {
            Classified::new(ErrorClass::NetworkTransient, detail)
        }
        GiteaError::Api { .. } => Classified::new(ErrorClass::Unknown, detail),
    }
}

/// Classify a local filesystem error under the clone root.
pub fn classify_io(stage: Stage, error: &std::io::Error) -> Classified {
    let detail = format!("{stage}: {error}");
    // ENOSPC
    if error.raw_os_error() == Some(28) {
        Classified::new(ErrorClass::DiskFull, detail)
    } else {
        Classified::new(ErrorClass::LocalIo, detail)
    }
}

fn matches_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}
