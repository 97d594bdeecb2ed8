//! Error types for the GitMirror core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Gitea(#[from] GiteaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required option was not provided.
    #[error("required configuration option '{0}' is not set")]
    Missing(&'static str),

    /// An option was set to a value that does not parse or is out of range.
    #[error("invalid configuration value for '{option}': {detail}")]
    InvalidValue {
        option: &'static str,
        detail: String,
    },

    /// An environment variable with the recognized prefix is not a known
    /// option. Unknown keys are rejected rather than silently ignored.
    #[error("unknown configuration key '{0}'")]
    UnknownKey(String),

    /// The store DSN names a backend this build does not support.
    #[error("unsupported store DSN '{0}': only sqlite paths/URLs are accepted")]
    UnsupportedDsn(String),
}

// ---------------------------------------------------------------------------
// Git driver errors
// ---------------------------------------------------------------------------

/// Errors from spawning and supervising the `git` binary.
///
/// Non-zero exits are *not* errors at this layer: the driver returns the
/// captured output and leaves interpretation of remote-side failures to the
/// classifier.
#[derive(Debug, Error)]
pub enum GitError {
    /// The `git` binary was not found on `$PATH`.
    #[error("git binary not found: {0}")]
    BinaryNotFound(String),

    /// A URL could not be parsed when building a remote/push URL.
    #[error("invalid git URL '{url}': {detail}")]
    InvalidUrl { url: String, detail: String },

    /// Generic I/O wrapper (spawn failures, pipe errors, dir removal).
    #[error("git I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Gitea API errors
// ---------------------------------------------------------------------------

/// Tagged errors from the downstream Gitea API.
///
/// The set is deliberately small and stable: the classifier maps these onto
/// retry policy and operator-facing messages.
#[derive(Debug, Error)]
pub enum GiteaError {
    /// 401: the token is missing or invalid.
    #[error("gitea rejected the token (HTTP 401)")]
    Unauthorized,

    /// 403: the token lacks the required scope (org-create in particular).
    #[error("gitea denied the operation (HTTP 403): {0}")]
    Forbidden(String),

    /// 404: the repository or organization does not exist.
    #[error("gitea resource not found: {0}")]
    NotFound(String),

    /// 409/422: the repository already exists. Treated as success by
    /// `ensure_downstream` for idempotency.
    #[error("gitea repository already exists: {0}")]
    Conflict(String),

    /// Server-reported 429, or the client-side token bucket is saturated.
    #[error("gitea rate limited (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    /// HTTP-level transport failure (DNS, connect, TLS, reset).
    #[error("gitea transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The API returned an unexpected status code.
    #[error("gitea API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying rusqlite error.
    #[error("store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("store migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Generic I/O error (e.g. database file permissions).
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

/// Infrastructure failures the sync engine cannot encode in an attempt row.
///
/// Sync-level failures (auth, network, timeouts, …) never surface here; they
/// are finalized into the attempt's `outcome` + `error_class`. This type only
/// covers cases where the engine could not even record the attempt.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The mirror id does not exist in the store.
    #[error("mirror not found: {0}")]
    MirrorNotFound(String),

    /// The store failed while recording attempt state.
    #[error(transparent)]
    Store(#[from] StoreError),
}
