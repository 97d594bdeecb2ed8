//! GitMirror core library.
//!
//! This crate provides the foundational components for mirroring upstream
//! Git repositories into a self-hosted Gitea server: configuration, the
//! metadata store, the git CLI driver, the Gitea API client, failure
//! classification, the sync engine, and the scheduler with its worker pool.

pub mod classify;
pub mod config;
pub mod engine;
pub mod errors;
pub mod git;
pub mod gitea;
pub mod models;
pub mod scheduler;
pub mod scrub;
pub mod store;

// Re-exports for convenience.
pub use config::AppConfig;
pub use engine::{EngineConfig, SyncEngine};
pub use gitea::{GiteaClient, RepoHost};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, TriggerOutcome};
pub use scrub::Scrubber;
pub use store::Store;
