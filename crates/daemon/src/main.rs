//! GitMirror daemon entry point.
//!
//! Loads configuration from the environment, initializes all subsystems,
//! validates the Gitea token on boot, starts the scheduler, and handles
//! graceful shutdown. Fatal startup errors (bad config, unreachable store or
//! Gitea) exit non-zero; the process is expected to be supervised.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gitmirror_core::engine::EngineConfig;
use gitmirror_core::git::GitDriver;
use gitmirror_core::gitea::RepoHost;
use gitmirror_core::{
    AppConfig, GiteaClient, Scheduler, SchedulerConfig, Scrubber, Store, SyncEngine,
};

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// GitMirror synchronization daemon.
#[derive(Parser, Debug)]
#[command(
    name = "gitmirror-daemon",
    version,
    about = "Mirrors upstream Git repositories into a self-hosted Gitea server"
)]
struct Args {
    /// Override the log level from the environment (trace, debug, info,
    /// warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // .env is a development convenience; in production the variables are set
    // directly.
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let config = AppConfig::from_env().context("failed to load configuration")?;

    // Initialize tracing, optionally teeing to a log file.
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _file_guard = match &config.log.file {
        Some(path) => {
            let dir = path.parent().unwrap_or(std::path::Path::new("."));
            let name = path.file_name().unwrap_or(std::ffi::OsStr::new("gitmirror.log"));
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .init();
            None
        }
    };

    // Startup banner
    info!("========================================");
    info!("  GitMirror Daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Upstream base : {}", config.upstream.base);
    info!("Downstream    : {}", config.downstream.url);
    info!("Service user  : {}", config.downstream.user);
    info!("Sync interval : {}s", config.sync.default_interval_secs);
    info!("Sync timeout  : {}s", config.sync.timeout_secs);
    info!("Workers       : {}", config.sync.max_concurrent);
    info!("Clone root    : {}", config.sync.local_clone_root.display());
    info!("Proxy         : {}", config.proxy.url.as_deref().unwrap_or("none"));
    info!("Timezone      : {} (display only)", config.timezone);
    info!("Log level     : {log_level}");
    info!("========================================");

    // Metadata store
    let dsn = config.store_dsn().context("invalid store DSN")?;
    let store = Arc::new(Store::open(&dsn).context("failed to open store")?);
    store
        .initialize()
        .context("failed to initialize store schema")?;
    store.ping().context("store is not reachable")?;
    info!("Store initialized");

    // Gitea client; validate the token before accepting any work.
    let client = GiteaClient::new(
        &config.downstream.url,
        &config.downstream.token,
        &config.downstream.user,
        Some(&config.proxy),
    )
    .context("failed to construct gitea client")?;
    let login = client
        .whoami()
        .await
        .context("gitea boot validation failed; check GITMIRROR_DOWNSTREAM_TOKEN")?;
    match client.server_version().await {
        Ok(version) => info!("Gitea reachable as '{login}' (server {version})"),
        Err(_) => info!("Gitea reachable as '{login}'"),
    }
    let host: Arc<dyn RepoHost> = Arc::new(client);

    // Git driver; the askpass helper lives under the clone root.
    std::fs::create_dir_all(&config.sync.local_clone_root)
        .context("failed to create clone root")?;
    let git = GitDriver::new(
        config.upstream.token.clone(),
        &config.sync.local_clone_root.join(".helpers"),
        config.proxy.effective_url(),
    )
    .context("failed to initialize git driver")?;

    // Engine + scheduler
    let scrubber = Scrubber::new(config.secrets());
    let engine = Arc::new(SyncEngine::new(
        store,
        git,
        host,
        scrubber,
        EngineConfig::from_app_config(&config),
    ));
    let (scheduler, handle) = Scheduler::new(engine, SchedulerConfig::from_app_config(&config));

    let scheduler_task = tokio::spawn(scheduler.run());
    info!("Scheduler started");

    // Wait for a termination signal, then drain in-flight syncs.
    let signal = shutdown_signal().await;
    info!("Received {signal}, draining in-flight syncs...");

    handle.shutdown();
    let _ = scheduler_task.await;

    info!("GitMirror daemon stopped.");
    Ok(())
}

/// Block until the process is asked to stop, returning the signal name for
/// the shutdown log line. Listens for SIGTERM (supervisor-driven restarts)
/// on Unix and Ctrl+C everywhere.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
