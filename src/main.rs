#![forbid(unsafe_code)]

//! `agent-pool` — coordinating daemon for a pool of AI coding agents.
//!
//! Bootstraps configuration, takes the single-instance pidfile, restores and
//! rotates the Pool State document, reconciles it against the session
//! backend, then serves IPC and runs the periodic passes until SIGTERM or
//! ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_pool::audit::{AuditEntry, AuditEventType, AuditLogger, JsonlAuditWriter};
use agent_pool::backend::tmux::TmuxBackend;
use agent_pool::config::GlobalConfig;
use agent_pool::ipc::server::spawn_ipc_server;
use agent_pool::models::intervention::Severity;
use agent_pool::models::warning::{Warning, WarningKind};
use agent_pool::orchestrator::{claim_sweeper, orphan_recovery, stuck_detector};
use agent_pool::persistence::pidfile::PidFile;
use agent_pool::persistence::state_store::Loaded;
use agent_pool::pool::counters::Counter;
use agent_pool::pool::AppState;
use agent_pool::{backlog, AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-pool", about = "Agent pool coordinating daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override `state_dir` from the configuration file.
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-pool daemon bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(dir) = args.state_dir {
        config.state_dir = dir;
    }
    config.load_credentials().await?;
    std::fs::create_dir_all(&config.state_dir).map_err(|err| {
        AppError::Config(format!(
            "cannot create state dir {}: {err}",
            config.state_dir.display()
        ))
    })?;
    let config = Arc::new(config);
    info!(state_dir = %config.state_dir.display(), "configuration loaded");

    // ── Single instance ─────────────────────────────────
    let pidfile = PidFile::acquire(&config.pid_path())?;

    // ── Build shared state ──────────────────────────────
    let backend = Arc::new(TmuxBackend::new(&config.backend));
    let backlog = backlog::from_config(&config)?;
    let audit: Arc<dyn AuditLogger> = Arc::new(JsonlAuditWriter::new(config.audit_dir())?);
    let state = Arc::new(AppState::new(
        Arc::clone(&config),
        backend,
        backlog,
        Some(audit),
    )?);

    // ── Restore, rotate, reconcile ──────────────────────
    restore_state(&state).await?;
    state.counters.bump(Counter::DaemonStarts);
    match state.registry.reconcile_with_backend().await {
        Ok(marked) if !marked.is_empty() => {
            info!(errored = marked.len(), "sessions lost while the daemon was down");
        }
        Ok(_) => {}
        Err(err) => warn!(%err, "startup reconciliation skipped"),
    }
    state.persist().await?;

    // ── Start IPC and periodic passes ───────────────────
    let ct = CancellationToken::new();
    let tracker = TaskTracker::new();
    let ipc_handle = spawn_ipc_server(Arc::clone(&state), ct.clone(), tracker.clone())?;
    let mut passes = vec![claim_sweeper::spawn(Arc::clone(&state), ct.clone())];
    if config.detector.enabled {
        passes.push(stuck_detector::spawn(Arc::clone(&state), ct.clone()));
    }
    passes.push(orphan_recovery::spawn(Arc::clone(&state), ct.clone()));

    state.audit(
        AuditEntry::new(AuditEventType::DaemonStart)
            .with_detail(serde_json::json!({ "pid": pidfile.pid() })),
    );
    info!(pid = pidfile.pid(), ipc_name = %config.ipc_name, "agent-pool ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");

    // ── Graceful shutdown ───────────────────────────────
    state.stop_accepting();
    ct.cancel();
    tracker.close();
    let grace = Duration::from_secs(config.shutdown_grace_seconds);
    if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
        warn!(
            in_flight = tracker.len(),
            "in-flight requests did not finish within the grace period"
        );
    }
    if let Err(err) = ipc_handle.await {
        warn!(%err, "ipc server task failed");
    }
    for pass in passes {
        if let Err(err) = pass.await {
            warn!(%err, "background pass task failed");
        }
    }

    if let Err(err) = state.persist().await {
        error!(%err, "final pool state save failed");
    }
    state.audit(AuditEntry::new(AuditEventType::DaemonStop));
    drop(pidfile);
    info!("agent-pool shut down");

    Ok(())
}

/// Load the previous document into `state` and archive it.
async fn restore_state(state: &AppState) -> Result<()> {
    let store = state.store.clone();
    let (loaded, rotated) = tokio::task::spawn_blocking(move || {
        let loaded = store.load()?;
        let previous = match &loaded {
            Loaded::Restored(saved) => Some(saved.as_ref()),
            Loaded::Fresh | Loaded::Corrupt(_) => None,
        };
        let rotated = store.rotate(previous)?;
        Ok::<_, AppError>((loaded, rotated))
    })
    .await
    .map_err(|err| AppError::Io(format!("state load task failed: {err}")))??;

    if let Some(path) = rotated {
        info!(archive = %path.display(), "previous pool state archived");
    }
    match loaded {
        Loaded::Fresh => info!("no previous pool state; starting fresh"),
        Loaded::Restored(saved) => state.restore(*saved).await,
        Loaded::Corrupt(path) => state.warn(
            Warning::new(
                WarningKind::CorruptState,
                Severity::High,
                "pool state unreadable; started fresh",
            )
            .with("moved_to", path.display().to_string()),
        ),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
