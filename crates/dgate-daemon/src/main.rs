//! dgate-daemon - Dispatch Consistency Gate Daemon
//!
//! Serves the gate middleware in front of the downstream handlers, plus the
//! operator routes for inspecting and releasing safety state.
//!
//! The bundled downstream is an acknowledgement handler that echoes the
//! dispatch context; embedders mount their own handlers through
//! [`dgate_daemon::http::router`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json, Router};
use clap::Parser;
use dgate_core::config::DgateConfig;
use dgate_core::safety::{SafetyRuntimeStore, SafetyStoreConfig};
use dgate_core::{AuditEmitter, Clock, SystemClock, TracingAuditEmitter, VersionClock};
use dgate_daemon::dispatch::{
    CycleSupervisor, DispatchContext, DispatchGate, DispatchGateConfig, InMemorySnapshotProvider,
    RuleBasedPolicyEvaluator,
};
use dgate_daemon::http;
use dgate_daemon::state::{DaemonStateHandle, SharedState};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Floor for the stalled-cycle sweep period.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// dgate daemon command-line arguments
#[derive(Parser, Debug)]
#[command(name = "dgate-daemon")]
#[command(about = "Dispatch consistency gate daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "dgate.toml")]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Compute decisions without enforcing them
    #[arg(long)]
    shadow: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log file path (logs to stdout if not specified)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Runtime::new().context("failed to create tokio runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    init_logging(&args)?;

    info!("Starting dgate daemon");

    let mut config = load_config(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if args.shadow {
        config.gate.shadow_mode = true;
    }
    if config.gate.shadow_mode {
        warn!("shadow mode enabled: gate decisions are logged, not enforced");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let audit: Arc<dyn AuditEmitter> = Arc::new(TracingAuditEmitter);

    let safety = Arc::new(
        SafetyRuntimeStore::open(
            config.safety.state_file.clone(),
            SafetyStoreConfig::from(&config.safety),
            Arc::clone(&clock),
            Arc::clone(&audit),
        )
        .with_context(|| {
            format!(
                "failed to open safety state at {}",
                config.safety.state_file.display()
            )
        })?,
    );
    info!(
        state_file = %config.safety.state_file.display(),
        active_conditions = safety.active_unsafe_conditions(None).len(),
        active_quarantines = safety.active_quarantines(None).len(),
        "safety runtime state loaded"
    );

    let versions = Arc::new(VersionClock::new(Arc::clone(&clock)));
    let snapshots = Arc::new(InMemorySnapshotProvider::new(versions));
    let policy = Arc::new(RuleBasedPolicyEvaluator::from(&config.policy));
    let supervisor = Arc::new(CycleSupervisor::new(
        Arc::clone(&safety),
        config.supervisor.clone(),
        Arc::clone(&clock),
        Arc::clone(&audit),
    ));

    let gate = DispatchGate::new(
        DispatchGateConfig::from(&config),
        config.bindings.clone(),
        snapshots,
        policy,
        Arc::clone(&supervisor) as _,
        Arc::clone(&safety),
    )
    .with_audit(audit)
    .with_clock(clock);
    info!(bindings = config.bindings.len(), "dispatch gate ready");

    let state: SharedState = Arc::new(DaemonStateHandle::new(gate, config.gate.max_body_bytes));

    spawn_sweeper(
        Arc::clone(&supervisor),
        Arc::clone(&state),
        config.supervisor.sweep_interval,
    );

    let app = http::router(Arc::clone(&state), downstream());

    let listener = TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;
    info!("Listening on {}", config.server.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
        .await
        .context("server error")?;

    safety.flush().await;
    info!("dgate daemon stopped");
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| format!("failed to open log file {}", log_file.display()))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn load_config(path: &std::path::Path) -> Result<DgateConfig> {
    if path.exists() {
        let config = DgateConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?;
        info!(config = %path.display(), "configuration loaded");
        Ok(config)
    } else {
        info!(
            config = %path.display(),
            "config file not found, using defaults"
        );
        Ok(DgateConfig::default())
    }
}

/// Periodically counts heartbeat misses for stalled evaluation cycles.
fn spawn_sweeper(supervisor: Arc<CycleSupervisor>, state: SharedState, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(MIN_SWEEP_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !state.is_shutdown_requested() {
            ticker.tick().await;
            let stalled = supervisor.sweep_stalled();
            if stalled > 0 {
                warn!(stalled, in_flight = supervisor.in_flight(), "stalled cycles swept");
            }
        }
    });
}

/// Default downstream: acknowledges every gated request.
fn downstream() -> Router {
    Router::new().fallback(accept)
}

async fn accept(Extension(ctx): Extension<DispatchContext>, req: Request) -> impl IntoResponse {
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "accepted": true,
            "method": req.method().as_str(),
            "path": req.uri().path(),
            "dispatch": ctx,
        })),
    )
}

async fn shutdown_signal(state: SharedState) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install SIGINT handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
    state.request_shutdown();
}
