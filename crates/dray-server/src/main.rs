mod api;
pub mod api_metrics;
pub mod auth;
pub mod history_store;
pub mod reaper;
pub mod sampler;
pub mod settings_store;
pub mod state;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use dray_core::clock::SystemClock;
use dray_core::config::DrayConfig;
use dray_core::scheduler::Scheduler;

use crate::history_store::HistoryStore;
use crate::settings_store::SettingsStore;
use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "dray-server", about = "Dray capacity-aware job scheduler daemon")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8090")]
    listen: String,

    /// Path to the Dray TOML configuration file
    #[arg(short, long, default_value = "dray.toml")]
    config: String,

    /// Minute health-sample database path
    #[arg(long, default_value = "dray-stats.db")]
    stats_db: String,

    /// Job history + events + settings database path
    #[arg(long, default_value = "dray-history.db")]
    history_db: String,

    /// API bearer token (if set, all routes except /healthz require it)
    #[arg(long, env = "DRAY_API_TOKEN")]
    api_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = DrayConfig::load(Some(Path::new(&args.config))).map_err(anyhow::Error::msg)?;
    info!(
        listen = %args.listen,
        config = %args.config,
        total_units = config.scheduler.total_capacity_units,
        "Dray scheduler starting"
    );

    // History channel: the scheduler and sampler push under their locks,
    // the writer task does all durable I/O.
    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();

    let history = Arc::new(HistoryStore::open(
        Path::new(&args.stats_db),
        Path::new(&args.history_db),
    )?);
    let settings = SettingsStore::open(Path::new(&args.history_db))?;

    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        Arc::new(SystemClock),
        events_tx.clone(),
    );
    let state = AppState::new(config.clone(), scheduler, history.clone(), settings);

    // Background tasks, all stopping cleanly on the shared token.
    let cancel = CancellationToken::new();
    let sampler_task = tokio::spawn(sampler::run(
        state.clone(),
        events_tx.clone(),
        cancel.clone(),
    ));
    let reaper_task = tokio::spawn(reaper::run(state.clone(), cancel.clone()));
    let writer_task = tokio::spawn(history_store::run_writer(
        history.clone(),
        events_rx,
        config.history.clone(),
        cancel.clone(),
    ));

    let app = api::build_router(state, args.api_token.clone());
    if args.api_token.is_some() {
        info!("API authentication enabled (bearer token required)");
    }

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(addr = %args.listen, "Scheduler API listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Server drained; stop background tasks and flush the history backlog.
    cancel.cancel();
    let _ = tokio::join!(sampler_task, reaper_task, writer_task);
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
