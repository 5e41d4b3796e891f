//! Earshot Friend Tracker daemon
//!
//! Startup order: resolve the data folder, open the database, load
//! parameters, rebuild aggregates from the event store, construct the
//! snapshot source, then run the ingestion pipeline and HTTP server side
//! by side. The server outlives the pipeline: expired credentials stop
//! ingestion but never the query API.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use earshot_common::config::resolve_data_folder;
use earshot_common::db::init_database;
use earshot_ft::aggregate::Aggregator;
use earshot_ft::api::{create_router, AppState};
use earshot_ft::ingest::IngestPipeline;
use earshot_ft::source::SpotifyPresenceClient;
use earshot_ft::state::SharedState;
use earshot_ft::store::EventStore;
use earshot_ft::TrackerParams;

#[derive(Parser, Debug)]
#[command(name = "earshot-ft")]
#[command(about = "Earshot Friend Tracker - ingests Spotify friend activity")]
#[command(version)]
struct Args {
    /// HTTP port to listen on
    #[arg(short, long, default_value = "5770", env = "EARSHOT_FT_PORT")]
    port: u16,

    /// Data folder path (overrides config file and defaults)
    #[arg(short, long)]
    data_folder: Option<PathBuf>,

    /// Config file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Spotify web-player bearer token (skips the cookie exchange)
    #[arg(long, env = "EARSHOT_BEARER_TOKEN", hide_env_values = true)]
    bearer_token: Option<String>,

    /// Spotify sp_dc cookie, exchanged for a bearer token at startup
    #[arg(long, env = "EARSHOT_SP_DC", hide_env_values = true)]
    sp_dc: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "earshot_ft=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!(
        "Earshot Friend Tracker starting (version {}, build {} {} {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE"),
    );

    let data_folder = resolve_data_folder(
        args.data_folder.as_ref().and_then(|p| p.to_str()),
        "EARSHOT_DATA_FOLDER",
        args.config.as_deref(),
    )
    .context("Failed to resolve data folder")?;
    info!("Using data folder: {}", data_folder.display());

    let db_path = data_folder.join("earshot.db");
    let pool = init_database(&db_path)
        .await
        .context("Failed to initialize database")?;

    let params = TrackerParams::from_database(&pool).await;
    info!(
        "Tracker parameters: poll every {}s, idle threshold {}s, top-{} rankings",
        params.poll_interval_secs, params.idle_threshold_secs, params.top_n_size
    );

    let store = EventStore::new(pool);

    // Aggregates live in memory only; replay the store before serving
    let mut aggregator = Aggregator::new(&params);
    aggregator
        .rebuild(&store)
        .await
        .context("Failed to rebuild aggregates from event store")?;

    let shared = Arc::new(SharedState::new(aggregator));

    let source = if let Some(bearer_token) = args.bearer_token {
        info!("Using provided bearer token");
        SpotifyPresenceClient::new(bearer_token, params.active_threshold())
            .context("Failed to build Spotify client")?
    } else if let Some(sp_dc) = args.sp_dc {
        info!("Exchanging sp_dc cookie for an access token");
        SpotifyPresenceClient::from_sp_dc(&sp_dc, params.active_threshold())
            .await
            .context("Failed to exchange sp_dc cookie for an access token")?
    } else {
        bail!(
            "No Spotify credentials: pass --bearer-token / --sp-dc or set \
             EARSHOT_BEARER_TOKEN / EARSHOT_SP_DC"
        );
    };

    let pipeline = IngestPipeline::new(source, store.clone(), params.clone(), shared.clone())
        .await
        .context("Failed to build ingestion pipeline")?;
    let ingest_handle = tokio::spawn(pipeline.run());

    let app = create_router(AppState {
        store,
        state: shared,
        params,
    });

    let addr = format!("0.0.0.0:{}", args.port);
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context(format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if !ingest_handle.is_finished() {
        ingest_handle.abort();
    } else {
        warn!("Ingestion pipeline had already stopped before shutdown");
    }
    info!("Earshot Friend Tracker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
