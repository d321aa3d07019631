use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Json;
use clap::Parser;
use bosun_fleet::broker::memory::MemoryBroker;
use bosun_fleet::config::{Config, StoreConfig};
use bosun_fleet::fleet::{FleetManager, FleetStatistics};
use bosun_fleet::store::memory::MemoryStore;
use bosun_fleet::store::sqlite::SqliteStore;
use bosun_fleet::store::DeviceStore;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
#[command(name = "bosun-fleet")]
#[command(about = "Bosun virtual device fleet")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "bosun-fleet.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tracing=info,bosun_fleet=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    let store: Option<Arc<dyn DeviceStore>> = match config.store {
        StoreConfig::None => {
            info!("Running without a device store");
            None
        }
        StoreConfig::Memory => {
            info!("Using in-memory device store");
            Some(Arc::new(MemoryStore::new()))
        }
        StoreConfig::Sqlite { path } => {
            info!(path = ?path, "Using SQLite device store");
            Some(Arc::new(SqliteStore::new(&path).await?))
        }
    };

    let broker = Arc::new(MemoryBroker::new());
    let fleet = FleetManager::new(
        broker,
        store,
        &config.fleet.namespace,
        config.timing,
    );

    if let Some(topology) = config.topology {
        let devices = fleet.deploy(topology).await?;
        info!(topology = ?topology, devices = devices.len(), "Fleet deployed");
    }

    let app = axum::Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .with_state(fleet.clone());

    let listener = TcpListener::bind(config.server.http_addr).await?;
    info!(http_addr = %config.server.http_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down fleet");
    fleet.stop_all_failures().await;
    fleet.remove_all().await?;

    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn stats(State(fleet): State<FleetManager>) -> Json<FleetStatistics> {
    Json(fleet.statistics().await)
}

async fn shutdown_signal() {
    // Run until interrupted.
    let _ = tokio::signal::ctrl_c().await;
}
