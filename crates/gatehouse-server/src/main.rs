//! Gatehouse Server
//!
//! TLS line-protocol front door for a MySQL backend:
//! - Admission ceiling and per-address flood protection
//! - Loopback root, password or guest authentication
//! - Stored procedure and direct SQL commands, serialized per kind
//! - Elastic pool of physical database connections
//! - Health and Prometheus metrics (/health, /ready, /metrics)

mod db;
mod http_api;
mod listener;
mod metrics;
mod protocol;
mod session;
mod telemetry;

use crate::db::mysql::MySqlConnector;
use crate::db::{Database, ProcedureRegistry};
use crate::listener::Listener;
use anyhow::Context;
use clap::Parser;
use gatehouse_common::{GatehouseConfig, TlsConfig};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "gatehouse-server")]
#[command(about = "Gatehouse - TLS request server with a pooled database backend")]
struct Args {
    /// TLS listener port (overrides GATEHOUSE_LISTENER__PORT)
    #[arg(long, env = "GATEHOUSE_PORT")]
    port: Option<u16>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Health/metrics port, 0 disables (overrides GATEHOUSE_LISTENER__METRICS_PORT)
    #[arg(long, env = "GATEHOUSE_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Procedure definitions file (overrides GATEHOUSE_DATABASE__PROCEDURES_FILE)
    #[arg(long, env = "GATEHOUSE_PROCEDURES_FILE")]
    procedures: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = GatehouseConfig::load().context("loading configuration")?;
    let config = resolve_config(config, args)?;

    telemetry::init(&config.telemetry.log_level, config.telemetry.json_logs)?;

    info!("Starting Gatehouse");
    info!("  TLS port: {}", config.listener.port);
    info!("  Max connections: {}", config.listener.max_connections);
    info!("  Flood threshold: {}", config.listener.flood_threshold);
    info!(
        "  Database: {}@{}:{}/{}",
        config.database.username, config.database.host, config.database.port, config.database.name
    );
    info!(
        "  Pool: min={} target={} max={}",
        config.database.min_connections,
        config.database.target_connections,
        config.database.max_connections
    );

    metrics::init_metrics();

    let registry = match &config.database.procedures_file {
        Some(path) => Some(Arc::new(ProcedureRegistry::load(Path::new(path))?)),
        None => {
            warn!("No procedure registry configured; any procedure name is callable");
            None
        }
    };

    let tls = TlsConfig::from_settings(&config.tls)?;

    let connector = Arc::new(MySqlConnector::from_settings(&config.database));
    let database = Database::new(&config.database, connector)?;
    database.start();

    let listener = Listener::new(config.listener.clone(), tls, database.clone(), registry);
    listener.start().await?;

    if config.listener.metrics_port != 0 {
        let port = config.listener.metrics_port;
        let database = database.clone();
        tokio::spawn(async move {
            if let Err(e) = http_api::serve(port, database).await {
                error!("HTTP server error: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    listener.stop().await;
    info!("Gatehouse stopped");
    Ok(())
}

/// Apply command line overrides, then validate the merged result
fn resolve_config(mut config: GatehouseConfig, args: Args) -> anyhow::Result<GatehouseConfig> {
    apply_overrides(&mut config, args);
    config.validate().context("validating configuration")?;
    Ok(config)
}

fn apply_overrides(config: &mut GatehouseConfig, args: Args) {
    if let Some(port) = args.port {
        config.listener.port = port;
    }
    if let Some(level) = args.log_level {
        config.telemetry.log_level = level;
    }
    if let Some(port) = args.metrics_port {
        config.listener.metrics_port = port;
    }
    if let Some(path) = args.procedures {
        config.database.procedures_file = Some(path);
    }
}
