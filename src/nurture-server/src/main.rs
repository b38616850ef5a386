//! Nurture server: funnel-abandonment email sequences.
//!
//! Starts the HTTP surface (enrollment, webhooks, unsubscribe), the metrics
//! exporter, and the periodic sweep and archive loops.

use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use nurture_api::ApiServer;
use nurture_core::config::AppConfig;
use nurture_journey::NurtureEngine;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "nurture-server")]
#[command(about = "Funnel-abandonment nurture engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "NURTURE__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "NURTURE__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Multiplier applied to every stage delay (overrides config)
    #[arg(long, env = "NURTURE__SCHEDULER__DELAY_SCALE")]
    delay_scale: Option<f64>,

    /// Serve HTTP only; no sweep or archive loops
    #[arg(long, default_value_t = false)]
    api_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nurture=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Nurture server starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(scale) = cli.delay_scale {
        config.scheduler.delay_scale = scale;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        sweep_interval_secs = config.scheduler.sweep_interval_secs,
        tolerance_secs = config.scheduler.tolerance_secs,
        "Configuration loaded"
    );

    let engine = NurtureEngine::from_config(&config)?;

    if cli.api_only || !config.scheduler.enabled {
        info!("Running in API-only mode (no sweeps)");
    } else {
        let scheduler = engine.scheduler.clone();
        let every = Duration::from_secs(config.scheduler.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                scheduler.run_once(Utc::now()).await;
            }
        });

        let archiver = engine.scheduler.clone();
        let every = Duration::from_secs(config.scheduler.archive_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                archiver.archive_stale(Utc::now());
            }
        });
        info!("Sweep and archive loops started");
    }

    let api_server = ApiServer::new(config.clone(), engine);

    // Start metrics exporter
    if config.metrics.enabled {
        if let Err(e) = api_server.start_metrics().await {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    info!("Nurture server is ready to serve traffic");

    // Start HTTP server (blocks until shutdown)
    api_server.start_http().await?;

    Ok(())
}
