use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use camera_feed_hub::detection::engine_from_config;
use camera_feed_hub::mqtt::MqttBridge;
use camera_feed_hub::reaper::HealthReaper;
use camera_feed_hub::{build_router, Config, Hub};

#[derive(Parser, Debug)]
#[command(name = "feed-hub")]
#[command(about = "Central ingest and analysis coordinator for remote camera producers")]
struct Args {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override server.host
    #[arg(long)]
    host: Option<String>,

    /// Override server.port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("camera_feed_hub=debug,info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let mut config = if Path::new(&args.config).exists() {
        Config::load(&args.config)?
    } else {
        warn!("Could not find {}, using default configuration", args.config);
        Config::default()
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let engine = engine_from_config(config.detection.as_ref())?;
    let hub = Arc::new(Hub::new(config.clone(), engine));

    let reaper_task = HealthReaper::new(hub.clone()).spawn();
    let stats_task = hub.spawn_stats_publisher();

    let mqtt_task = match config.mqtt.clone() {
        Some(mqtt_config) if mqtt_config.enabled => {
            let bridge = MqttBridge::new(mqtt_config)?;
            Some(bridge.start(hub.events.subscribe()))
        }
        _ => {
            info!("MQTT bridge disabled");
            None
        }
    };

    let app = build_router(hub.clone());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Camera feed hub listening on http://{}", addr);
    info!("Producers connect to ws://{}/ws/producer", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    reaper_task.abort();
    stats_task.abort();
    hub.shutdown().await;
    if let Some(task) = mqtt_task {
        task.abort();
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
