use anyhow::Context;
use axum::{http::StatusCode, routing::get, Router};
use iot_alerting::commands::CommandDispatcher;
use iot_alerting::config::{Config, FileConfig, StoreBackend};
use iot_alerting::db::PgStore;
use iot_alerting::memory::MemoryStore;
use iot_alerting::metrics;
use iot_alerting::mqtt::BrokerManager;
use iot_alerting::query::AlertService;
use iot_alerting::rest::{self, AppState};
use iot_alerting::router::{self, MessageRouter};
use iot_alerting::store::Stores;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    info!("Starting IoT alerting service");
    info!("MQTT broker: {}:{}", config.broker.host, config.broker.port);
    info!("Topic prefix: {}", config.broker.topic_prefix);
    info!("HTTP server: {}", config.http_addr);

    // Initialize metrics
    metrics::init_metrics().context("registering metrics")?;

    let file_config = match &config.config_path {
        Some(path) => {
            info!("Loading rules and devices from {}", path.display());
            FileConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => FileConfig::default(),
    };
    let rules = Arc::new(file_config.registry());
    for device_type in rules.device_types() {
        info!(
            "Rules for {}: {}",
            device_type,
            rules.rules_for(device_type).len()
        );
    }

    let stores = match config.store_backend {
        StoreBackend::Postgres => {
            info!(
                "Database: {}",
                config.database_url.split('@').last().unwrap_or("***")
            );
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            Stores::from_shared(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store, nothing survives a restart");
            Stores::from_shared(Arc::new(MemoryStore::new()))
        }
    };

    for seed in file_config.devices {
        let device = seed.into_device();
        info!("Registering device {} on {}", device.id, device.topic);
        stores.devices.upsert(device).await?;
    }

    // Bounded channel between the broker event loop and the router
    info!("Channel capacity: {}", config.broker.channel_capacity);
    let (tx, rx) = mpsc::channel(config.broker.channel_capacity);
    let broker = Arc::new(BrokerManager::new(config.broker.clone(), tx));

    let message_router = Arc::new(MessageRouter::new(
        config.broker.topic_prefix.clone(),
        stores.devices.clone(),
        stores.telemetry.clone(),
        stores.alerts.clone(),
        rules,
    ));
    let router_handle = tokio::spawn(router::run_router(rx, message_router));

    // Keep trying until the first connection is up; later drops are
    // handled by the event loop itself.
    let connect_broker = broker.clone();
    let retry_interval = config.broker.reconnect_interval;
    let connect_handle = tokio::spawn(async move {
        loop {
            match connect_broker.connect().await {
                Ok(_) => break,
                Err(e) => {
                    error!(
                        "MQTT connection failed: {}, retrying in {:?}",
                        e, retry_interval
                    );
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
    });

    let state = AppState {
        alerts: Arc::new(AlertService::new(
            stores.alerts.clone(),
            stores.devices.clone(),
        )),
        telemetry: stores.telemetry.clone(),
        commands: Arc::new(CommandDispatcher::new(
            broker.clone(),
            stores.devices.clone(),
            config.ping_timeout,
        )),
    };

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(state));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("binding {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = router_handle => {
            error!("Router task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    connect_handle.abort();
    broker.disconnect().await?;
    Ok(())
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    metrics::gather_metrics().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}
