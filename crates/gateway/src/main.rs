//! Event gateway entry point.

use anyhow::Result;
use event_gateway::{
    create_router, AppState, Gateway, GatewayConfig, JetStreamLog, LogBackend, LogBridge,
    LogConsumer, LogProducer, MemoryLog,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting event gateway");

    let config = GatewayConfig::from_env()?;

    info!("Configuration:");
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  CLIENT_MAX_CONNECTIONS: {}", config.max_connections);
    info!("  CLIENT_INACTIVITY_TIMEOUT: {:?}", config.inactivity_timeout);
    info!("  LOG_BACKEND: {:?}", config.log.backend);
    info!("  DURABLE_TOPIC: {}", config.log.durable_topic);
    info!("  INBOUND_TOPICS: {:?}", config.log.inbound_topics);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let (producer, consumer) = match config.log.backend {
        LogBackend::Nats => {
            let log = Arc::new(JetStreamLog::connect(&config.log).await?);
            info!("Connected to JetStream at {}", config.log.nats_url);
            (
                log.clone() as Arc<dyn LogProducer>,
                log as Arc<dyn LogConsumer>,
            )
        }
        LogBackend::Memory => {
            let log = Arc::new(MemoryLog::new());
            info!("Using in-memory log");
            (
                log.clone() as Arc<dyn LogProducer>,
                log as Arc<dyn LogConsumer>,
            )
        }
    };
    let bridge = Arc::new(LogBridge::new(producer, consumer));

    let http_port = config.http_port;
    let gateway = Gateway::new(config, bridge);
    gateway.start().await?;

    let state = Arc::new(AppState {
        gateway: gateway.clone(),
    });
    let app = create_router(state);

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    gateway.shutdown().await;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
