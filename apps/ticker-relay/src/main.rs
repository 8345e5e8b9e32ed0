//! Ticker Relay Binary
//!
//! Starts the live trade price relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin ticker-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `FINNHUB_API_KEY`: Finnhub API key (without it the upstream retries on
//!   the fallback interval until the key appears)
//!
//! ## Optional
//! - `FINNHUB_WS_URL`: Upstream endpoint (default: wss://ws.finnhub.io)
//! - `RELAY_HOST`: Bind host (default: 0.0.0.0)
//! - `RELAY_PORT`: Client WebSocket port (default: 8080)
//! - `RELAY_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `RELAY_MARKET_SESSION`: regular | extended (default: regular)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: ticker-relay)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use ticker_relay::application::services::ReconnectConfig;
use ticker_relay::infrastructure::health::{HealthServer, HealthServerState};
use ticker_relay::infrastructure::telemetry;
use ticker_relay::{
    ClientServer, FinnhubConnector, MarketHoursGate, RelayConfig, RelayOptions, RelayService,
    RelayStatus, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
#[allow(clippy::expect_used)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv_from_ancestors();

    let telemetry_guard = telemetry::init();

    tracing::info!(
        otel_export = telemetry_guard.exporting(),
        "Starting Ticker Relay"
    );

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed; /metrics disabled");
    }

    let config = RelayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let status = Arc::new(RelayStatus::new());

    // Relay task: owns the hub and the upstream connection
    let options = RelayOptions {
        reconnect: ReconnectConfig::from_settings(&config.reconnect),
        market_session: config.relay.market_session,
        event_capacity: config.relay.event_capacity,
    };
    let connector = Arc::new(FinnhubConnector::new(config.feed.clone()));
    let (relay, relay_handle) = RelayService::new(
        options,
        connector,
        Arc::clone(&status),
        shutdown_token.clone(),
    );
    let relay_task = tokio::spawn(relay.run());

    // Client WebSocket server
    let client_server = ClientServer::bind(
        &config.server.client_addr(),
        relay_handle,
        config.relay.client_queue_capacity,
        shutdown_token.clone(),
    )
    .await?;
    tokio::spawn(async move {
        if let Err(e) = client_server.run().await {
            tracing::error!(error = %e, "Client server error");
        }
    });

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&status),
        MarketHoursGate::new(config.relay.market_session),
    ));
    let health_server = HealthServer::new(
        config.server.health_addr(),
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Ticker relay ready");

    await_shutdown(shutdown_token).await;

    tracing::info!(
        timeout_secs = config.relay.shutdown_timeout.as_secs(),
        "Graceful shutdown started"
    );

    match tokio::time::timeout(config.relay.shutdown_timeout, relay_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Relay task failed"),
        Err(_) => tracing::warn!("Shutdown timed out; exiting without upstream close"),
    }

    tracing::info!("Ticker relay stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        feed_url = %config.feed.url,
        api_key_set = config.feed.credentials.is_some(),
        client_addr = %config.server.client_addr(),
        health_addr = %config.server.health_addr(),
        market_session = config.relay.market_session.as_str(),
        "Configuration loaded"
    );
    tracing::debug!(
        initial_delay_ms = config.reconnect.delay_initial.as_millis(),
        max_delay_secs = config.reconnect.delay_max.as_secs(),
        max_attempts = config.reconnect.max_attempts,
        fallback_secs = config.reconnect.fallback_interval.as_secs(),
        "Reconnect policy"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
