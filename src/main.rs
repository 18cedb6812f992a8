use anyhow::{Context, Result};
use mstmeet::api::{create_plugin_router, PluginState};
use mstmeet::channel::MemoryChannels;
use mstmeet::config::{load_config, PluginConfig};
use mstmeet::kv::MemoryKvStore;
use mstmeet::remote::GraphClient;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Standalone harness: serves the plugin routes against in-memory host
/// doubles. In production the Mattermost host mounts the router and
/// provides real KV and channel backends.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mstmeet=info".into()),
        )
        .init();

    info!("mstmeet starting...");

    let mut config = match std::env::var("MSTMEET_CONFIG") {
        Ok(path) => load_config(&path).context("failed to load configuration file")?,
        Err(_) => PluginConfig::from_env(),
    };
    if config.set_defaults() {
        info!("generated a new encryption key");
    }
    config
        .is_valid()
        .context("OAuth2 configuration is incomplete")?;

    let port: u16 = std::env::var("MSTMEET_PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .context("MSTMEET_PORT must be a valid port number")?;

    let state = PluginState::new(
        Arc::new(MemoryKvStore::new()),
        Arc::new(MemoryChannels::new()),
        Arc::new(GraphClient::new()),
        config,
    );
    let router = create_plugin_router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .context("failed to bind API port")?;
    info!(port, "mstmeet listening");

    axum::serve(listener, router)
        .await
        .context("server error")?;

    Ok(())
}
