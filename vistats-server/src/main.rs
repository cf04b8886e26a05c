//! vistats Server - HTTP API for the analytics storage engine

mod api;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use vistats_core::storage::{StorageConfig, StorageEngine};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Data directory
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            data_dir: PathBuf::from("data"),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `VISTATS_DATA_DIR` and `VISTATS_HTTP_ADDR`
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("VISTATS_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("VISTATS_HTTP_ADDR") {
            config.http_addr = addr
                .parse()
                .map_err(|e| anyhow::anyhow!("bad VISTATS_HTTP_ADDR {:?}: {}", addr, e))?;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .pretty()
        .init();

    let config = ServerConfig::from_env()?;

    info!("Starting vistats server...");
    info!("Data directory: {:?}", config.data_dir);
    info!("HTTP server: http://{}", config.http_addr);

    // Initialize storage engine
    let storage_config = StorageConfig {
        data_dir: config.data_dir.clone(),
        ..Default::default()
    };

    let engine = Arc::new(StorageEngine::new(storage_config)?);

    // Create router
    let app = api::create_router(engine.clone());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("vistats server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    engine.flush_all()?;
    info!("vistats server stopped");

    Ok(())
}
