//! Tessera server: hosts the shared tile map over WebSocket.
//!
//! Configuration comes from the environment (see [`config`]); log level
//! from `RUST_LOG`, defaulting to `info`. Ctrl-C stops accepting
//! connections and saves the grid before exiting.

mod config;

use log::info;
use tessera_collab::TileServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config = config::from_env()?;
    info!("Starting Tessera server on {}...", config.bind_addr);
    match &config.storage_path {
        Some(path) => info!("Grid stored at {}", path.display()),
        None => info!("TESSERA_DATA_DIR unset, grid will not survive a restart"),
    }

    let server = TileServer::new(config)?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
}
