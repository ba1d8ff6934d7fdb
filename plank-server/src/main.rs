//! plank-server — runnable board sync server.
//!
//! Configuration comes from the environment:
//! - `PLANK_BIND` — listen address (default `127.0.0.1:9191`)
//! - `PLANK_DATA` — board store directory (default `plank_data`)

use log::info;
use std::path::PathBuf;

use plank_collab::server::{ServerConfig, SyncServer};
use plank_collab::storage::StoreConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let bind_addr =
        std::env::var("PLANK_BIND").unwrap_or_else(|_| "127.0.0.1:9191".to_string());
    let data_dir =
        PathBuf::from(std::env::var("PLANK_DATA").unwrap_or_else(|_| "plank_data".to_string()));

    let config = ServerConfig {
        bind_addr,
        store: StoreConfig {
            path: data_dir.clone(),
            ..StoreConfig::default()
        },
        ..ServerConfig::default()
    };

    let server = SyncServer::new(config)?;
    info!(
        "plank-server starting on {} (data: {})",
        server.bind_addr(),
        data_dir.display()
    );

    server.run().await
}
