//! Tessera relay: serves the document and cursor channels.
//!
//! Configuration comes from the environment (`TESSERA_BIND_ADDR`, `PORT`,
//! `TESSERA_STATUS_INTERVAL`, `TESSERA_DEFAULT_DOCUMENT`). Logging follows
//! `RUST_LOG`.

use log::info;
use tessera_collab::server::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting Tessera relay on {} (default document {:?})",
        config.bind_addr, config.default_document
    );

    let server = RelayServer::new(config);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} messages relayed",
                stats.total_connections, stats.total_messages
            );
        }
    }

    Ok(())
}
