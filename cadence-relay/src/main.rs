//! Standalone relay for Cadence rooms.
//!
//! Environment:
//! - `CADENCE_BIND` — listen address (default `127.0.0.1:9090`)
//! - `CADENCE_MAX_PEERS` — participants per room (default 100)
//! - `CADENCE_BROADCAST_CAPACITY` — fan-out buffer per room (default 256)
//! - `RUST_LOG` — log filter, e.g. `info` or `cadence_sync=debug`

use cadence_sync::server::{RelayServer, ServerConfig};
use log::info;
use std::str::FromStr;

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{key}: cannot parse {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn load_config() -> Result<ServerConfig, String> {
    let defaults = ServerConfig::default();
    Ok(ServerConfig {
        bind_addr: env_or("CADENCE_BIND", defaults.bind_addr)?,
        max_peers_per_room: env_or("CADENCE_MAX_PEERS", defaults.max_peers_per_room)?,
        broadcast_capacity: env_or("CADENCE_BROADCAST_CAPACITY", defaults.broadcast_capacity)?,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = load_config()?;
    info!(
        "Starting Cadence relay on {} ({} peers/room, capacity {})",
        config.bind_addr, config.max_peers_per_room, config.broadcast_capacity
    );

    let server = RelayServer::new(config);
    server.run().await?;
    Ok(())
}
