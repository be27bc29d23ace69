//! Standalone relay for wiki editing sessions.
//!
//! Usage: `wiki-relay [BIND_ADDR]`, falling back to `WIKI_RELAY_BIND` and
//! then `127.0.0.1:9090`. Log verbosity follows `RUST_LOG`.

use log::info;
use wiki_collab::{RelayConfig, SyncRelay};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Some(addr) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("WIKI_RELAY_BIND").ok())
    {
        config.bind_addr = addr;
    }

    info!("Starting wiki relay on {}", config.bind_addr);
    SyncRelay::new(config).run().await
}
