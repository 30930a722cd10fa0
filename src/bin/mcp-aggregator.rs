//! Standalone entry point: wires an in-memory `ConfigStore` and runs the
//! aggregator until interrupted. A real deployment supplies its own
//! `ConfigStore` and calls `mcp_aggregator::runtime::Aggregator::start`
//! from its own process instead of using this binary.

use std::collections::HashMap;
use std::sync::Arc;

use mcp_aggregator::runtime::{install_logging, Aggregator};
use mcp_aggregator::InMemoryConfigStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_logging();

    let endpoints = std::env::var("MCP_AGGREGATOR_ENDPOINTS")
        .ok()
        .map(|value| value.split(',').map(str::to_string).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let config_store = Arc::new(InMemoryConfigStore::new(endpoints, HashMap::new()));
    let aggregator = Aggregator::start(config_store).await?;

    tracing::info!("mcp-aggregator running; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    aggregator.shutdown().await;
    Ok(())
}
