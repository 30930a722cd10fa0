//! Runtime wiring: constructs the three subsystems, installs logging, and
//! drives startup/shutdown for a standalone process.
//!
//! This is ambient glue, not one of the core subsystems. An embedder that
//! already owns its own `main` can skip this module and construct
//! [`ServiceManager`] / [`EndpointManager`] / [`EventBus`] directly.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::bus::EventBus;
use crate::config::ConfigStore;
use crate::coordinator;
use crate::endpoint::EndpointManager;
use crate::service::ServiceManager;

/// Installs a `tracing-subscriber` registry honoring `RUST_LOG`, defaulting
/// to `info` when unset.
pub fn install_logging() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();
}

/// The running aggregator: both managers plus the bus they share.
pub struct Aggregator {
    pub service_manager: Arc<ServiceManager>,
    pub endpoint_manager: Arc<EndpointManager>,
    pub bus: EventBus,
    coordinator_task: tokio::task::JoinHandle<()>,
}

impl Aggregator {
    /// Builds and starts the aggregator: loads provider/endpoint config
    /// from the store, starts all providers, connects all endpoints, and
    /// installs the catalog-change coordinator.
    pub async fn start(config_store: Arc<dyn ConfigStore>) -> anyhow::Result<Self> {
        let bus = EventBus::new();
        let service_manager = Arc::new(ServiceManager::new(Arc::clone(&config_store), bus.clone()));
        let endpoint_manager = Arc::new(EndpointManager::new(bus.clone()));
        endpoint_manager.set_service_manager(Arc::clone(&service_manager)).await;

        let servers = config_store.get_mcp_servers().await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to read provider configuration; starting with no providers");
            Default::default()
        });
        for (name, config) in servers {
            if let Err(err) = service_manager.add_provider_config(name.clone(), config).await {
                tracing::warn!(provider = %name, error = %err, "skipping invalid provider configuration");
            }
        }
        service_manager.start().await;

        let endpoints = config_store.get_mcp_endpoints().await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to read endpoint configuration; starting with no endpoints");
            Default::default()
        });
        for url in endpoints {
            if let Err(err) = endpoint_manager.add_endpoint(url.clone()).await {
                tracing::warn!(url, error = %err, "failed to register configured endpoint");
            }
        }
        endpoint_manager.connect().await;

        let coordinator_task = coordinator::spawn(bus.clone(), Arc::clone(&endpoint_manager));

        Ok(Self {
            service_manager,
            endpoint_manager,
            bus,
            coordinator_task,
        })
    }

    /// Tears down both managers and the coordinator, in that order.
    pub async fn shutdown(self) {
        self.coordinator_task.abort();
        self.endpoint_manager.cleanup().await;
        self.service_manager.stop_all().await;
        self.bus.destroy();
        info!("aggregator shut down");
    }
}
