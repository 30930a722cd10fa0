//! Endpoint Manager: owns the fleet of upstream Endpoint Connections.

pub mod connection;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::bus::EventBus;
use crate::error::AggregatorError;
use crate::service::ServiceManager;

use self::connection::EndpointConnection;

#[derive(Debug, Clone, serde::Serialize)]
pub struct EndpointStatus {
    pub url: String,
    pub connected: bool,
    pub initialized: bool,
    pub reconnect_attempt: u32,
}

pub struct EndpointManager {
    connections: tokio::sync::RwLock<HashMap<String, Arc<EndpointConnection>>>,
    service_manager: tokio::sync::RwLock<Option<Arc<ServiceManager>>>,
    bus: EventBus,
}

impl EndpointManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            connections: tokio::sync::RwLock::new(HashMap::new()),
            service_manager: tokio::sync::RwLock::new(None),
            bus,
        }
    }

    /// Installs the read-only capability Endpoint Connections use to answer
    /// `tools/list` / `tools/call`. Must be called before [`Self::connect`].
    pub async fn set_service_manager(&self, service_manager: Arc<ServiceManager>) {
        *self.service_manager.write().await = Some(service_manager);
    }

    pub async fn add_endpoint(&self, url: impl Into<String>) -> Result<(), AggregatorError> {
        let url = url.into();
        let mut connections = self.connections.write().await;
        if connections.contains_key(&url) {
            return Err(AggregatorError::endpoint_exists(url));
        }
        let service_manager = self
            .service_manager
            .read()
            .await
            .clone()
            .ok_or_else(|| AggregatorError::config_invalid("service manager not installed"))?;
        connections.insert(url.clone(), Arc::new(EndpointConnection::new(url, service_manager, self.bus.clone())));
        Ok(())
    }

    pub async fn remove_endpoint(&self, url: &str) {
        if let Some(connection) = self.connections.write().await.remove(url) {
            connection.stop().await;
        }
    }

    /// Starts every added endpoint concurrently.
    pub async fn connect(&self) {
        let connections: Vec<_> = self.connections.read().await.values().cloned().collect();
        for connection in connections {
            connection.start().await;
        }
    }

    /// Disconnects and re-establishes every currently connected endpoint.
    /// Returns immediately after initiating the disconnects; it does not
    /// wait for reinitialization.
    pub async fn reconnect(&self) {
        let connections: Vec<_> = self
            .connections
            .read()
            .await
            .values()
            .filter(|connection| connection.connected())
            .cloned()
            .collect();

        if connections.is_empty() {
            debug!("reconnect() called with no connected endpoints; nothing to do");
            return;
        }

        for connection in connections {
            tokio::spawn(async move { connection.force_reconnect().await });
        }
    }

    pub async fn get_connection_status(&self) -> Vec<EndpointStatus> {
        self.connections
            .read()
            .await
            .values()
            .map(|connection| EndpointStatus {
                url: connection.url().to_string(),
                connected: connection.connected(),
                initialized: connection.initialized(),
                reconnect_attempt: connection.reconnect_attempt(),
            })
            .collect()
    }

    pub async fn cleanup(&self) {
        let connections: Vec<_> = self.connections.write().await.drain().map(|(_, connection)| connection).collect();
        for connection in connections {
            connection.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InMemoryConfigStore;

    fn service_manager() -> Arc<ServiceManager> {
        let store = Arc::new(InMemoryConfigStore::new(vec![], HashMap::new()));
        Arc::new(ServiceManager::new(store, EventBus::new()))
    }

    #[tokio::test]
    async fn add_endpoint_requires_service_manager_first() {
        let manager = EndpointManager::new(EventBus::new());
        let err = manager.add_endpoint("wss://example.invalid").await.unwrap_err();
        assert!(matches!(err, AggregatorError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn duplicate_endpoint_is_rejected() {
        let manager = EndpointManager::new(EventBus::new());
        manager.set_service_manager(service_manager()).await;
        manager.add_endpoint("wss://example.invalid").await.unwrap();
        let err = manager.add_endpoint("wss://example.invalid").await.unwrap_err();
        assert!(matches!(err, AggregatorError::EndpointExists { .. }));
    }

    #[tokio::test]
    async fn add_then_remove_leaves_manager_empty() {
        let manager = EndpointManager::new(EventBus::new());
        manager.set_service_manager(service_manager()).await;
        manager.add_endpoint("wss://example.invalid").await.unwrap();
        manager.remove_endpoint("wss://example.invalid").await;
        assert!(manager.get_connection_status().await.is_empty());
    }

    #[tokio::test]
    async fn reconnect_with_nothing_connected_is_a_no_op() {
        let manager = EndpointManager::new(EventBus::new());
        manager.set_service_manager(service_manager()).await;
        manager.add_endpoint("wss://example.invalid").await.unwrap();
        manager.reconnect().await;
    }
}
