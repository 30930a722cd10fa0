//! Service Manager: owns the downstream provider fleet.

pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::bus::{Event, EventBus};
use crate::config::{ConfigStore, NamespacedTool, ProviderConfig, ToolDescriptor, ToolOverride};
use crate::error::AggregatorError;
use crate::provider::sse::SseProviderClient;
use crate::provider::stdio::StdioProviderClient;
use crate::provider::streamable_http::StreamableHttpProviderClient;
use crate::provider::ProviderClient;

use self::retry::{RetryPolicy, RetryState};

/// Point-in-time view of one provider, returned by [`ServiceManager::get_status`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub transport: &'static str,
    pub connected: bool,
    pub tool_count: usize,
    pub last_error: Option<String>,
    pub retry_attempt: u32,
}

/// Aggregate snapshot returned by `getStatus()`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStatus {
    pub providers: Vec<ProviderStatus>,
    pub tool_count: usize,
}

struct ProviderEntry {
    config: ProviderConfig,
    client: Option<Arc<dyn ProviderClient>>,
    last_error: Option<String>,
}

/// Owns the set of Provider Clients: starts, stops, retries, and aggregates
/// their tool catalogs into the namespaced view upstream endpoints see.
pub struct ServiceManager {
    entries: RwLock<HashMap<String, ProviderEntry>>,
    retries: tokio::sync::Mutex<HashMap<String, RetryState>>,
    retry_policy: RetryPolicy,
    config_store: Arc<dyn ConfigStore>,
    bus: EventBus,
}

impl ServiceManager {
    pub fn new(config_store: Arc<dyn ConfigStore>, bus: EventBus) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retries: tokio::sync::Mutex::new(HashMap::new()),
            retry_policy: RetryPolicy::default(),
            config_store,
            bus,
        }
    }

    /// Registers a provider's configuration without starting it.
    ///
    /// Rejects names containing `"__"`: the namespacing scheme in §3 splits
    /// an exposed name on the first `"__"`, so a provider name carrying the
    /// separator would make that split ambiguous.
    pub async fn add_provider_config(&self, name: impl Into<String>, config: ProviderConfig) -> Result<(), AggregatorError> {
        let name = name.into();
        if name.contains("__") {
            return Err(AggregatorError::config_invalid(format!(
                "provider name '{name}' must not contain '__'"
            )));
        }
        self.entries.write().await.insert(
            name,
            ProviderEntry {
                config,
                client: None,
                last_error: None,
            },
        );
        Ok(())
    }

    pub async fn remove_provider_config(&self, name: &str) {
        self.stop_provider(name).await;
        self.entries.write().await.remove(name);
    }

    /// Starts every configured provider concurrently. Idempotent: providers
    /// already running are restarted.
    pub async fn start(self: &Arc<Self>) {
        let names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        let mut successes = 0usize;
        let mut failures = 0usize;
        let mut started = Vec::with_capacity(names.len());

        let handles: Vec<_> = names
            .iter()
            .map(|name| {
                let manager = Arc::clone(self);
                let name = name.clone();
                tokio::spawn(async move { (name.clone(), manager.start_provider(&name).await) })
            })
            .collect();

        for handle in handles {
            match handle.await {
                Ok((name, Ok(()))) => {
                    successes += 1;
                    started.push(name);
                }
                Ok((name, Err(err))) => {
                    warn!(provider = %name, error = %err, "provider start failed");
                    failures += 1;
                }
                Err(err) => {
                    error!(error = %err, "provider start task panicked");
                    failures += 1;
                }
            }
        }

        info!(successes, failures, "service manager start() completed");
        self.bus.publish(Event::ServerBatchAdded {
            added_count: successes,
            failed_count: failures,
            names: started,
        });
    }

    /// Restarts (stopping any existing instance first) and starts one provider.
    pub async fn start_provider(self: &Arc<Self>, name: &str) -> Result<(), AggregatorError> {
        self.stop_client_only(name).await;

        let config = {
            let entries = self.entries.read().await;
            entries.get(name).map(|entry| entry.config.clone())
        };
        let Some(config) = config else {
            return Err(AggregatorError::config_invalid(format!("unknown provider '{name}'")));
        };

        let client = build_client(name, &config)?;
        match client.start().await {
            Ok(()) => {
                let tools = client.list_tools();
                self.sync_tool_config(name, &tools).await;

                {
                    let mut entries = self.entries.write().await;
                    if let Some(entry) = entries.get_mut(name) {
                        entry.client = Some(client);
                        entry.last_error = None;
                    }
                }
                if let Some(state) = self.retries.lock().await.get_mut(name) {
                    state.clear_on_success();
                }

                let namespaced = self.namespaced_for_provider(name, &tools).await;
                self.bus.publish(Event::ServerAdded {
                    name: name.to_string(),
                    tools: Arc::new(namespaced),
                });
                debug!(provider = %name, "provider started");
                Ok(())
            }
            Err(err) => {
                {
                    let mut entries = self.entries.write().await;
                    if let Some(entry) = entries.get_mut(name) {
                        entry.last_error = Some(err.to_string());
                    }
                }
                self.schedule_retry(Arc::clone(self), name.to_string());
                self.bus.publish(Event::ServerFailed {
                    name: name.to_string(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn schedule_retry(&self, manager: Arc<Self>, name: String) {
        let policy = self.retry_policy;
        tokio::spawn(async move {
            let attempt = {
                let mut retries = manager.retries.lock().await;
                let state = retries.entry(name.clone()).or_default();
                state.attempt += 1;
                state.attempt
            };
            let delay = policy.delay_for_attempt(attempt.saturating_sub(1));
            debug!(provider = %name, attempt, delay_secs = delay.as_secs(), "scheduling provider retry");

            let task = tokio::spawn({
                let manager = Arc::clone(&manager);
                let name = name.clone();
                async move {
                    tokio::time::sleep(delay).await;
                    if manager.entries.read().await.contains_key(&name) {
                        let _ = manager.start_provider(&name).await;
                    }
                }
            });

            if let Some(state) = manager.retries.lock().await.get_mut(&name) {
                state.task = Some(task);
            }
        });
    }

    /// Stops a provider's client and cancels any pending retry, but keeps
    /// its configuration (used internally before a restart).
    async fn stop_client_only(&self, name: &str) {
        let client = {
            let mut entries = self.entries.write().await;
            entries.get_mut(name).and_then(|entry| entry.client.take())
        };
        if let Some(client) = client {
            client.stop().await;
        }
        if let Some(state) = self.retries.lock().await.get_mut(name) {
            state.cancel();
        }
    }

    pub async fn stop_provider(&self, name: &str) {
        self.stop_client_only(name).await;
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        for name in names {
            self.stop_provider(&name).await;
        }
    }

    /// Derives the aggregate catalog from currently running, connected
    /// providers, applying the ConfigStore enable/disable mask.
    pub async fn list_tools(&self) -> Vec<NamespacedTool> {
        let entries = self.entries.read().await;
        let mut catalog = Vec::new();
        for (name, entry) in entries.iter() {
            let Some(client) = &entry.client else { continue };
            if !client.is_connected() {
                continue;
            }
            catalog.extend(self.namespaced_for_provider(name, &client.list_tools()).await);
        }
        catalog
    }

    async fn namespaced_for_provider(&self, provider_name: &str, tools: &[ToolDescriptor]) -> Vec<NamespacedTool> {
        let mut namespaced = Vec::with_capacity(tools.len());
        for tool in tools {
            let enabled = match self.config_store.is_tool_enabled(provider_name, &tool.original_name).await {
                Ok(enabled) => enabled,
                Err(err) => {
                    debug!(provider = %provider_name, tool = %tool.original_name, error = %err, "config store lookup failed; skipping tool");
                    continue;
                }
            };
            if !enabled {
                continue;
            }
            namespaced.push(NamespacedTool {
                exposed_name: NamespacedTool::exposed_name_for(provider_name, &tool.original_name),
                original_name: tool.original_name.clone(),
                provider_name: provider_name.to_string(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
                enabled: true,
            });
        }
        namespaced
    }

    /// Reconciles the ConfigStore's per-provider tool table after a
    /// successful `tools/list`.
    async fn sync_tool_config(&self, provider_name: &str, tools: &[ToolDescriptor]) {
        if tools.is_empty() {
            return;
        }
        let mut overrides = HashMap::with_capacity(tools.len());
        for tool in tools {
            let enabled = self.config_store.is_tool_enabled(provider_name, &tool.original_name).await.unwrap_or(true);
            overrides.insert(
                tool.original_name.clone(),
                ToolOverride {
                    description: tool.description.clone(),
                    enable: enabled,
                },
            );
        }
        if let Err(err) = self.config_store.update_server_tools_config(provider_name, overrides).await {
            warn!(provider = %provider_name, error = %err, "failed to sync tool config");
        }
    }

    /// Parses `exposedName`, looks up the owning provider, and delegates.
    pub async fn call_tool(&self, exposed_name: &str, arguments: Value) -> Result<Value, AggregatorError> {
        let (provider_name, original_name) =
            NamespacedTool::split_exposed_name(exposed_name).ok_or_else(|| AggregatorError::tool_not_found(exposed_name))?;

        let client = {
            let entries = self.entries.read().await;
            entries
                .get(provider_name)
                .ok_or_else(|| AggregatorError::tool_not_found(exposed_name))?
                .client
                .clone()
                .ok_or_else(|| AggregatorError::provider_not_connected(provider_name))?
        };

        if !client.is_connected() {
            return Err(AggregatorError::provider_not_connected(provider_name));
        }

        client.call_tool(original_name, arguments).await
    }

    pub async fn get_status(&self) -> ServiceStatus {
        let entries = self.entries.read().await;
        let retries = self.retries.lock().await;
        let mut providers = Vec::with_capacity(entries.len());
        let mut tool_count = 0;
        for (name, entry) in entries.iter() {
            let connected = entry.client.as_ref().is_some_and(|client| client.is_connected());
            let count = entry.client.as_ref().map(|client| client.list_tools().len()).unwrap_or(0);
            tool_count += count;
            providers.push(ProviderStatus {
                name: name.clone(),
                transport: entry.config.transport_name(),
                connected,
                tool_count: count,
                last_error: entry.last_error.clone(),
                retry_attempt: retries.get(name).map(|state| state.attempt).unwrap_or(0),
            });
        }
        ServiceStatus { providers, tool_count }
    }
}

fn build_client(name: &str, config: &ProviderConfig) -> Result<Arc<dyn ProviderClient>, AggregatorError> {
    Ok(match config {
        ProviderConfig::Stdio { command, args, env, cwd } => {
            Arc::new(StdioProviderClient::new(name, command.clone(), args.clone(), env.clone(), cwd.clone()))
        }
        ProviderConfig::Sse { url, headers } => Arc::new(SseProviderClient::new(name, url.clone(), headers.clone())?),
        ProviderConfig::StreamableHttp { url, headers } => Arc::new(StreamableHttpProviderClient::new(name, url.clone(), headers.clone())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InMemoryConfigStore;

    fn manager() -> Arc<ServiceManager> {
        let store = Arc::new(InMemoryConfigStore::new(vec![], HashMap::new()));
        Arc::new(ServiceManager::new(store, EventBus::new()))
    }

    #[tokio::test]
    async fn list_tools_is_empty_with_no_providers() {
        let manager = manager();
        assert!(manager.list_tools().await.is_empty());
    }

    #[tokio::test]
    async fn call_tool_without_separator_is_tool_not_found() {
        let manager = manager();
        let err = manager.call_tool("no-separator", Value::Null).await.unwrap_err();
        assert!(matches!(err, AggregatorError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn call_tool_for_unknown_provider_is_tool_not_found() {
        let manager = manager();
        let err = manager.call_tool("ghost__thing", Value::Null).await.unwrap_err();
        assert!(matches!(err, AggregatorError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn start_provider_for_unconfigured_name_is_config_invalid() {
        let manager = manager();
        let err = manager.start_provider("missing").await.unwrap_err();
        assert!(matches!(err, AggregatorError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn provider_name_containing_double_underscore_is_rejected() {
        let manager = manager();
        let err = manager
            .add_provider_config(
                "a__b",
                ProviderConfig::Stdio {
                    command: "true".into(),
                    args: vec![],
                    env: vec![],
                    cwd: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AggregatorError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn failed_stdio_start_schedules_a_retry_and_keeps_catalog_empty() {
        let manager = manager();
        manager
            .add_provider_config(
                "calc",
                ProviderConfig::Stdio {
                    command: "/does/not/exist".into(),
                    args: vec![],
                    env: vec![],
                    cwd: None,
                },
            )
            .await
            .unwrap();

        let result = manager.start_provider("calc").await;
        assert!(result.is_err());

        let status = manager.get_status().await;
        let calc = status.providers.iter().find(|p| p.name == "calc").unwrap();
        assert!(!calc.connected);
        assert!(manager.list_tools().await.is_empty());

        manager.stop_provider("calc").await;
    }
}
