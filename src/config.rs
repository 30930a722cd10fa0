//! Configuration data model and the external `ConfigStore` interface.
//!
//! This module defines the shapes the core reads from an externally-owned
//! configuration store. Parsing a config file and persisting edits back to
//! disk are responsibilities of the caller, not this crate.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single descriptor as reported by a provider's `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolDescriptor {
    pub original_name: String,
    pub description: String,
    pub input_schema: Value,
    pub provider_name: String,
}

/// The catalog entry exposed to upstream endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespacedTool {
    pub exposed_name: String,
    pub original_name: String,
    pub provider_name: String,
    pub description: String,
    pub input_schema: Value,
    pub enabled: bool,
}

impl NamespacedTool {
    /// Builds the globally-unique exposed name: `providerName__originalName`.
    pub fn exposed_name_for(provider_name: &str, original_name: &str) -> String {
        format!("{provider_name}__{original_name}")
    }

    /// Splits an exposed name on the first `"__"` occurrence.
    ///
    /// Returns `None` if the name carries no separator, which the caller
    /// should treat as `ToolNotFound`. Provider names are validated at
    /// config-time to never contain `"__"`.
    pub fn split_exposed_name(exposed_name: &str) -> Option<(&str, &str)> {
        exposed_name.split_once("__")
    }
}

/// One HTTP header/env-var pair, used by the SSE and StreamableHTTP variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

/// Tagged configuration for a single downstream provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "transport", rename_all = "camelCase")]
pub enum ProviderConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: Vec<HeaderEntry>,
        #[serde(default)]
        cwd: Option<String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: Vec<HeaderEntry>,
    },
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: Vec<HeaderEntry>,
    },
}

impl ProviderConfig {
    pub fn transport_name(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Sse { .. } => "sse",
            Self::StreamableHttp { .. } => "streamable-http",
        }
    }
}

/// Per-tool enablement/description override persisted by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolOverride {
    pub description: String,
    pub enable: bool,
}

/// The external configuration surface the core consumes.
///
/// A real deployment backs this with a file-backed or database-backed
/// implementation; this crate ships only an in-memory reference
/// implementation for tests and standalone runs (see [`InMemoryConfigStore`]).
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_mcp_endpoints(&self) -> anyhow::Result<Vec<String>>;

    async fn get_mcp_servers(&self) -> anyhow::Result<HashMap<String, ProviderConfig>>;

    async fn is_tool_enabled(&self, provider_name: &str, tool_name: &str) -> anyhow::Result<bool>;

    async fn update_server_tools_config(
        &self,
        provider_name: &str,
        tools: HashMap<String, ToolOverride>,
    ) -> anyhow::Result<()>;

    async fn get_web_ui_port(&self) -> anyhow::Result<u16>;
}

/// In-memory `ConfigStore` used by the bundled binary and by tests.
///
/// Tool enablement defaults to `true` for any tool not explicitly
/// recorded, matching the Service Manager's config-change sync rule
/// (newly discovered tools are inserted with `enabled = true`).
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    endpoints: std::sync::Mutex<Vec<String>>,
    servers: std::sync::Mutex<HashMap<String, ProviderConfig>>,
    overrides: std::sync::Mutex<HashMap<String, HashMap<String, ToolOverride>>>,
    web_ui_port: u16,
}

impl InMemoryConfigStore {
    pub fn new(endpoints: Vec<String>, servers: HashMap<String, ProviderConfig>) -> Self {
        Self {
            endpoints: std::sync::Mutex::new(endpoints),
            servers: std::sync::Mutex::new(servers),
            overrides: std::sync::Mutex::new(HashMap::new()),
            web_ui_port: 0,
        }
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn get_mcp_endpoints(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.endpoints.lock().expect("endpoints lock poisoned").clone())
    }

    async fn get_mcp_servers(&self) -> anyhow::Result<HashMap<String, ProviderConfig>> {
        Ok(self.servers.lock().expect("servers lock poisoned").clone())
    }

    async fn is_tool_enabled(&self, provider_name: &str, tool_name: &str) -> anyhow::Result<bool> {
        let overrides = self.overrides.lock().expect("overrides lock poisoned");
        Ok(overrides
            .get(provider_name)
            .and_then(|tools| tools.get(tool_name))
            .map(|entry| entry.enable)
            .unwrap_or(true))
    }

    async fn update_server_tools_config(
        &self,
        provider_name: &str,
        tools: HashMap<String, ToolOverride>,
    ) -> anyhow::Result<()> {
        let mut overrides = self.overrides.lock().expect("overrides lock poisoned");
        overrides.entry(provider_name.to_string()).or_default().extend(tools);
        Ok(())
    }

    async fn get_web_ui_port(&self) -> anyhow::Result<u16> {
        Ok(self.web_ui_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposed_name_round_trips_through_split() {
        let exposed = NamespacedTool::exposed_name_for("calc", "add");
        assert_eq!(exposed, "calc__add");
        assert_eq!(NamespacedTool::split_exposed_name(&exposed), Some(("calc", "add")));
    }

    #[test]
    fn split_exposed_name_rejects_missing_separator() {
        assert_eq!(NamespacedTool::split_exposed_name("coze"), None);
    }

    #[tokio::test]
    async fn in_memory_store_defaults_unknown_tools_to_enabled() {
        let store = InMemoryConfigStore::new(vec![], HashMap::new());
        assert!(store.is_tool_enabled("calc", "add").await.unwrap());
    }

    #[tokio::test]
    async fn in_memory_store_honors_override() {
        let store = InMemoryConfigStore::new(vec![], HashMap::new());
        let mut tools = HashMap::new();
        tools.insert(
            "add".to_string(),
            ToolOverride {
                description: "adds numbers".into(),
                enable: false,
            },
        );
        store.update_server_tools_config("calc", tools).await.unwrap();
        assert!(!store.is_tool_enabled("calc", "add").await.unwrap());
    }
}
