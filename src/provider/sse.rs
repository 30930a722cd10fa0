//! SSE Provider Client: persistent event-source connection, request side
//! riding the return channel rmcp's SSE client transport exposes.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::RoleClient;
use rmcp::model::CallToolRequestParam;
use rmcp::service::{RunningService, ServiceExt as _};
use rmcp::transport::SseClientTransport;
use rmcp::transport::sse_client::SseClientConfig;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::warn;

use crate::config::{HeaderEntry, ToolDescriptor};
use crate::error::AggregatorError;

use super::{ProviderClient, TOOL_CALL_TIMEOUT};

fn build_client(headers: &[HeaderEntry]) -> Result<reqwest::Client, AggregatorError> {
    let mut header_map = HeaderMap::new();
    for entry in headers {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(entry.name.as_str()), HeaderValue::try_from(entry.value.as_str())) {
            header_map.insert(name, value);
        }
    }
    reqwest::Client::builder()
        .default_headers(header_map)
        .build()
        .map_err(|err| AggregatorError::config_invalid(err.to_string()))
}

pub struct SseProviderClient {
    name: String,
    url: String,
    headers: Vec<HeaderEntry>,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
    tools: Mutex<Vec<ToolDescriptor>>,
    connected: AtomicBool,
}

impl SseProviderClient {
    pub fn new(name: impl Into<String>, url: impl Into<String>, headers: Vec<HeaderEntry>) -> Result<Self, AggregatorError> {
        let url = url.into();
        url::Url::parse(&url).map_err(|err| AggregatorError::config_invalid(err.to_string()))?;
        Ok(Self {
            name: name.into(),
            url,
            headers,
            service: Mutex::new(None),
            tools: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ProviderClient for SseProviderClient {
    async fn start(&self) -> Result<(), AggregatorError> {
        let http_client = build_client(&self.headers)?;
        let config = SseClientConfig {
            sse_endpoint: self.url.as_str().into(),
            ..Default::default()
        };
        let transport = SseClientTransport::start_with_client(http_client, config)
            .await
            .map_err(|err| AggregatorError::provider_start_failed(&self.name, err.to_string()))?;

        let running = ().serve(transport).await.map_err(|err| AggregatorError::provider_start_failed(&self.name, err.to_string()))?;

        // tools/list failure is non-fatal: the client stays Running with an
        // empty catalog and a warning.
        let tools = match running.list_all_tools().await {
            Ok(tools) => tools
                .into_iter()
                .map(|tool| ToolDescriptor {
                    original_name: tool.name.to_string(),
                    description: tool.description.as_deref().unwrap_or_default().to_string(),
                    input_schema: Value::Object((*tool.input_schema).clone()),
                    provider_name: self.name.clone(),
                })
                .collect(),
            Err(err) => {
                warn!(provider = %self.name, error = %err, "tools/list failed during start; continuing with an empty catalog");
                Vec::new()
            }
        };

        *self.tools.lock().await = tools;
        *self.service.lock().await = Some(running);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.try_lock().map(|guard| guard.clone()).unwrap_or_default()
    }

    async fn call_tool(&self, original_name: &str, arguments: Value) -> Result<Value, AggregatorError> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or_else(|| AggregatorError::provider_disconnected(&self.name))?;

        let arguments = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => Some(Map::from_iter([("value".to_string(), other)])),
        };

        let call_future = service.call_tool(CallToolRequestParam {
            name: original_name.to_string().into(),
            arguments,
        });

        match timeout(TOOL_CALL_TIMEOUT, call_future).await {
            Ok(Ok(result)) => serde_json::to_value(result).map_err(|err| AggregatorError::protocol_error(-32603, err.to_string())),
            Ok(Err(err)) => Err(AggregatorError::protocol_error(-32603, err.to_string())),
            Err(_) => Err(AggregatorError::request_timeout(TOOL_CALL_TIMEOUT.as_millis() as u64)),
        }
    }

    async fn stop(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(running) = self.service.lock().await.take() {
            let _ = running.cancel().await;
        }
        self.tools.lock().await.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SseProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseProviderClient")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_malformed_url() {
        let result = SseProviderClient::new("bad", "not a url", vec![]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn start_fails_fast_against_an_unroutable_host() {
        let client = SseProviderClient::new("unreachable", "http://127.0.0.1:1/sse", vec![]).unwrap();
        let result = client.start().await;
        assert!(result.is_err());
        assert!(!client.is_connected());
    }
}
