//! Streaming-HTTP Provider Client: POST request/response, no persistent socket.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::RoleClient;
use rmcp::model::CallToolRequestParam;
use rmcp::service::{RunningService, ServiceExt as _};
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
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
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|err| AggregatorError::config_invalid(err.to_string()))
}

pub struct StreamableHttpProviderClient {
    name: String,
    url: String,
    headers: Vec<HeaderEntry>,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
    tools: Mutex<Vec<ToolDescriptor>>,
    connected: AtomicBool,
}

impl StreamableHttpProviderClient {
    pub fn new(name: impl Into<String>, url: impl Into<String>, headers: Vec<HeaderEntry>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            headers,
            service: Mutex::new(None),
            tools: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ProviderClient for StreamableHttpProviderClient {
    async fn start(&self) -> Result<(), AggregatorError> {
        let http_client = build_client(&self.headers)?;
        let config = StreamableHttpClientTransportConfig::with_uri(self.url.clone());
        let transport = StreamableHttpClientTransport::with_client(http_client, config);

        let running = ().serve(transport).await.map_err(|err| AggregatorError::provider_start_failed(&self.name, err.to_string()))?;

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

impl std::fmt::Debug for StreamableHttpProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpProviderClient")
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
    fn build_client_accepts_header_list() {
        let headers = vec![HeaderEntry {
            name: "Authorization".into(),
            value: "Bearer abc".into(),
        }];
        assert!(build_client(&headers).is_ok());
    }

    #[tokio::test]
    async fn start_fails_fast_against_an_unroutable_host() {
        let client = StreamableHttpProviderClient::new("unreachable", "http://127.0.0.1:1", vec![]);
        let result = client.start().await;
        assert!(result.is_err());
        assert!(!client.is_connected());
    }
}
