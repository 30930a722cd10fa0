//! Endpoint Connection: the MCP *server* role spoken over one upstream
//! WebSocket. The aggregator is the WebSocket client, but it answers
//! requests the way an MCP server would.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::bus::{EndpointOperation, Event, EventBus};
use crate::provider::PROTOCOL_VERSION;
use crate::service::ServiceManager;

/// Constant reconnect delay, deliberately not exponential: the endpoint is
/// assumed authoritative and usually reachable.
pub const DEFAULT_RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

struct SharedState {
    connected: AtomicBool,
    initialized: AtomicBool,
    reconnect_attempt: AtomicU32,
}

/// One upstream endpoint connection, owning its own reconnect loop.
pub struct EndpointConnection {
    url: String,
    service_manager: Arc<ServiceManager>,
    bus: EventBus,
    state: Arc<SharedState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointConnection {
    pub fn new(url: impl Into<String>, service_manager: Arc<ServiceManager>, bus: EventBus) -> Self {
        Self {
            url: url.into(),
            service_manager,
            bus,
            state: Arc::new(SharedState {
                connected: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                reconnect_attempt: AtomicU32::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    pub fn initialized(&self) -> bool {
        self.state.initialized.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.state.reconnect_attempt.load(Ordering::SeqCst)
    }

    /// Starts the connect-serve-reconnect loop as a background task.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.task.lock().await;
        if guard.is_some() {
            return;
        }
        let connection = Arc::clone(self);
        *guard = Some(tokio::spawn(async move { connection.run_forever().await }));
    }

    /// Stops the reconnect loop and closes the active socket, if any.
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        self.state.connected.store(false, Ordering::SeqCst);
        self.state.initialized.store(false, Ordering::SeqCst);
        self.emit_status(EndpointOperation::Remove, true, None);
    }

    /// Forces a disconnect-then-reconnect cycle without tearing down the
    /// supervising task.
    pub async fn force_reconnect(self: &Arc<Self>) {
        self.emit_status(EndpointOperation::Disconnect, true, None);
        self.stop().await;
        self.start().await;
    }

    async fn run_forever(self: Arc<Self>) {
        loop {
            self.emit_status(EndpointOperation::Connect, true, None);
            match self.connect_and_serve().await {
                Ok(()) => debug!(url = %self.url, "endpoint socket closed cleanly"),
                Err(err) => warn!(url = %self.url, error = %err, "endpoint connection error"),
            }

            self.state.connected.store(false, Ordering::SeqCst);
            self.state.initialized.store(false, Ordering::SeqCst);
            self.emit_status(EndpointOperation::Disconnect, true, None);

            let attempt = self.state.reconnect_attempt.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(url = %self.url, attempt, "scheduling endpoint reconnect");
            tokio::time::sleep(DEFAULT_RECONNECT_DELAY).await;
            self.emit_status(EndpointOperation::Reconnect, true, None);
        }
    }

    async fn connect_and_serve(&self) -> anyhow::Result<()> {
        let (stream, _response) = tokio::time::timeout(DEFAULT_CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&self.url)).await??;
        self.state.connected.store(true, Ordering::SeqCst);
        info!(url = %self.url, "endpoint connected");

        let (mut write, mut read) = stream.split();

        while let Some(message) = read.next().await {
            let message = message?;
            let text = match message {
                Message::Text(text) => text.to_string(),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => continue,
            };

            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                warn!(url = %self.url, "received malformed JSON over endpoint socket");
                continue;
            };

            if value.get("method").is_none() {
                // A response frame for something we sent (e.g. none, currently);
                // nothing outbound originates requests yet, so this is unexpected
                // traffic and is simply logged.
                debug!(url = %self.url, "ignoring non-request frame");
                continue;
            }

            if let Some(response) = self.handle_incoming(&value).await {
                let payload = serde_json::to_string(&response)?;
                write.send(Message::Text(payload.into())).await?;
            }
        }

        Ok(())
    }

    /// Dispatches one JSON-RPC request/notification from upstream. Returns
    /// `None` for notifications, which get no reply.
    async fn handle_incoming(&self, value: &Value) -> Option<Value> {
        let method = value.get("method").and_then(Value::as_str).unwrap_or_default();
        let id = value.get("id").cloned();

        if id.is_none() {
            debug!(url = %self.url, method, "received notification");
            return None;
        }

        if method != "initialize" && !self.state.initialized.load(Ordering::SeqCst) {
            return Some(error_response(id, -32600, "server not initialized"));
        }

        match method {
            "initialize" => {
                self.state.initialized.store(true, Ordering::SeqCst);
                Some(success_response(
                    id,
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": { "tools": { "listChanged": false } },
                        "serverInfo": { "name": "mcp-aggregator", "version": env!("CARGO_PKG_VERSION") },
                    }),
                ))
            }
            "tools/list" => {
                let tools = self.service_manager.list_tools().await;
                let tools: Vec<Value> = tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "name": tool.exposed_name,
                            "description": tool.description,
                            "inputSchema": tool.input_schema,
                        })
                    })
                    .collect();
                Some(success_response(id, json!({ "tools": tools })))
            }
            "tools/call" => {
                let Some(params) = value.get("params") else {
                    return Some(error_response(id, -32602, "missing params"));
                };
                let Some(name) = params.get("name").and_then(Value::as_str) else {
                    return Some(error_response(id, -32602, "missing tool name"));
                };
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

                match self.service_manager.call_tool(name, arguments).await {
                    Ok(result) => Some(success_response(id, result)),
                    Err(err) => Some(error_response(id, err.json_rpc_code(), err.to_string())),
                }
            }
            "ping" => Some(success_response(id, json!({}))),
            "notifications/initialized" => None,
            other => {
                debug!(url = %self.url, method = other, "unhandled method");
                Some(error_response(id, -32601, "method not found"))
            }
        }
    }

    fn emit_status(&self, operation: EndpointOperation, success: bool, message: Option<String>) {
        self.bus.publish(Event::EndpointStatus {
            url: self.url.clone(),
            connected: self.connected(),
            operation,
            success,
            message,
            timestamp: Utc::now(),
        });
    }
}

fn success_response(id: Option<Value>, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_response(id: Option<Value>, code: i64, message: impl Into<String>) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message.into() } })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InMemoryConfigStore;
    use std::collections::HashMap;

    fn service_manager() -> Arc<ServiceManager> {
        let store = Arc::new(InMemoryConfigStore::new(vec![], HashMap::new()));
        Arc::new(ServiceManager::new(store, EventBus::new()))
    }

    #[tokio::test]
    async fn tools_call_before_initialize_is_invalid_request() {
        let connection = EndpointConnection::new("wss://example.invalid", service_manager(), EventBus::new());
        let request = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": { "name": "calc__add" } });
        let response = connection.handle_incoming(&request).await.unwrap();
        assert_eq!(response["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn initialize_then_ping_succeeds() {
        let connection = EndpointConnection::new("wss://example.invalid", service_manager(), EventBus::new());
        let init = json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" });
        let response = connection.handle_incoming(&init).await.unwrap();
        assert_eq!(response["result"]["protocolVersion"], PROTOCOL_VERSION);

        let ping = json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" });
        let response = connection.handle_incoming(&ping).await.unwrap();
        assert_eq!(response["result"], json!({}));
    }

    #[tokio::test]
    async fn unknown_method_after_init_is_method_not_found() {
        let connection = EndpointConnection::new("wss://example.invalid", service_manager(), EventBus::new());
        connection.state.initialized.store(true, Ordering::SeqCst);
        let request = json!({ "jsonrpc": "2.0", "id": 3, "method": "unsupported/thing" });
        let response = connection.handle_incoming(&request).await.unwrap();
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let connection = EndpointConnection::new("wss://example.invalid", service_manager(), EventBus::new());
        let notification = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
        assert!(connection.handle_incoming(&notification).await.is_none());
    }
}
