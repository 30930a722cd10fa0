//! Provider Client: the MCP client role spoken toward one downstream provider.

pub mod sse;
pub mod stdio;
pub mod streamable_http;

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::ToolDescriptor;
use crate::error::AggregatorError;

/// Protocol version advertised on both the client and server role.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Per-request timeout enforced by every Provider Client implementation.
pub const TOOL_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// A JSON-RPC 2.0 request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: Option<i64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// A notification carries no id and expects no response.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Monotonic JSON-RPC id generator, one per Provider Client.
#[derive(Debug, Default)]
pub struct IdGenerator(AtomicI64);

impl IdGenerator {
    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// A waiter for a correlated JSON-RPC response, keyed by request id.
pub type PendingReply = oneshot::Sender<Result<Value, AggregatorError>>;

/// Capability set every transport-specific Provider Client must offer.
///
/// `start` performs the handshake (`initialize` → `notifications/initialized`
/// → `tools/list`). `list_tools` returns the cached catalog from the last
/// successful `tools/list` without round-tripping to the provider.
/// `call_tool` always round-trips.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn start(&self) -> Result<(), AggregatorError>;

    fn list_tools(&self) -> Vec<ToolDescriptor>;

    async fn call_tool(&self, original_name: &str, arguments: Value) -> Result<Value, AggregatorError>;

    async fn stop(&self);

    /// True while the transport considers itself connected. Used by the
    /// Service Manager to decide whether `callTool` may be attempted.
    fn is_connected(&self) -> bool;
}

pub(crate) fn to_result(response: JsonRpcResponse) -> Result<Value, AggregatorError> {
    if let Some(error) = response.error {
        return Err(AggregatorError::protocol_error(error.code, error.message));
    }
    Ok(response.result.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generator_is_monotonic() {
        let gen = IdGenerator::default();
        assert_eq!(gen.next(), 0);
        assert_eq!(gen.next(), 1);
        assert_eq!(gen.next(), 2);
    }

    #[test]
    fn to_result_surfaces_upstream_error_code() {
        let response = JsonRpcResponse {
            id: Some(Value::from(1)),
            result: None,
            error: Some(JsonRpcErrorObject {
                code: -32602,
                message: "invalid params".into(),
                data: None,
            }),
        };
        let err = to_result(response).unwrap_err();
        assert_eq!(err.json_rpc_code(), -32602);
    }

    #[test]
    fn to_result_defaults_missing_result_to_null() {
        let response = JsonRpcResponse {
            id: Some(Value::from(1)),
            result: None,
            error: None,
        };
        assert_eq!(to_result(response).unwrap(), Value::Null);
    }
}
