//! Error taxonomy for the aggregation proxy.

use thiserror::Error;

/// Top-level error type shared by every subsystem.
#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("configuration invalid: {reason}")]
    ConfigInvalid { reason: String },

    #[error("provider '{name}' failed to start: {cause}")]
    ProviderStartFailed { name: String, cause: String },

    #[error("provider '{name}' is disconnected")]
    ProviderDisconnected { name: String },

    #[error("transport closed: {context}")]
    TransportClosed { context: String },

    #[error("request timed out after {timeout_ms}ms")]
    RequestTimeout { timeout_ms: u64 },

    #[error("protocol error {code}: {message}")]
    ProtocolError { code: i64, message: String },

    #[error("tool not found: {exposed_name}")]
    ToolNotFound { exposed_name: String },

    #[error("provider '{name}' not connected")]
    ProviderNotConnected { name: String },

    #[error("endpoint already registered: {url}")]
    EndpointExists { url: String },

    #[error("endpoint not initialized: {url}")]
    EndpointNotInitialized { url: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl AggregatorError {
    pub fn config_invalid(reason: impl Into<String>) -> Self {
        Self::ConfigInvalid { reason: reason.into() }
    }

    pub fn provider_start_failed(name: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::ProviderStartFailed {
            name: name.into(),
            cause: cause.into(),
        }
    }

    pub fn provider_disconnected(name: impl Into<String>) -> Self {
        Self::ProviderDisconnected { name: name.into() }
    }

    pub fn transport_closed(context: impl Into<String>) -> Self {
        Self::TransportClosed { context: context.into() }
    }

    pub fn request_timeout(timeout_ms: u64) -> Self {
        Self::RequestTimeout { timeout_ms }
    }

    pub fn protocol_error(code: i64, message: impl Into<String>) -> Self {
        Self::ProtocolError {
            code,
            message: message.into(),
        }
    }

    pub fn tool_not_found(exposed_name: impl Into<String>) -> Self {
        Self::ToolNotFound {
            exposed_name: exposed_name.into(),
        }
    }

    pub fn provider_not_connected(name: impl Into<String>) -> Self {
        Self::ProviderNotConnected { name: name.into() }
    }

    pub fn endpoint_exists(url: impl Into<String>) -> Self {
        Self::EndpointExists { url: url.into() }
    }

    pub fn endpoint_not_initialized(url: impl Into<String>) -> Self {
        Self::EndpointNotInitialized { url: url.into() }
    }

    /// Maps this error onto a JSON-RPC error code for the endpoint wire contract.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            Self::ToolNotFound { .. } => -32601,
            Self::ProtocolError { code, .. } => *code,
            _ => -32603,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_rpc_code_maps_tool_not_found_to_method_not_found() {
        let err = AggregatorError::tool_not_found("calc__add");
        assert_eq!(err.json_rpc_code(), -32601);
    }

    #[test]
    fn json_rpc_code_defaults_to_internal_error() {
        let err = AggregatorError::provider_disconnected("calc");
        assert_eq!(err.json_rpc_code(), -32603);
    }

    #[test]
    fn protocol_error_preserves_upstream_code() {
        let err = AggregatorError::protocol_error(-32602, "invalid params");
        assert_eq!(err.json_rpc_code(), -32602);
    }
}
