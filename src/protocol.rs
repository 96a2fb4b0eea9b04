//! JSON-RPC 2.0 message probing and synthesis
//!
//! The proxy never decodes message payloads in full. Inbound lines are probed
//! for `method` and `id` only; server output is probed for the shape of an
//! initialize response. Anything that does not decode passes through
//! untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version sent in every synthesized message
pub const JSONRPC_VERSION: &str = "2.0";

/// Handshake request method
pub const METHOD_INITIALIZE: &str = "initialize";

/// Handshake completion notification method
pub const NOTIF_INITIALIZED: &str = "notifications/initialized";

/// Tool list invalidation notification method
pub const NOTIF_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

/// Application error code returned for requests refused during a restart
pub const ERROR_SERVER_RESTARTING: i32 = -32002;

/// Error message paired with [`ERROR_SERVER_RESTARTING`]
pub const SERVER_RESTARTING_MESSAGE: &str = "server restarting, please retry";

/// Methods answerable without a fully established session.
///
/// Traffic using these methods is allowed through while the proxy waits for
/// the client to re-initialize after a restart.
pub const SAFE_METHODS: &[&str] = &[
    METHOD_INITIALIZE,
    "tools/list",
    "resources/list",
    "prompts/list",
    "ping",
];

/// Check whether a method is answerable without an established session
pub fn is_safe_method(method: &str) -> bool {
    SAFE_METHODS.contains(&method)
}

// ============================================================================
// Shallow Envelope Probing
// ============================================================================

/// Minimal view of a JSON-RPC message: method and id only.
///
/// A line that fails to decode yields an envelope with both fields unset,
/// which downstream policy treats as an opaque relay candidate.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcEnvelope {
    /// Method name (absent for responses)
    #[serde(default)]
    pub method: Option<String>,

    /// Request identifier (absent for notifications)
    #[serde(default)]
    pub id: Option<Value>,
}

impl RpcEnvelope {
    /// Probe a raw line for method and id. Never fails.
    pub fn parse(line: &str) -> Self {
        serde_json::from_str(line).unwrap_or_default()
    }

    /// True when the message carries a request id (i.e. expects a response)
    #[allow(dead_code)]
    pub fn is_request(&self) -> bool {
        self.id.is_some()
    }
}

// ============================================================================
// Initialize Response Detection
// ============================================================================

/// Partial decode target for handshake detection on server output
#[derive(Debug, Deserialize)]
struct InitializeResultProbe {
    result: Option<InitializeResultShape>,
}

/// The two keys that mark a result as an initialize response
#[derive(Debug, Deserialize)]
struct InitializeResultShape {
    capabilities: Option<Value>,

    #[serde(rename = "serverInfo")]
    server_info: Option<Value>,
}

/// Check whether a server output line looks like an initialize response.
///
/// A decode failure is defined as "not an initialize response"; the caller
/// relays such lines unmodified.
pub fn is_initialize_response(line: &str) -> bool {
    match serde_json::from_str::<InitializeResultProbe>(line) {
        Ok(probe) => probe
            .result
            .map(|shape| shape.capabilities.is_some() || shape.server_info.is_some())
            .unwrap_or(false),
        Err(_) => false,
    }
}

// ============================================================================
// Synthesized Messages
// ============================================================================

/// JSON-RPC error object carried by a synthesized error response
#[derive(Debug, Clone, Serialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
}

/// Synthesized error response addressed to a specific request id
#[derive(Debug, Clone, Serialize)]
struct ErrorResponse<'a> {
    jsonrpc: &'a str,
    id: &'a Value,
    error: ErrorObject,
}

/// Synthesized notification (no id, no params)
#[derive(Debug, Clone, Serialize)]
struct Notification<'a> {
    jsonrpc: &'a str,
    method: &'a str,
}

/// Build a single-line error response for the given request id
pub fn error_response(id: &Value, code: i32, message: &str) -> String {
    let response = ErrorResponse {
        jsonrpc: JSONRPC_VERSION,
        id,
        error: ErrorObject {
            code,
            message: message.to_string(),
        },
    };
    // Serialization of these fixed shapes cannot fail
    serde_json::to_string(&response).unwrap_or_default()
}

/// Build a single-line notification for the given method
pub fn notification(method: &str) -> String {
    let message = Notification {
        jsonrpc: JSONRPC_VERSION,
        method,
    };
    serde_json::to_string(&message).unwrap_or_default()
}

// ============================================================================
// Tests
// ============================================================================
