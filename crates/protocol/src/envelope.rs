use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Basic envelope validation (version marker, non-empty method).
    pub fn is_well_formed(&self) -> bool {
        self.jsonrpc == "2.0" && !self.method.is_empty()
    }
}

/// JSON-RPC 2.0 response envelope. Exactly one of `result`/`error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC error member. `data` carries the full error envelope so MCP
/// clients get the structured taxonomy, not just a message string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ErrorEnvelope>,
}

// Standard JSON-RPC error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Error severity as exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

/// Structured error envelope crossing the MCP boundary.
///
/// `code` values are contract (SCREAMING_SNAKE identifiers); everything else
/// is advisory context for the calling agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: String,
    pub code: String,
    pub severity: Severity,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_resources: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorEnvelope {
    pub fn new(code: &str, message: &str, severity: Severity, recoverable: bool) -> Self {
        Self {
            success: false,
            error: message.to_string(),
            code: code.to_string(),
            severity,
            recoverable,
            suggestions: Vec::new(),
            context: Value::Null,
            retry_after: None,
            related_resources: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_minimal_envelope() {
        let req: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        assert!(req.is_well_formed());
        assert_eq!(req.method, "ping");
        assert_eq!(req.id, Some(Value::from(1)));
        assert!(req.params.is_none());
    }

    #[test]
    fn request_rejects_wrong_version() {
        let req: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#).unwrap();
        assert!(!req.is_well_formed());
    }

    #[test]
    fn success_response_omits_error() {
        let resp = RpcResponse::success(Value::from(7), serde_json::json!({"ok": true}));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""result""#));
        assert!(!json.contains(r#""error""#));
        assert!(json.contains(r#""id":7"#));
    }

    #[test]
    fn failure_response_carries_envelope() {
        let env = ErrorEnvelope::new("SESSION_NOT_FOUND", "no such session", Severity::Error, true);
        let resp = RpcResponse::failure(
            Value::String("r1".into()),
            RpcError {
                code: INVALID_PARAMS,
                message: "no such session".into(),
                data: Some(env),
            },
        );
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error"]["code"], INVALID_PARAMS);
        assert_eq!(json["error"]["data"]["code"], "SESSION_NOT_FOUND");
        assert_eq!(json["error"]["data"]["success"], false);
        assert_eq!(json["error"]["data"]["severity"], "error");
        assert!(json["result"].is_null());
    }

    #[test]
    fn envelope_omits_empty_fields() {
        let env = ErrorEnvelope::new("INVALID_INPUT", "bad purpose", Severity::Warning, true);
        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("suggestions").is_none());
        assert!(json.get("context").is_none());
        assert!(json.get("retry_after").is_none());
        assert!(json.get("related_resources").is_none());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn string_and_null_ids_supported() {
        let req: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc","method":"tools/list"}"#).unwrap();
        assert_eq!(req.id, Some(Value::String("abc".into())));

        let notif: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/x"}"#).unwrap();
        assert!(notif.id.is_none());
    }
}
