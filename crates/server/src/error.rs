use quorum_protocol::envelope::{self, ErrorEnvelope, Severity};
use quorum_protocol::types::Permission;
use serde_json::{Value, json};

/// Domain errors raised by the engine. Every variant maps to a stable
/// SCREAMING_SNAKE code that crosses the MCP boundary in the error envelope.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("invalid {field}: expected {expected}")]
    InvalidInputFormat {
        field: &'static str,
        expected: &'static str,
    },
    #[error("content is {actual} characters, the limit is {limit}")]
    ContentTooLarge { actual: usize, limit: usize },
    #[error("{0}")]
    InvalidSearchQuery(String),
    #[error("requested limit {requested} exceeds the maximum of {max}")]
    SearchLimitExceeded { requested: u64, max: u64 },
    #[error("{0}")]
    InvalidKey(String),

    #[error("invalid api key")]
    InvalidApiKey,
    #[error("token has expired")]
    TokenExpired,
    #[error("token has been revoked")]
    TokenRevoked,
    #[error("missing required permission: {}", missing.as_str())]
    PermissionDenied { missing: Permission },
    #[error("caller may not use this visibility")]
    VisibilityPermissionDenied,

    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("session {0} is no longer active")]
    SessionInactive(String),
    #[error("memory quota exceeded: {used} of {quota} bytes in use")]
    MemoryLimitExceeded { used: u64, quota: u64 },

    #[error("session is locked by a concurrent writer")]
    SessionLocked,
    #[error("database operation timed out")]
    DatabaseTimeout,
    #[error("connection pool exhausted")]
    ConnectionPoolExhausted,
    #[error("request deadline exceeded")]
    RequestTimeout,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidInput(_) => "INVALID_INPUT",
            ApiError::InvalidInputFormat { .. } => "INVALID_INPUT_FORMAT",
            ApiError::ContentTooLarge { .. } => "CONTENT_TOO_LARGE",
            ApiError::InvalidSearchQuery(_) => "INVALID_SEARCH_QUERY",
            ApiError::SearchLimitExceeded { .. } => "SEARCH_LIMIT_EXCEEDED",
            ApiError::InvalidKey(_) => "INVALID_KEY",
            ApiError::InvalidApiKey => "INVALID_API_KEY",
            ApiError::TokenExpired => "TOKEN_EXPIRED",
            ApiError::TokenRevoked => "TOKEN_REVOKED",
            ApiError::PermissionDenied { .. } => "PERMISSION_DENIED",
            ApiError::VisibilityPermissionDenied => "VISIBILITY_PERMISSION_DENIED",
            ApiError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            ApiError::SessionInactive(_) => "SESSION_INACTIVE",
            ApiError::MemoryLimitExceeded { .. } => "MEMORY_LIMIT_EXCEEDED",
            ApiError::SessionLocked => "SESSION_LOCKED",
            ApiError::DatabaseTimeout => "DATABASE_TIMEOUT",
            ApiError::ConnectionPoolExhausted => "CONNECTION_POOL_EXHAUSTED",
            ApiError::RequestTimeout => "REQUEST_TIMEOUT",
            ApiError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ApiError::InvalidInput(_)
            | ApiError::InvalidInputFormat { .. }
            | ApiError::ContentTooLarge { .. }
            | ApiError::InvalidSearchQuery(_)
            | ApiError::SearchLimitExceeded { .. }
            | ApiError::InvalidKey(_) => Severity::Warning,
            ApiError::StorageUnavailable(_) | ApiError::Internal(_) => Severity::Critical,
            _ => Severity::Error,
        }
    }

    pub fn recoverable(&self) -> bool {
        !matches!(
            self,
            ApiError::InvalidApiKey | ApiError::StorageUnavailable(_) | ApiError::Internal(_)
        )
    }

    /// Suggested wait before retrying, for transient failures.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::SessionLocked => Some(1),
            ApiError::DatabaseTimeout => Some(5),
            ApiError::ConnectionPoolExhausted => Some(2),
            ApiError::RequestTimeout => Some(10),
            _ => None,
        }
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            ApiError::TokenExpired | ApiError::TokenRevoked => {
                vec!["Authenticate again to obtain a fresh token".to_string()]
            }
            ApiError::PermissionDenied { missing } => vec![format!(
                "Re-authenticate requesting the '{}' permission",
                missing.as_str()
            )],
            ApiError::InvalidSearchQuery(_) => {
                vec!["Use a query of at least 3 characters".to_string()]
            }
            ApiError::MemoryLimitExceeded { .. } => {
                vec!["Delete unused memory entries or set shorter TTLs".to_string()]
            }
            ApiError::SessionInactive(_) => {
                vec!["The session is read-only; create a new session to continue".to_string()]
            }
            _ => Vec::new(),
        }
    }

    fn related_resources(&self) -> Vec<String> {
        match self {
            ApiError::TokenExpired
            | ApiError::TokenRevoked
            | ApiError::PermissionDenied { .. }
            | ApiError::VisibilityPermissionDenied
            | ApiError::InvalidApiKey => vec!["authenticate_agent".to_string()],
            _ => Vec::new(),
        }
    }

    fn context(&self) -> Value {
        match self {
            ApiError::InvalidInputFormat { field, expected } => {
                json!({ "field": field, "expected_format": expected })
            }
            ApiError::ContentTooLarge { actual, limit } => {
                json!({ "length": actual, "limit": limit })
            }
            ApiError::SearchLimitExceeded { requested, max } => {
                json!({ "requested": requested, "max": max })
            }
            ApiError::PermissionDenied { missing } => {
                json!({ "missing_permission": missing.as_str() })
            }
            ApiError::MemoryLimitExceeded { used, quota } => {
                json!({ "used_bytes": used, "quota_bytes": quota })
            }
            _ => Value::Null,
        }
    }

    /// JSON-RPC error code this domain error surfaces as.
    pub fn rpc_code(&self) -> i64 {
        match self {
            ApiError::InvalidInput(_)
            | ApiError::InvalidInputFormat { .. }
            | ApiError::ContentTooLarge { .. }
            | ApiError::InvalidSearchQuery(_)
            | ApiError::SearchLimitExceeded { .. }
            | ApiError::InvalidKey(_)
            | ApiError::SessionNotFound(_)
            | ApiError::SessionInactive(_) => envelope::INVALID_PARAMS,
            ApiError::StorageUnavailable(_) | ApiError::Internal(_) => envelope::INTERNAL_ERROR,
            // auth and transient failures: application-level range
            _ => -32000,
        }
    }

    /// Render the structured envelope that crosses the MCP boundary.
    pub fn envelope(&self) -> ErrorEnvelope {
        let mut env = ErrorEnvelope::new(
            self.code(),
            &self.to_string(),
            self.severity(),
            self.recoverable(),
        );
        env.suggestions = self.suggestions();
        env.related_resources = self.related_resources();
        env.context = self.context();
        env.retry_after = self.retry_after();
        env
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => ApiError::ConnectionPoolExhausted,
            sqlx::Error::PoolClosed => ApiError::StorageUnavailable("pool closed".to_string()),
            sqlx::Error::Database(db) => {
                let code = db.code().unwrap_or_default();
                // SQLITE_BUSY / SQLITE_LOCKED family
                if code == "5" || code == "6" || code.starts_with("517") {
                    ApiError::SessionLocked
                } else {
                    ApiError::Internal(format!("database error: {db}"))
                }
            }
            sqlx::Error::Io(io) => ApiError::StorageUnavailable(io.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}
