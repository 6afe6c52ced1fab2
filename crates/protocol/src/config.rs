use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Which transport carries MCP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP bind address
    #[serde(default = "default_host")]
    pub http_host: String,
    /// HTTP port
    #[serde(default = "default_port")]
    pub http_port: u16,
    /// MCP transport: "stdio" or "http"
    #[serde(default = "default_transport")]
    pub transport: Transport,
    /// Transport-level shared secret presented by MCP clients
    pub api_key: Option<String>,
    /// Separate secret gating elevation to admin/debug permissions
    pub admin_api_key: Option<String>,
    /// Header carrying the api key on the HTTP transport
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    /// Require the api key on HTTP requests (disable only for local dev)
    #[serde(default = "default_true")]
    pub require_api_key: bool,
    /// Signs JWTs; at least 32 bytes
    pub jwt_secret_key: Option<String>,
    /// Seals JWTs at rest; at least 32 bytes
    pub jwt_encryption_key: Option<String>,
    /// Overall per-request deadline in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path or URL of the SQLite database
    #[serde(default = "default_db_url")]
    pub url: String,
    #[serde(default = "default_pool_min")]
    pub pool_min_size: u32,
    #[serde(default = "default_pool_max")]
    pub pool_max_size: u32,
    /// Pool acquire timeout in seconds
    #[serde(default = "default_conn_timeout")]
    pub connection_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Lifetime of a freshly minted protected token
    #[serde(default = "default_token_ttl")]
    pub default_ttl_secs: u64,
    /// Window before expiry in which validation auto-renews
    #[serde(default = "default_renewal_window")]
    pub renewal_window_secs: u64,
    /// How far an auto-renewal pushes the expiry out
    #[serde(default = "default_renewal_extension")]
    pub renewal_extension_secs: u64,
    /// How long deactivated rows are kept for audit before cleanup
    #[serde(default = "default_token_retention")]
    pub retention_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries in the search token cache
    #[serde(default = "default_l1_size")]
    pub l1_size: usize,
    /// Entries in the schema/metadata cache
    #[serde(default = "default_l2_size")]
    pub l2_size: usize,
    /// Cache entry TTL in seconds
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Soft per-agent memory quota in bytes (serialized values)
    #[serde(default = "default_memory_quota")]
    pub memory_quota_bytes: u64,
    /// Maximum message content length after sanitization
    #[serde(default = "default_message_max_chars")]
    pub message_max_chars: usize,
    /// Outbound event queue depth per subscriber
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue_size: usize,
    /// How long an overflowing subscriber may stay lagging before it is dropped
    #[serde(default = "default_lagging_grace")]
    pub lagging_grace_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8710
}
fn default_transport() -> Transport {
    Transport::Http
}
fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}
fn default_true() -> bool {
    true
}
fn default_request_timeout() -> u64 {
    30
}
fn default_db_url() -> String {
    "quorum.db".to_string()
}
fn default_pool_min() -> u32 {
    5
}
fn default_pool_max() -> u32 {
    50
}
fn default_conn_timeout() -> u64 {
    30
}
fn default_token_ttl() -> u64 {
    1800
}
fn default_renewal_window() -> u64 {
    300
}
fn default_renewal_extension() -> u64 {
    600
}
fn default_token_retention() -> u64 {
    7 * 24 * 3600
}
fn default_l1_size() -> usize {
    128
}
fn default_l2_size() -> usize {
    1024
}
fn default_cache_ttl() -> u64 {
    300
}
fn default_memory_quota() -> u64 {
    100 * 1024 * 1024
}
fn default_message_max_chars() -> usize {
    10_000
}
fn default_subscriber_queue() -> usize {
    256
}
fn default_lagging_grace() -> u64 {
    2
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_host: default_host(),
            http_port: default_port(),
            transport: default_transport(),
            api_key: None,
            admin_api_key: None,
            api_key_header: default_api_key_header(),
            require_api_key: true,
            jwt_secret_key: None,
            jwt_encryption_key: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            pool_min_size: default_pool_min(),
            pool_max_size: default_pool_max(),
            connection_timeout_secs: default_conn_timeout(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_token_ttl(),
            renewal_window_secs: default_renewal_window(),
            renewal_extension_secs: default_renewal_extension(),
            retention_secs: default_token_retention(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_size: default_l1_size(),
            l2_size: default_l2_size(),
            default_ttl_secs: default_cache_ttl(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory_quota_bytes: default_memory_quota(),
            message_max_chars: default_message_max_chars(),
            subscriber_queue_size: default_subscriber_queue(),
            lagging_grace_secs: default_lagging_grace(),
        }
    }
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            tokens: TokenConfig::default(),
            cache: CacheConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl QuorumConfig {
    /// Overlay recognized environment variables onto this configuration.
    /// `lookup` abstracts `std::env::var` so tests can inject values.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = lookup("DATABASE_POOL_MIN_SIZE").and_then(|v| v.parse().ok()) {
            self.database.pool_min_size = v;
        }
        if let Some(v) = lookup("DATABASE_POOL_MAX_SIZE").and_then(|v| v.parse().ok()) {
            self.database.pool_max_size = v;
        }
        if let Some(v) = lookup("CONNECTION_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
            self.database.connection_timeout_secs = v;
        }
        if let Some(v) = lookup("API_KEY") {
            self.server.api_key = Some(v);
        }
        if let Some(v) = lookup("ADMIN_API_KEY") {
            self.server.admin_api_key = Some(v);
        }
        if let Some(v) = lookup("JWT_SECRET_KEY") {
            self.server.jwt_secret_key = Some(v);
        }
        if let Some(v) = lookup("JWT_ENCRYPTION_KEY") {
            self.server.jwt_encryption_key = Some(v);
        }
        if let Some(v) = lookup("HTTP_HOST") {
            self.server.http_host = v;
        }
        if let Some(v) = lookup("HTTP_PORT").and_then(|v| v.parse().ok()) {
            self.server.http_port = v;
        }
        if let Some(v) = lookup("MCP_TRANSPORT") {
            match v.as_str() {
                "stdio" => self.server.transport = Transport::Stdio,
                "http" => self.server.transport = Transport::Http,
                // Unrecognized values keep the configured transport;
                // validate() still checks the resulting config.
                _ => {}
            }
        }
        if let Some(v) = lookup("CACHE_L1_SIZE").and_then(|v| v.parse().ok()) {
            self.cache.l1_size = v;
        }
        if let Some(v) = lookup("CACHE_L2_SIZE").and_then(|v| v.parse().ok()) {
            self.cache.l2_size = v;
        }
        if let Some(v) = lookup("CACHE_DEFAULT_TTL_SECONDS").and_then(|v| v.parse().ok()) {
            self.cache.default_ttl_secs = v;
        }
        if let Some(v) = lookup("TOKEN_DEFAULT_TTL_SECONDS").and_then(|v| v.parse().ok()) {
            self.tokens.default_ttl_secs = v;
        }
        if let Some(v) = lookup("TOKEN_RENEWAL_WINDOW_SECONDS").and_then(|v| v.parse().ok()) {
            self.tokens.renewal_window_secs = v;
        }
        if let Some(v) = lookup("TOKEN_RENEWAL_EXTENSION_SECONDS").and_then(|v| v.parse().ok()) {
            self.tokens.renewal_extension_secs = v;
        }
        if let Some(v) = lookup("MEMORY_QUOTA_BYTES").and_then(|v| v.parse().ok()) {
            self.limits.memory_quota_bytes = v;
        }
        if let Some(v) = lookup("MESSAGE_MAX_CHARS").and_then(|v| v.parse().ok()) {
            self.limits.message_max_chars = v;
        }
    }

    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    ///
    /// Returns `Ok(())` if no issues, or `Err(issues)` with all found problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        match &self.server.jwt_secret_key {
            None => issues.push(
                "ERROR: jwt_secret_key is not set. Generate one with: \
                 openssl rand -hex 32"
                    .to_string(),
            ),
            Some(k) if k.len() < 32 => issues.push(format!(
                "ERROR: jwt_secret_key is {} bytes; at least 32 are required",
                k.len()
            )),
            Some(_) => {}
        }

        match &self.server.jwt_encryption_key {
            None => issues.push(
                "ERROR: jwt_encryption_key is not set. Generate one with: \
                 openssl rand -hex 32"
                    .to_string(),
            ),
            Some(k) if k.len() < 32 => issues.push(format!(
                "ERROR: jwt_encryption_key is {} bytes; at least 32 are required",
                k.len()
            )),
            Some(_) => {}
        }

        if self.server.require_api_key && self.server.api_key.is_none() {
            issues.push(
                "ERROR: api_key is not set but require_api_key is enabled. \
                 Set API_KEY or disable require_api_key for local development."
                    .to_string(),
            );
        }

        if let (Some(api), Some(admin)) = (&self.server.api_key, &self.server.admin_api_key) {
            if api == admin {
                issues.push(
                    "WARNING: admin_api_key equals api_key; every client can \
                     elevate to admin. Use distinct secrets."
                        .to_string(),
                );
            }
        }

        if self.database.pool_max_size == 0 {
            issues.push("ERROR: database pool_max_size must be at least 1".to_string());
        }
        if self.database.pool_min_size > self.database.pool_max_size {
            issues.push(format!(
                "ERROR: pool_min_size ({}) exceeds pool_max_size ({})",
                self.database.pool_min_size, self.database.pool_max_size
            ));
        }

        if self.server.transport == Transport::Http && self.server.http_port == 0 {
            issues.push("ERROR: http_port 0 is not valid for the http transport".to_string());
        }

        if self.tokens.renewal_window_secs >= self.tokens.default_ttl_secs {
            issues.push(format!(
                "WARNING: token renewal window ({}s) is not smaller than the \
                 token ttl ({}s); every validation will renew",
                self.tokens.renewal_window_secs, self.tokens.default_ttl_secs
            ));
        }

        if self.limits.message_max_chars == 0 {
            issues.push("ERROR: message_max_chars must be at least 1".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_config() -> QuorumConfig {
        let mut cfg = QuorumConfig::default();
        cfg.server.api_key = Some("k".repeat(16));
        cfg.server.jwt_secret_key = Some("s".repeat(32));
        cfg.server.jwt_encryption_key = Some("e".repeat(32));
        cfg
    }

    #[test]
    fn defaults_from_empty_toml() {
        let cfg: QuorumConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.server.http_host, "127.0.0.1");
        assert_eq!(cfg.server.http_port, 8710);
        assert_eq!(cfg.server.transport, Transport::Http);
        assert_eq!(cfg.server.api_key_header, "X-API-Key");
        assert_eq!(cfg.database.pool_min_size, 5);
        assert_eq!(cfg.database.pool_max_size, 50);
        assert_eq!(cfg.tokens.default_ttl_secs, 1800);
        assert_eq!(cfg.tokens.renewal_window_secs, 300);
        assert_eq!(cfg.tokens.renewal_extension_secs, 600);
        assert_eq!(cfg.limits.memory_quota_bytes, 100 * 1024 * 1024);
        assert_eq!(cfg.limits.message_max_chars, 10_000);
        assert_eq!(cfg.limits.subscriber_queue_size, 256);
        assert_eq!(cfg.limits.lagging_grace_secs, 2);
    }

    #[test]
    fn toml_sections_parse() {
        let cfg: QuorumConfig = toml::from_str(
            r#"
            [server]
            http_port = 9000
            transport = "stdio"

            [database]
            url = "/var/lib/quorum/quorum.db"
            pool_max_size = 10
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.http_port, 9000);
        assert_eq!(cfg.server.transport, Transport::Stdio);
        assert_eq!(cfg.database.url, "/var/lib/quorum/quorum.db");
        assert_eq!(cfg.database.pool_max_size, 10);
    }

    #[test]
    fn env_overrides_take_effect() {
        let mut env = HashMap::new();
        env.insert("DATABASE_URL", "env.db");
        env.insert("DATABASE_POOL_MAX_SIZE", "12");
        env.insert("MCP_TRANSPORT", "stdio");
        env.insert("TOKEN_DEFAULT_TTL_SECONDS", "900");
        env.insert("MESSAGE_MAX_CHARS", "5000");
        env.insert("API_KEY", "transport-secret");

        let mut cfg = QuorumConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.database.url, "env.db");
        assert_eq!(cfg.database.pool_max_size, 12);
        assert_eq!(cfg.server.transport, Transport::Stdio);
        assert_eq!(cfg.tokens.default_ttl_secs, 900);
        assert_eq!(cfg.limits.message_max_chars, 5000);
        assert_eq!(cfg.server.api_key.as_deref(), Some("transport-secret"));
    }

    #[test]
    fn env_ignores_unparseable_numbers() {
        let mut cfg = QuorumConfig::default();
        cfg.apply_env(|k| (k == "HTTP_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(cfg.server.http_port, 8710);
    }

    #[test]
    fn validate_accepts_complete_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_requires_secrets() {
        let cfg = QuorumConfig::default();
        let issues = cfg.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("jwt_secret_key")));
        assert!(issues.iter().any(|i| i.contains("jwt_encryption_key")));
        assert!(issues.iter().any(|i| i.contains("api_key")));
        assert!(issues.iter().all(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn validate_rejects_short_secret() {
        let mut cfg = valid_config();
        cfg.server.jwt_secret_key = Some("short".into());
        let issues = cfg.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("at least 32")));
    }

    #[test]
    fn validate_flags_shared_admin_key() {
        let mut cfg = valid_config();
        cfg.server.admin_api_key = cfg.server.api_key.clone();
        let issues = cfg.validate().unwrap_err();
        assert!(
            issues
                .iter()
                .any(|i| i.starts_with("WARNING:") && i.contains("admin_api_key"))
        );
    }

    #[test]
    fn validate_checks_pool_bounds() {
        let mut cfg = valid_config();
        cfg.database.pool_min_size = 20;
        cfg.database.pool_max_size = 10;
        let issues = cfg.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("pool_min_size")));
    }
}
