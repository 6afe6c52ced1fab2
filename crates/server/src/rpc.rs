use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::auth::{Claims, TokenVault, has_permission};
use crate::bus::NotificationBus;
use crate::error::ApiError;
use crate::memory::MemoryStore;
use crate::metrics::Metrics;
use crate::resources;
use crate::search::SearchEngine;
use crate::sessions::SessionStore;
use crate::storage::Storage;
use crate::tools::{self, ToolEntry};
use quorum_protocol::config::QuorumConfig;
use quorum_protocol::envelope::{
    self, RpcError, RpcRequest, RpcResponse,
};
use quorum_protocol::types::SessionId;

/// MCP protocol revision this server speaks.
const PROTOCOL_VERSION: &str = "2025-06-18";

/// Process-wide state handed by reference into every handler. Initialized
/// once at startup; teardown happens in main in the reverse order:
/// transports, subscribers, bus, vault, pool.
pub struct ServerContext {
    pub config: QuorumConfig,
    pub storage: Arc<Storage>,
    pub vault: Arc<TokenVault>,
    pub sessions: SessionStore,
    pub memory: MemoryStore,
    pub search: SearchEngine,
    pub bus: NotificationBus,
    pub metrics: Arc<Metrics>,
    pub started_at: Instant,
}

pub type SharedContext = Arc<ServerContext>;

impl ServerContext {
    /// Assemble the context around open storage.
    pub fn with_storage(
        config: QuorumConfig,
        storage: Arc<Storage>,
    ) -> Result<SharedContext, ApiError> {
        let bus = NotificationBus::new(
            config.limits.subscriber_queue_size,
            Duration::from_secs(config.limits.lagging_grace_secs),
        );
        let vault = Arc::new(TokenVault::new(
            &config.server,
            config.tokens.clone(),
            Arc::clone(&storage),
        )?);
        let sessions = SessionStore::new(Arc::clone(&storage), bus.clone(), config.limits.clone());
        let memory = MemoryStore::new(Arc::clone(&storage), config.limits.clone());
        let search = SearchEngine::new(Arc::clone(&storage), &config.cache);
        let metrics = Metrics::new();
        metrics.register_cache("search_docs", search.cache_stats());

        Ok(Arc::new(Self {
            config,
            storage,
            vault,
            sessions,
            memory,
            search,
            bus,
            metrics,
            started_at: Instant::now(),
        }))
    }
}

/// Dispatch one MCP request. Returns `None` for notifications (requests
/// without an id), which per JSON-RPC receive no response.
pub async fn dispatch(ctx: &ServerContext, req: RpcRequest) -> Option<RpcResponse> {
    let Some(id) = req.id.clone() else {
        tracing::debug!(method = %req.method, "Ignoring notification");
        return None;
    };

    if !req.is_well_formed() {
        return Some(RpcResponse::failure(
            id,
            RpcError {
                code: envelope::INVALID_REQUEST,
                message: "malformed JSON-RPC envelope".to_string(),
                data: None,
            },
        ));
    }

    let params = req.params.unwrap_or_else(|| json!({}));
    let result = handle_method(ctx, &req.method, params).await;

    Some(match result {
        Ok(value) => RpcResponse::success(id, value),
        Err(err) => {
            tracing::debug!(method = %req.method, code = err.code(), "Request failed: {err}");
            RpcResponse::failure(
                id,
                RpcError {
                    code: err.rpc_code(),
                    message: err.to_string(),
                    data: Some(err.envelope()),
                },
            )
        }
    })
}

async fn handle_method(
    ctx: &ServerContext,
    method: &str,
    params: Value,
) -> Result<Value, ApiError> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": "quorum-server",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "subscribe": true, "listChanged": false },
                "prompts": { "listChanged": false },
            },
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({
            "tools": tools::registry()
                .iter()
                .map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": (t.schema)(),
                }))
                .collect::<Vec<_>>(),
        })),
        "tools/call" => {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or(ApiError::InvalidInputFormat {
                    field: "name",
                    expected: "tool name string",
                })?
                .to_string();
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            call_tool(ctx, &name, arguments).await
        }
        "resources/list" => Ok(resources::list_resources()),
        "resources/templates/list" => Ok(resources::list_templates()),
        "resources/read" => {
            let uri = params
                .get("uri")
                .and_then(Value::as_str)
                .ok_or(ApiError::InvalidInputFormat {
                    field: "uri",
                    expected: "resource uri string",
                })?;
            let claims = match params.get("auth_token").and_then(Value::as_str) {
                Some(token) => Some(ctx.vault.validate(token).await?),
                None => None,
            };
            let body = resources::read_resource(ctx, claims.as_ref(), uri).await?;
            Ok(json!({
                "contents": [{
                    "uri": uri,
                    "mimeType": "application/json",
                    "text": body.to_string(),
                }]
            }))
        }
        "resources/subscribe" => {
            // Event delivery rides the WebSocket feed; this validates the
            // target and acknowledges so MCP clients can track intent.
            let uri = params
                .get("uri")
                .and_then(Value::as_str)
                .ok_or(ApiError::InvalidInputFormat {
                    field: "uri",
                    expected: "session://{session_id}",
                })?;
            let raw_id = uri
                .strip_prefix("session://")
                .ok_or(ApiError::InvalidInput(format!(
                    "only session:// resources are subscribable, got {uri}"
                )))?;
            let session_id =
                SessionId::parse(raw_id).map_err(|_| ApiError::InvalidInputFormat {
                    field: "uri",
                    expected: "session://session_<16 lowercase hex>",
                })?;
            tracing::debug!(%session_id, "resources/subscribe acknowledged");
            Ok(json!({}))
        }
        "prompts/list" => Ok(prompts_list()),
        "prompts/get" => {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or(ApiError::InvalidInputFormat {
                    field: "name",
                    expected: "prompt name string",
                })?;
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            prompts_get(name, &arguments)
        }
        other => Err(ApiError::InvalidInput(format!("unknown method: {other}"))),
    }
}

/// Resolve auth, check the per-tool permission, run the handler under the
/// request deadline, and record latency.
async fn call_tool(ctx: &ServerContext, name: &str, arguments: Value) -> Result<Value, ApiError> {
    let entry: &ToolEntry = tools::find_tool(name)
        .ok_or_else(|| ApiError::InvalidInput(format!("unknown tool: {name}")))?;

    let claims: Option<Claims> = if entry.needs_token {
        let token = arguments
            .get("auth_token")
            .and_then(Value::as_str)
            .ok_or(ApiError::InvalidInputFormat {
                field: "auth_token",
                expected: "protected token (sct_...)",
            })?;
        let claims = ctx.vault.validate(token).await?;
        if let Some(required) = entry.required_permission {
            if !has_permission(&claims, required) {
                return Err(ApiError::PermissionDenied { missing: required });
            }
        }
        Some(claims)
    } else {
        None
    };

    let started = Instant::now();
    let deadline = Duration::from_secs(ctx.config.server.request_timeout_secs);
    let result = tokio::time::timeout(deadline, (entry.handler)(ctx, claims, arguments))
        .await
        .map_err(|_| ApiError::RequestTimeout)?;
    ctx.metrics.record(entry.name, started.elapsed());

    let value = result?;
    Ok(json!({
        "content": [{ "type": "text", "text": value.to_string() }],
        "structuredContent": value,
        "isError": false,
    }))
}

fn prompts_list() -> Value {
    json!({
        "prompts": [
            {
                "name": "setup-collaboration",
                "description": "Walk through standing up a shared session for a group of agents",
                "arguments": [
                    { "name": "purpose", "description": "What the session is for", "required": true },
                    { "name": "agent_types", "description": "Comma-separated agent types joining", "required": false },
                    { "name": "project_name", "description": "Project to mention in the kickoff message", "required": false },
                ],
            },
            {
                "name": "debug-session",
                "description": "Inspect a session that is not behaving as expected",
                "arguments": [
                    { "name": "session_id", "description": "The session to inspect", "required": true },
                ],
            },
        ]
    })
}

fn prompts_get(name: &str, arguments: &Value) -> Result<Value, ApiError> {
    let text = match name {
        "setup-collaboration" => {
            let purpose = arguments
                .get("purpose")
                .and_then(Value::as_str)
                .ok_or(ApiError::InvalidInputFormat {
                    field: "purpose",
                    expected: "non-empty string",
                })?;
            let agent_types = arguments
                .get("agent_types")
                .and_then(Value::as_str)
                .unwrap_or("claude");
            let project = arguments
                .get("project_name")
                .and_then(Value::as_str)
                .map(|p| format!(" for project {p}"))
                .unwrap_or_default();
            format!(
                "Set up a shared collaboration session{project}.\n\n\
                 1. Call authenticate_agent with your agent_id, agent_type (one of: {agent_types}), \
                 the transport api_key, and requested_permissions [\"read\", \"write\"].\n\
                 2. Call create_session with purpose: {purpose:?} and an initial_message \
                 introducing yourself.\n\
                 3. Share the returned session_id with the other agents; they join by calling \
                 add_message on it.\n\
                 4. Use visibility \"private\" for notes to yourself and \"agent_only\" for \
                 coordination your own agent type should see.\n\
                 5. Poll with get_messages since_id or subscribe to /ws/{{session_id}} for \
                 real-time updates."
            )
        }
        "debug-session" => {
            let session_id = arguments
                .get("session_id")
                .and_then(Value::as_str)
                .ok_or(ApiError::InvalidInputFormat {
                    field: "session_id",
                    expected: "session_<16 lowercase hex>",
                })?;
            format!(
                "Debug session {session_id}.\n\n\
                 1. Call get_session to confirm it exists, whether it is still active, and when \
                 it last saw activity.\n\
                 2. Call get_messages with a generous limit and compare the count to the summary; \
                 remember that private/agent_only/admin_only messages are filtered by your \
                 visibility.\n\
                 3. Use search_by_timerange around the time things went quiet.\n\
                 4. If you hold the debug permission, call get_performance_metrics and check the \
                 subscriber and pool counters."
            )
        }
        other => {
            return Err(ApiError::InvalidInput(format!("unknown prompt: {other}")));
        }
    };

    Ok(json!({
        "description": format!("{name} prompt"),
        "messages": [
            { "role": "user", "content": { "type": "text", "text": text } }
        ],
    }))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use quorum_protocol::config::DatabaseConfig;

    pub fn test_config() -> QuorumConfig {
        let mut cfg = QuorumConfig::default();
        cfg.server.api_key = Some("transport-key".to_string());
        cfg.server.admin_api_key = Some("admin-transport-key".to_string());
        cfg.server.jwt_secret_key = Some("jwt-signing-secret-of-32-bytes!!".to_string());
        cfg.server.jwt_encryption_key = Some("jwt-sealing-secret-of-32-bytes!!".to_string());
        cfg.database = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            pool_min_size: 1,
            pool_max_size: 1,
            connection_timeout_secs: 5,
        };
        cfg
    }

    pub async fn test_context() -> SharedContext {
        let config = test_config();
        let storage = Arc::new(
            crate::storage::Storage::connect(&config.database)
                .await
                .expect("in-memory storage"),
        );
        ServerContext::with_storage(config, storage).expect("test context")
    }

    pub async fn rpc(ctx: &ServerContext, method: &str, params: Value) -> RpcResponse {
        let req = RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(1)),
            method: method.to_string(),
            params: Some(params),
        };
        dispatch(ctx, req).await.expect("request with id gets a response")
    }

    /// Call a tool and unwrap its structured result, panicking on error.
    pub async fn call_ok(ctx: &ServerContext, tool: &str, arguments: Value) -> Value {
        let resp = rpc(ctx, "tools/call", json!({ "name": tool, "arguments": arguments })).await;
        assert!(
            resp.error.is_none(),
            "tool {tool} failed: {:?}",
            resp.error
        );
        resp.result.unwrap()["structuredContent"].clone()
    }

    /// Call a tool expecting failure; returns the error envelope code.
    pub async fn call_err(ctx: &ServerContext, tool: &str, arguments: Value) -> String {
        let resp = rpc(ctx, "tools/call", json!({ "name": tool, "arguments": arguments })).await;
        let err = resp.error.expect("expected an error");
        err.data.expect("expected an error envelope").code
    }

    pub async fn authenticate(ctx: &ServerContext, agent_id: &str, perms: &[&str]) -> String {
        let result = call_ok(
            ctx,
            "authenticate_agent",
            json!({
                "agent_id": agent_id,
                "agent_type": "claude",
                "api_key": "transport-key",
                "requested_permissions": perms,
            }),
        )
        .await;
        result["token"].as_str().unwrap().to_string()
    }

    pub async fn authenticate_admin(ctx: &ServerContext, agent_id: &str) -> String {
        let result = call_ok(
            ctx,
            "authenticate_agent",
            json!({
                "agent_id": agent_id,
                "agent_type": "admin",
                "api_key": "admin-transport-key",
                "requested_permissions": ["admin", "debug"],
            }),
        )
        .await;
        result["token"].as_str().unwrap().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn discovery_methods_need_no_token() {
        let ctx = test_context().await;

        let init = rpc(&ctx, "initialize", json!({})).await;
        let result = init.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "quorum-server");

        let ping = rpc(&ctx, "ping", json!({})).await;
        assert!(ping.error.is_none());

        let tools_list = rpc(&ctx, "tools/list", json!({})).await;
        let tools = tools_list.result.unwrap();
        assert_eq!(
            tools["tools"].as_array().unwrap().len(),
            tools::registry().len()
        );

        let prompts = rpc(&ctx, "prompts/list", json!({})).await;
        assert_eq!(prompts.result.unwrap()["prompts"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let ctx = test_context().await;
        let req = RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: "notifications/initialized".to_string(),
            params: None,
        };
        assert!(dispatch(&ctx, req).await.is_none());
    }

    #[tokio::test]
    async fn auth_session_message_flow() {
        let ctx = test_context().await;
        let token = authenticate(&ctx, "claude-main", &["read", "write"]).await;
        assert!(token.starts_with("sct_"));

        let created = call_ok(
            &ctx,
            "create_session",
            json!({ "auth_token": token, "purpose": "planning" }),
        )
        .await;
        let session_id = created["session_id"].as_str().unwrap().to_string();
        assert!(SessionId::parse(&session_id).is_ok());

        let added = call_ok(
            &ctx,
            "add_message",
            json!({
                "auth_token": token,
                "session_id": session_id,
                "content": "hi",
                "visibility": "public",
            }),
        )
        .await;
        assert_eq!(added["message_id"], 1);

        let fetched = call_ok(
            &ctx,
            "get_messages",
            json!({ "auth_token": token, "session_id": session_id, "limit": 10 }),
        )
        .await;
        assert_eq!(fetched["count"], 1);
        let msg = &fetched["messages"][0];
        assert_eq!(msg["id"], 1);
        assert_eq!(msg["sender"], "claude-main");
        assert_eq!(msg["content"], "hi");
        assert_eq!(msg["visibility"], "public");
    }

    #[tokio::test]
    async fn missing_token_is_reported_with_format_error() {
        let ctx = test_context().await;
        let code = call_err(&ctx, "get_messages", json!({ "session_id": "session_0000000000000000" })).await;
        assert_eq!(code, "INVALID_INPUT_FORMAT");
    }

    #[tokio::test]
    async fn permission_table_is_enforced() {
        let ctx = test_context().await;
        let reader = authenticate(&ctx, "observer", &["read"]).await;

        let code = call_err(
            &ctx,
            "create_session",
            json!({ "auth_token": reader, "purpose": "nope" }),
        )
        .await;
        assert_eq!(code, "PERMISSION_DENIED");

        // read tools still work
        let writer = authenticate(&ctx, "writer", &["read", "write"]).await;
        let created = call_ok(
            &ctx,
            "create_session",
            json!({ "auth_token": writer, "purpose": "allowed" }),
        )
        .await;
        let session_id = created["session_id"].as_str().unwrap();
        let fetched = call_ok(
            &ctx,
            "get_session",
            json!({ "auth_token": reader, "session_id": session_id }),
        )
        .await;
        assert_eq!(fetched["session"]["purpose"], "allowed");
    }

    #[tokio::test]
    async fn metrics_require_debug_permission() {
        let ctx = test_context().await;
        let plain = authenticate(&ctx, "plain", &["read", "write"]).await;
        let code = call_err(&ctx, "get_performance_metrics", json!({ "auth_token": plain })).await;
        assert_eq!(code, "PERMISSION_DENIED");

        let admin = authenticate_admin(&ctx, "ops").await;
        let metrics = call_ok(&ctx, "get_performance_metrics", json!({ "auth_token": admin })).await;
        assert!(metrics["connection_pool"]["size"].is_number());
        assert!(metrics["token_vault"]["active_tokens"].is_number());
        assert!(metrics["operations"].is_object());
    }

    #[tokio::test]
    async fn error_envelope_carries_taxonomy_fields() {
        let ctx = test_context().await;
        let token = authenticate(&ctx, "claude-main", &["read", "write"]).await;

        let resp = rpc(
            &ctx,
            "tools/call",
            json!({
                "name": "get_session",
                "arguments": { "auth_token": token, "session_id": "session_00000000000000aa" },
            }),
        )
        .await;
        let err = resp.error.unwrap();
        let env = err.data.unwrap();
        assert_eq!(env.code, "SESSION_NOT_FOUND");
        assert!(!env.success);
        assert!(env.recoverable);
    }

    #[tokio::test]
    async fn refresh_token_flow_through_dispatch() {
        let ctx = test_context().await;
        let t1 = authenticate(&ctx, "claude-main", &["read", "write"]).await;

        let refreshed = call_ok(&ctx, "refresh_token", json!({ "current_token": t1 })).await;
        let t2 = refreshed["token"].as_str().unwrap().to_string();
        assert_ne!(t1, t2);

        // old token is revoked
        let code = call_err(
            &ctx,
            "get_usage_guidance",
            json!({ "auth_token": t1 }),
        )
        .await;
        assert_eq!(code, "TOKEN_REVOKED");

        // the new one works
        let guidance = call_ok(&ctx, "get_usage_guidance", json!({ "auth_token": t2 })).await;
        assert_eq!(guidance["agent_id"], "claude-main");
    }

    #[tokio::test]
    async fn usage_guidance_reflects_permissions() {
        let ctx = test_context().await;
        let reader = authenticate(&ctx, "observer", &["read"]).await;
        let guidance = call_ok(&ctx, "get_usage_guidance", json!({ "auth_token": reader })).await;

        let tools: Vec<&str> = guidance["available_tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(tools.contains(&"get_messages"));
        assert!(!tools.contains(&"add_message"));
        assert!(!tools.contains(&"set_message_visibility"));
    }

    #[tokio::test]
    async fn unknown_tool_and_method_are_rejected() {
        let ctx = test_context().await;
        let resp = rpc(&ctx, "tools/call", json!({ "name": "no_such_tool", "arguments": {} })).await;
        assert!(resp.error.is_some());

        let resp = rpc(&ctx, "bogus/method", json!({})).await;
        assert!(resp.error.is_some());
    }

    #[tokio::test]
    async fn server_info_resource_needs_no_token() {
        let ctx = test_context().await;
        let resp = rpc(&ctx, "resources/read", json!({ "uri": "server://info/about" })).await;
        let contents = resp.result.unwrap();
        let text = contents["contents"][0]["text"].as_str().unwrap();
        let body: Value = serde_json::from_str(text).unwrap();
        assert_eq!(body["name"], "quorum-server");
        assert!(body["capabilities"]["tools"].as_u64().unwrap() > 10);
    }

    #[tokio::test]
    async fn session_resource_requires_token_and_escapes_html() {
        let ctx = test_context().await;
        let token = authenticate(&ctx, "claude-main", &["read", "write"]).await;
        let created = call_ok(
            &ctx,
            "create_session",
            json!({
                "auth_token": token,
                "purpose": "dashboard feed",
                "initial_message": "<script>alert('x')</script>",
            }),
        )
        .await;
        let session_id = created["session_id"].as_str().unwrap();
        let uri = format!("session://{session_id}");

        // without a token the read is denied
        let resp = rpc(&ctx, "resources/read", json!({ "uri": uri })).await;
        assert!(resp.error.is_some());

        let resp = rpc(
            &ctx,
            "resources/read",
            json!({ "uri": uri, "auth_token": token }),
        )
        .await;
        let text = resp.result.unwrap()["contents"][0]["text"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(text.contains("&lt;script&gt;"));
        assert!(!text.contains("<script>"));
    }

    #[tokio::test]
    async fn agent_memory_resource_is_self_scoped() {
        let ctx = test_context().await;
        let alice = authenticate(&ctx, "alice", &["read", "write"]).await;
        call_ok(
            &ctx,
            "set_memory",
            json!({ "auth_token": alice, "key": "plan", "value": { "step": 1 } }),
        )
        .await;

        let own = rpc(
            &ctx,
            "resources/read",
            json!({ "uri": "agent://alice/memory", "auth_token": alice }),
        )
        .await;
        let text = own.result.unwrap()["contents"][0]["text"].as_str().unwrap().to_string();
        assert!(text.contains("plan"));

        let other = rpc(
            &ctx,
            "resources/read",
            json!({ "uri": "agent://bob/memory", "auth_token": alice }),
        )
        .await;
        let env = other.error.unwrap().data.unwrap();
        assert_eq!(env.code, "PERMISSION_DENIED");
    }

    #[tokio::test]
    async fn prompts_render_with_arguments() {
        let ctx = test_context().await;
        let resp = rpc(
            &ctx,
            "prompts/get",
            json!({
                "name": "setup-collaboration",
                "arguments": { "purpose": "ship the release", "project_name": "quorum" },
            }),
        )
        .await;
        let result = resp.result.unwrap();
        let text = result["messages"][0]["content"]["text"].as_str().unwrap();
        assert!(text.contains("ship the release"));
        assert!(text.contains("project quorum"));
        assert!(text.contains("authenticate_agent"));

        let resp = rpc(&ctx, "prompts/get", json!({ "name": "nope", "arguments": {} })).await;
        assert!(resp.error.is_some());
    }

    #[tokio::test]
    async fn resources_subscribe_validates_the_uri() {
        let ctx = test_context().await;
        let ok = rpc(
            &ctx,
            "resources/subscribe",
            json!({ "uri": "session://session_0123456789abcdef" }),
        )
        .await;
        assert!(ok.error.is_none());

        let bad = rpc(&ctx, "resources/subscribe", json!({ "uri": "docs://tools/catalog" })).await;
        assert!(bad.error.is_some());
    }
}
