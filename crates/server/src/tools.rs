use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::auth::{Claims, verify_api_key};
use crate::error::ApiError;
use crate::rpc::ServerContext;
use crate::search::SearchScope;
use crate::sessions::InitialMessage;
use quorum_protocol::types::{AgentType, Permission, SessionId, Visibility};

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ApiError>> + Send + 'a>>;
pub type ToolHandler = for<'a> fn(&'a ServerContext, Option<Claims>, Value) -> HandlerFuture<'a>;

/// One entry in the static tool table: schema, permission requirement, and
/// handler. The dispatcher resolves `auth_token` to claims before invoking
/// any handler with `needs_token`.
pub struct ToolEntry {
    pub name: &'static str,
    pub description: &'static str,
    pub needs_token: bool,
    pub required_permission: Option<Permission>,
    pub schema: fn() -> Value,
    pub handler: ToolHandler,
}

pub fn registry() -> &'static [ToolEntry] {
    &REGISTRY
}

pub fn find_tool(name: &str) -> Option<&'static ToolEntry> {
    REGISTRY.iter().find(|t| t.name == name)
}

static REGISTRY: [ToolEntry; 17] = [
    ToolEntry {
        name: "authenticate_agent",
        description: "Authenticate an agent with the transport api key and receive a protected token",
        needs_token: false,
        required_permission: None,
        schema: schema_authenticate_agent,
        handler: authenticate_agent,
    },
    ToolEntry {
        name: "refresh_token",
        description: "Rotate a protected token; the presented token is revoked",
        needs_token: false,
        required_permission: None,
        schema: schema_refresh_token,
        handler: refresh_token,
    },
    ToolEntry {
        name: "create_session",
        description: "Create a shared-context session, optionally seeding a first message",
        needs_token: true,
        required_permission: Some(Permission::Write),
        schema: schema_create_session,
        handler: create_session,
    },
    ToolEntry {
        name: "get_session",
        description: "Fetch a session with message/participant counts and last activity",
        needs_token: true,
        required_permission: Some(Permission::Read),
        schema: schema_get_session,
        handler: get_session,
    },
    ToolEntry {
        name: "add_message",
        description: "Append a message to an active session",
        needs_token: true,
        required_permission: Some(Permission::Write),
        schema: schema_add_message,
        handler: add_message,
    },
    ToolEntry {
        name: "get_messages",
        description: "List messages visible to the caller, ascending by id",
        needs_token: true,
        required_permission: Some(Permission::Read),
        schema: schema_get_messages,
        handler: get_messages,
    },
    ToolEntry {
        name: "deactivate_session",
        description: "Soft-close a session; it stays readable but accepts no new messages",
        needs_token: true,
        required_permission: Some(Permission::Write),
        schema: schema_deactivate_session,
        handler: deactivate_session,
    },
    ToolEntry {
        name: "search_context",
        description: "Fuzzy search over visible session messages",
        needs_token: true,
        required_permission: Some(Permission::Read),
        schema: schema_search_context,
        handler: search_context,
    },
    ToolEntry {
        name: "search_by_sender",
        description: "Find messages by sender (canonical exact match, fuzzy fallback)",
        needs_token: true,
        required_permission: Some(Permission::Read),
        schema: schema_search_by_sender,
        handler: search_by_sender,
    },
    ToolEntry {
        name: "search_by_timerange",
        description: "List visible messages in a half-open [start, end) time window",
        needs_token: true,
        required_permission: Some(Permission::Read),
        schema: schema_search_by_timerange,
        handler: search_by_timerange,
    },
    ToolEntry {
        name: "set_memory",
        description: "Store a private value, optionally session-scoped and with a TTL",
        needs_token: true,
        required_permission: Some(Permission::Write),
        schema: schema_set_memory,
        handler: set_memory,
    },
    ToolEntry {
        name: "get_memory",
        description: "Fetch one of the caller's memory entries",
        needs_token: true,
        required_permission: Some(Permission::Read),
        schema: schema_get_memory,
        handler: get_memory,
    },
    ToolEntry {
        name: "list_memory",
        description: "List the caller's memory keys in a scope",
        needs_token: true,
        required_permission: Some(Permission::Read),
        schema: schema_list_memory,
        handler: list_memory,
    },
    ToolEntry {
        name: "delete_memory",
        description: "Delete one of the caller's memory entries",
        needs_token: true,
        required_permission: Some(Permission::Write),
        schema: schema_delete_memory,
        handler: delete_memory,
    },
    ToolEntry {
        name: "set_message_visibility",
        description: "Reclassify a message's visibility (admin only, audited)",
        needs_token: true,
        required_permission: Some(Permission::Admin),
        schema: schema_set_message_visibility,
        handler: set_message_visibility,
    },
    ToolEntry {
        name: "get_usage_guidance",
        description: "Describe what the caller's token allows and which tools apply",
        needs_token: true,
        required_permission: None,
        schema: schema_get_usage_guidance,
        handler: get_usage_guidance,
    },
    ToolEntry {
        name: "get_performance_metrics",
        description: "Server performance counters: pool, operations, caches, subscribers, vault",
        needs_token: true,
        required_permission: Some(Permission::Debug),
        schema: schema_get_performance_metrics,
        handler: get_performance_metrics,
    },
];

// --- argument extraction helpers ---

fn require_str<'v>(args: &'v Value, key: &'static str) -> Result<&'v str, ApiError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or(ApiError::InvalidInputFormat {
            field: key,
            expected: "string",
        })
}

fn opt_str<'v>(args: &'v Value, key: &str) -> Option<&'v str> {
    args.get(key).and_then(Value::as_str)
}

fn opt_u64(args: &Value, key: &str) -> Option<u64> {
    args.get(key).and_then(Value::as_u64)
}

fn opt_i64(args: &Value, key: &str) -> Option<i64> {
    args.get(key).and_then(Value::as_i64)
}

fn opt_f64(args: &Value, key: &str) -> Option<f64> {
    args.get(key).and_then(Value::as_f64)
}

fn opt_bool(args: &Value, key: &str) -> Option<bool> {
    args.get(key).and_then(Value::as_bool)
}

fn opt_object(args: &Value, key: &str) -> Option<Value> {
    args.get(key).filter(|v| !v.is_null()).cloned()
}

fn require_session_id(args: &Value) -> Result<SessionId, ApiError> {
    let raw = require_str(args, "session_id")?;
    SessionId::parse(raw).map_err(|_| ApiError::InvalidInputFormat {
        field: "session_id",
        expected: "session_<16 lowercase hex>",
    })
}

fn opt_session_id(args: &Value) -> Result<Option<SessionId>, ApiError> {
    match opt_str(args, "session_id") {
        None => Ok(None),
        Some(raw) => SessionId::parse(raw)
            .map(Some)
            .map_err(|_| ApiError::InvalidInputFormat {
                field: "session_id",
                expected: "session_<16 lowercase hex>",
            }),
    }
}

fn opt_visibility(args: &Value) -> Result<Visibility, ApiError> {
    match opt_str(args, "visibility") {
        None => Ok(Visibility::Public),
        Some(raw) => Visibility::parse(raw).ok_or(ApiError::InvalidInputFormat {
            field: "visibility",
            expected: "public | private | agent_only | admin_only",
        }),
    }
}

fn parse_rfc3339(args: &Value, key: &'static str) -> Result<Option<DateTime<Utc>>, ApiError> {
    match opt_str(args, key) {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| ApiError::InvalidInputFormat {
                field: key,
                expected: "RFC3339 timestamp",
            }),
    }
}

fn require_claims(claims: Option<Claims>) -> Result<Claims, ApiError> {
    claims.ok_or_else(|| ApiError::Internal("handler invoked without claims".to_string()))
}

/// Agent ids are short, filesystem- and log-safe identifiers.
fn is_valid_agent_id(agent_id: &str) -> bool {
    !agent_id.is_empty()
        && agent_id.len() <= 128
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

// --- handlers ---

fn authenticate_agent<'a>(
    ctx: &'a ServerContext,
    _claims: Option<Claims>,
    args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let agent_id = require_str(&args, "agent_id")?;
        if !is_valid_agent_id(agent_id) {
            return Err(ApiError::InvalidInputFormat {
                field: "agent_id",
                expected: "1-128 chars of [A-Za-z0-9_.-]",
            });
        }
        let agent_type = AgentType::parse(opt_str(&args, "agent_type").unwrap_or("generic"));
        let api_key = require_str(&args, "api_key")?;
        let elevated = verify_api_key(&ctx.config.server, api_key)?;

        let requested: Vec<Permission> = match args.get("requested_permissions") {
            None => vec![Permission::Read, Permission::Write],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(Permission::parse)
                .collect(),
            Some(_) => {
                return Err(ApiError::InvalidInputFormat {
                    field: "requested_permissions",
                    expected: "array of permission strings",
                });
            }
        };

        let (token, expires_at, granted) = ctx
            .vault
            .authenticate(agent_id, agent_type, &requested, elevated)
            .await?;
        Ok(json!({
            "success": true,
            "token": token,
            "agent_id": agent_id,
            "agent_type": agent_type,
            "permissions": granted,
            "expires_at": expires_at.to_rfc3339(),
        }))
    })
}

fn refresh_token<'a>(
    ctx: &'a ServerContext,
    _claims: Option<Claims>,
    args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let current = require_str(&args, "current_token")?;
        let (token, expires_at) = ctx.vault.refresh(current).await?;
        Ok(json!({
            "success": true,
            "token": token,
            "expires_at": expires_at.to_rfc3339(),
        }))
    })
}

fn create_session<'a>(
    ctx: &'a ServerContext,
    claims: Option<Claims>,
    args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let claims = require_claims(claims)?;
        let purpose = require_str(&args, "purpose")?;
        let metadata = opt_object(&args, "metadata");
        let initial_message = opt_str(&args, "initial_message").map(|content| InitialMessage {
            content: content.to_string(),
            visibility: Visibility::Public,
        });

        let session = ctx
            .sessions
            .create_session(&claims, purpose, metadata, initial_message)
            .await?;
        Ok(json!({
            "success": true,
            "session_id": session.id,
            "created_at": session.created_at.to_rfc3339(),
        }))
    })
}

fn get_session<'a>(
    ctx: &'a ServerContext,
    claims: Option<Claims>,
    args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let claims = require_claims(claims)?;
        let session_id = require_session_id(&args)?;
        let (session, summary) = ctx.sessions.get_session(&claims, &session_id).await?;
        Ok(json!({ "session": session, "summary": summary }))
    })
}

fn add_message<'a>(
    ctx: &'a ServerContext,
    claims: Option<Claims>,
    args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let claims = require_claims(claims)?;
        let session_id = require_session_id(&args)?;
        let content = require_str(&args, "content")?;
        let visibility = opt_visibility(&args)?;
        let message_type = opt_str(&args, "message_type");
        let metadata = opt_object(&args, "metadata");
        let parent_message_id = opt_i64(&args, "parent_message_id");

        let message = ctx
            .sessions
            .add_message(
                &claims,
                &session_id,
                content,
                visibility,
                message_type,
                metadata,
                parent_message_id,
            )
            .await?;
        Ok(json!({
            "success": true,
            "message_id": message.id,
            "timestamp": message.timestamp.to_rfc3339(),
        }))
    })
}

fn get_messages<'a>(
    ctx: &'a ServerContext,
    claims: Option<Claims>,
    args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let claims = require_claims(claims)?;
        let session_id = require_session_id(&args)?;
        let visibility_filter = match opt_str(&args, "visibility_filter") {
            None => None,
            Some(raw) => Some(Visibility::parse(raw).ok_or(ApiError::InvalidInputFormat {
                field: "visibility_filter",
                expected: "public | private | agent_only | admin_only",
            })?),
        };
        let messages = ctx
            .sessions
            .get_messages(
                &claims,
                &session_id,
                opt_i64(&args, "limit"),
                opt_i64(&args, "offset"),
                visibility_filter,
                opt_i64(&args, "since_id"),
            )
            .await?;
        Ok(json!({ "count": messages.len(), "messages": messages }))
    })
}

fn deactivate_session<'a>(
    ctx: &'a ServerContext,
    claims: Option<Claims>,
    args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let claims = require_claims(claims)?;
        let session_id = require_session_id(&args)?;
        ctx.sessions.deactivate_session(&claims, &session_id).await?;
        Ok(json!({ "success": true }))
    })
}

fn search_context<'a>(
    ctx: &'a ServerContext,
    claims: Option<Claims>,
    args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let claims = require_claims(claims)?;
        let session_id = require_session_id(&args)?;
        let query = require_str(&args, "query")?;
        let threshold = opt_f64(&args, "fuzzy_threshold").unwrap_or(60.0);
        let limit = opt_u64(&args, "limit").unwrap_or(10);
        let scope = match opt_str(&args, "search_scope") {
            None => SearchScope::All,
            Some(raw) => SearchScope::parse(raw).ok_or(ApiError::InvalidInputFormat {
                field: "search_scope",
                expected: "all | sender_and_content",
            })?,
        };

        let results = ctx
            .search
            .search_context(&claims, &session_id, query, threshold, limit, scope)
            .await?;
        Ok(json!({ "count": results.len(), "results": results }))
    })
}

fn search_by_sender<'a>(
    ctx: &'a ServerContext,
    claims: Option<Claims>,
    args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let claims = require_claims(claims)?;
        let session_id = require_session_id(&args)?;
        let sender_query = require_str(&args, "sender_query")?;
        let limit = opt_u64(&args, "limit").unwrap_or(20);

        let results = ctx
            .search
            .search_by_sender(&claims, &session_id, sender_query, limit)
            .await?;
        Ok(json!({ "count": results.len(), "results": results }))
    })
}

fn search_by_timerange<'a>(
    ctx: &'a ServerContext,
    claims: Option<Claims>,
    args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let claims = require_claims(claims)?;
        let session_id = require_session_id(&args)?;
        let start = parse_rfc3339(&args, "start")?.ok_or(ApiError::InvalidInputFormat {
            field: "start",
            expected: "RFC3339 timestamp",
        })?;
        let end = parse_rfc3339(&args, "end")?;
        let limit = opt_u64(&args, "limit").unwrap_or(50);

        let messages = ctx
            .search
            .search_by_timerange(&claims, &session_id, start, end, limit)
            .await?;
        Ok(json!({ "count": messages.len(), "messages": messages }))
    })
}

fn set_memory<'a>(
    ctx: &'a ServerContext,
    claims: Option<Claims>,
    args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let claims = require_claims(claims)?;
        let key = require_str(&args, "key")?;
        let value = args
            .get("value")
            .cloned()
            .ok_or(ApiError::InvalidInputFormat {
                field: "value",
                expected: "any JSON value",
            })?;
        let session_id = opt_session_id(&args)?;
        let ttl_seconds = opt_u64(&args, "ttl_seconds");
        let metadata = opt_object(&args, "metadata");

        ctx.memory
            .set(
                &claims,
                key,
                value,
                session_id.as_ref(),
                ttl_seconds,
                metadata,
            )
            .await?;
        Ok(json!({ "success": true, "key": key }))
    })
}

fn get_memory<'a>(
    ctx: &'a ServerContext,
    claims: Option<Claims>,
    args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let claims = require_claims(claims)?;
        let key = require_str(&args, "key")?;
        let session_id = opt_session_id(&args)?;
        let fallback = opt_bool(&args, "fallback").unwrap_or(false);

        let entry = ctx
            .memory
            .get(&claims, key, session_id.as_ref(), fallback)
            .await?;
        match entry {
            Some(entry) => Ok(json!({ "found": true, "entry": entry })),
            None => Ok(json!({ "found": false })),
        }
    })
}

fn list_memory<'a>(
    ctx: &'a ServerContext,
    claims: Option<Claims>,
    args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let claims = require_claims(claims)?;
        let session_id = opt_session_id(&args)?;
        let entries = ctx
            .memory
            .list(
                &claims,
                session_id.as_ref(),
                opt_str(&args, "prefix"),
                opt_i64(&args, "limit"),
                opt_i64(&args, "offset"),
            )
            .await?;
        Ok(json!({ "count": entries.len(), "entries": entries }))
    })
}

fn delete_memory<'a>(
    ctx: &'a ServerContext,
    claims: Option<Claims>,
    args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let claims = require_claims(claims)?;
        let key = require_str(&args, "key")?;
        let session_id = opt_session_id(&args)?;
        let deleted = ctx.memory.delete(&claims, key, session_id.as_ref()).await?;
        Ok(json!({ "success": true, "deleted": deleted }))
    })
}

fn set_message_visibility<'a>(
    ctx: &'a ServerContext,
    claims: Option<Claims>,
    args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let claims = require_claims(claims)?;
        let message_id = opt_i64(&args, "message_id").ok_or(ApiError::InvalidInputFormat {
            field: "message_id",
            expected: "integer message id",
        })?;
        let visibility = match opt_str(&args, "visibility") {
            Some(raw) => Visibility::parse(raw).ok_or(ApiError::InvalidInputFormat {
                field: "visibility",
                expected: "public | private | agent_only | admin_only",
            })?,
            None => {
                return Err(ApiError::InvalidInputFormat {
                    field: "visibility",
                    expected: "public | private | agent_only | admin_only",
                });
            }
        };
        ctx.sessions
            .set_message_visibility(&claims, message_id, visibility)
            .await?;
        Ok(json!({ "success": true }))
    })
}

fn get_usage_guidance<'a>(
    _ctx: &'a ServerContext,
    claims: Option<Claims>,
    _args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let claims = require_claims(claims)?;

        let mut operations = Vec::new();
        let mut tools: Vec<&str> = Vec::new();
        if claims.can(Permission::Read) {
            operations.push("read sessions, messages, search results, and your own memory");
            tools.extend([
                "get_session",
                "get_messages",
                "search_context",
                "search_by_sender",
                "search_by_timerange",
                "get_memory",
                "list_memory",
            ]);
        }
        if claims.can(Permission::Write) {
            operations.push("create sessions, post messages, and write memory");
            tools.extend([
                "create_session",
                "add_message",
                "deactivate_session",
                "set_memory",
                "delete_memory",
            ]);
        }
        if claims.can(Permission::Admin) {
            operations.push("reclassify message visibility and close any session");
            tools.push("set_message_visibility");
        }
        if claims.can(Permission::Debug) {
            operations.push("inspect server performance metrics");
            tools.push("get_performance_metrics");
        }
        tools.extend(["refresh_token", "get_usage_guidance"]);

        Ok(json!({
            "agent_id": claims.agent_id,
            "agent_type": claims.agent_type,
            "permissions": claims.permissions,
            "token_expires_at": crate::storage::ms_to_datetime(claims.exp * 1000).to_rfc3339(),
            "allowed_operations": operations,
            "available_tools": tools,
        }))
    })
}

fn get_performance_metrics<'a>(
    ctx: &'a ServerContext,
    claims: Option<Claims>,
    _args: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let _claims = require_claims(claims)?;
        let (subscribers, subscribed_sessions) = ctx.bus.counts();
        let vault = ctx.vault.snapshot().await;
        Ok(json!({
            "uptime_secs": ctx.started_at.elapsed().as_secs(),
            "connection_pool": ctx.storage.pool_snapshot(),
            "operations": ctx.metrics.operations_json(),
            "caches": ctx.metrics.caches_json(),
            "subscribers": {
                "total": subscribers,
                "sessions": subscribed_sessions,
                "dropped_lagging": ctx.bus.dropped_lagging(),
            },
            "token_vault": vault,
        }))
    })
}

// --- input schemas ---

fn obj_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": true,
    })
}

fn auth_token_prop() -> Value {
    json!({ "type": "string", "description": "Protected token from authenticate_agent (sct_...)" })
}

fn session_id_prop() -> Value {
    json!({ "type": "string", "pattern": "^session_[a-f0-9]{16}$" })
}

fn schema_authenticate_agent() -> Value {
    obj_schema(
        json!({
            "agent_id": { "type": "string", "maxLength": 128 },
            "agent_type": { "type": "string", "enum": ["claude", "admin", "system", "generic"] },
            "api_key": { "type": "string" },
            "requested_permissions": {
                "type": "array",
                "items": { "type": "string", "enum": ["read", "write", "admin", "debug"] }
            },
        }),
        &["agent_id", "agent_type", "api_key"],
    )
}

fn schema_refresh_token() -> Value {
    obj_schema(
        json!({ "current_token": { "type": "string", "pattern": "^sct_[A-Za-z0-9_-]+_\\d{10}$" } }),
        &["current_token"],
    )
}

fn schema_create_session() -> Value {
    obj_schema(
        json!({
            "auth_token": auth_token_prop(),
            "purpose": { "type": "string", "maxLength": 500 },
            "metadata": { "type": "object" },
            "initial_message": { "type": "string" },
        }),
        &["auth_token", "purpose"],
    )
}

fn schema_get_session() -> Value {
    obj_schema(
        json!({ "auth_token": auth_token_prop(), "session_id": session_id_prop() }),
        &["auth_token", "session_id"],
    )
}

fn schema_add_message() -> Value {
    obj_schema(
        json!({
            "auth_token": auth_token_prop(),
            "session_id": session_id_prop(),
            "content": { "type": "string", "maxLength": 10000 },
            "visibility": { "type": "string", "enum": ["public", "private", "agent_only", "admin_only"] },
            "message_type": { "type": "string" },
            "metadata": { "type": "object" },
            "parent_message_id": { "type": "integer" },
        }),
        &["auth_token", "session_id", "content"],
    )
}

fn schema_get_messages() -> Value {
    obj_schema(
        json!({
            "auth_token": auth_token_prop(),
            "session_id": session_id_prop(),
            "limit": { "type": "integer", "default": 50 },
            "offset": { "type": "integer", "default": 0 },
            "visibility_filter": { "type": "string", "enum": ["public", "private", "agent_only", "admin_only"] },
            "since_id": { "type": "integer" },
        }),
        &["auth_token", "session_id"],
    )
}

fn schema_deactivate_session() -> Value {
    obj_schema(
        json!({ "auth_token": auth_token_prop(), "session_id": session_id_prop() }),
        &["auth_token", "session_id"],
    )
}

fn schema_search_context() -> Value {
    obj_schema(
        json!({
            "auth_token": auth_token_prop(),
            "session_id": session_id_prop(),
            "query": { "type": "string", "minLength": 3 },
            "fuzzy_threshold": { "type": "number", "default": 60.0, "minimum": 0, "maximum": 100 },
            "limit": { "type": "integer", "default": 10, "maximum": 100 },
            "search_scope": { "type": "string", "enum": ["all", "sender_and_content"], "default": "all" },
        }),
        &["auth_token", "session_id", "query"],
    )
}

fn schema_search_by_sender() -> Value {
    obj_schema(
        json!({
            "auth_token": auth_token_prop(),
            "session_id": session_id_prop(),
            "sender_query": { "type": "string" },
            "limit": { "type": "integer", "default": 20, "maximum": 100 },
        }),
        &["auth_token", "session_id", "sender_query"],
    )
}

fn schema_search_by_timerange() -> Value {
    obj_schema(
        json!({
            "auth_token": auth_token_prop(),
            "session_id": session_id_prop(),
            "start": { "type": "string", "format": "date-time" },
            "end": { "type": "string", "format": "date-time" },
            "limit": { "type": "integer", "default": 50, "maximum": 100 },
        }),
        &["auth_token", "session_id", "start"],
    )
}

fn schema_set_memory() -> Value {
    obj_schema(
        json!({
            "auth_token": auth_token_prop(),
            "key": { "type": "string", "pattern": "^[A-Za-z0-9][A-Za-z0-9_\\-\\.]{0,127}$" },
            "value": { "description": "Any JSON value, at most 1 MiB serialized" },
            "session_id": session_id_prop(),
            "ttl_seconds": { "type": "integer", "minimum": 1 },
            "metadata": { "type": "object" },
        }),
        &["auth_token", "key", "value"],
    )
}

fn schema_get_memory() -> Value {
    obj_schema(
        json!({
            "auth_token": auth_token_prop(),
            "key": { "type": "string" },
            "session_id": session_id_prop(),
            "fallback": { "type": "boolean", "default": false,
                          "description": "Fall back to the global scope on a session-scoped miss" },
        }),
        &["auth_token", "key"],
    )
}

fn schema_list_memory() -> Value {
    obj_schema(
        json!({
            "auth_token": auth_token_prop(),
            "session_id": session_id_prop(),
            "prefix": { "type": "string" },
            "limit": { "type": "integer", "default": 100 },
            "offset": { "type": "integer", "default": 0 },
        }),
        &["auth_token"],
    )
}

fn schema_delete_memory() -> Value {
    obj_schema(
        json!({
            "auth_token": auth_token_prop(),
            "key": { "type": "string" },
            "session_id": session_id_prop(),
        }),
        &["auth_token", "key"],
    )
}

fn schema_set_message_visibility() -> Value {
    obj_schema(
        json!({
            "auth_token": auth_token_prop(),
            "message_id": { "type": "integer" },
            "visibility": { "type": "string", "enum": ["public", "private", "agent_only", "admin_only"] },
        }),
        &["auth_token", "message_id", "visibility"],
    )
}

fn schema_get_usage_guidance() -> Value {
    obj_schema(json!({ "auth_token": auth_token_prop() }), &["auth_token"])
}

fn schema_get_performance_metrics() -> Value {
    obj_schema(json!({ "auth_token": auth_token_prop() }), &["auth_token"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_contains_the_required_tool_set() {
        let expected = [
            "authenticate_agent",
            "refresh_token",
            "create_session",
            "get_session",
            "add_message",
            "get_messages",
            "deactivate_session",
            "search_context",
            "search_by_sender",
            "search_by_timerange",
            "set_memory",
            "get_memory",
            "list_memory",
            "delete_memory",
            "set_message_visibility",
            "get_usage_guidance",
            "get_performance_metrics",
        ];
        for name in expected {
            assert!(find_tool(name).is_some(), "missing tool {name}");
        }
        assert_eq!(registry().len(), expected.len());
    }

    #[test]
    fn auth_tools_do_not_need_a_token() {
        assert!(!find_tool("authenticate_agent").unwrap().needs_token);
        assert!(!find_tool("refresh_token").unwrap().needs_token);
        for entry in registry() {
            if entry.name != "authenticate_agent" && entry.name != "refresh_token" {
                assert!(entry.needs_token, "{} should require a token", entry.name);
            }
        }
    }

    #[test]
    fn permission_table_matches_the_contract() {
        assert_eq!(
            find_tool("get_messages").unwrap().required_permission,
            Some(Permission::Read)
        );
        assert_eq!(
            find_tool("add_message").unwrap().required_permission,
            Some(Permission::Write)
        );
        assert_eq!(
            find_tool("set_memory").unwrap().required_permission,
            Some(Permission::Write)
        );
        assert_eq!(
            find_tool("set_message_visibility").unwrap().required_permission,
            Some(Permission::Admin)
        );
        assert_eq!(
            find_tool("get_performance_metrics").unwrap().required_permission,
            Some(Permission::Debug)
        );
    }

    #[test]
    fn schemas_are_wellformed_objects() {
        for entry in registry() {
            let schema = (entry.schema)();
            assert_eq!(schema["type"], "object", "{} schema", entry.name);
            assert!(schema["properties"].is_object(), "{} schema", entry.name);
            if entry.needs_token {
                assert!(
                    schema["properties"].get("auth_token").is_some(),
                    "{} schema must document auth_token",
                    entry.name
                );
            }
        }
    }

    #[test]
    fn agent_id_validation_mirrors_username_rules() {
        assert!(is_valid_agent_id("claude-main"));
        assert!(is_valid_agent_id("agent.007"));
        assert!(!is_valid_agent_id(""));
        assert!(!is_valid_agent_id("has space"));
        assert!(!is_valid_agent_id(&"x".repeat(129)));
        assert!(!is_valid_agent_id("nul\0"));
    }
}
