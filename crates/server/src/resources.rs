use serde_json::{Value, json};

use crate::auth::Claims;
use crate::error::ApiError;
use crate::rpc::ServerContext;
use crate::sessions::escape_html;
use crate::tools;
use quorum_protocol::types::{Permission, SessionId};

/// Concrete resources a client can read without knowing any ids.
pub fn list_resources() -> Value {
    json!({
        "resources": [
            {
                "uri": "server://info/about",
                "name": "Server info",
                "description": "Server identity and capability counts",
                "mimeType": "application/json",
            },
            {
                "uri": "docs://tools/catalog",
                "name": "Tool catalog",
                "description": "Every tool with its input schema and required permission",
                "mimeType": "application/json",
            },
        ]
    })
}

/// URI templates for id-addressed reads.
pub fn list_templates() -> Value {
    json!({
        "resourceTemplates": [
            {
                "uriTemplate": "session://{session_id}",
                "name": "Session view",
                "description": "Live session state with summary and recent messages (subscribable)",
                "mimeType": "application/json",
            },
            {
                "uriTemplate": "session://{session_id}/messages/{limit}",
                "name": "Session messages",
                "description": "Paginated message log, visibility applied",
                "mimeType": "application/json",
            },
            {
                "uriTemplate": "agent://{agent_id}/memory",
                "name": "Agent memory",
                "description": "The authenticated agent's own memory listing",
                "mimeType": "application/json",
            },
            {
                "uriTemplate": "server://info/{section}",
                "name": "Server info",
                "mimeType": "application/json",
            },
            {
                "uriTemplate": "docs://tools/{tool}",
                "name": "Tool documentation",
                "mimeType": "application/json",
            },
        ]
    })
}

/// Resolve a resource URI to its JSON body. `server://info` is the only
/// scheme readable without a token.
pub async fn read_resource(
    ctx: &ServerContext,
    claims: Option<&Claims>,
    uri: &str,
) -> Result<Value, ApiError> {
    if let Some(rest) = uri.strip_prefix("server://info/") {
        return Ok(server_info(ctx, rest));
    }
    if uri == "server://info" {
        return Ok(server_info(ctx, "about"));
    }

    // Everything below requires an authenticated caller.
    let claims = claims.ok_or(ApiError::PermissionDenied {
        missing: Permission::Read,
    })?;

    if let Some(rest) = uri.strip_prefix("docs://tools/") {
        return tool_docs(rest);
    }
    if let Some(rest) = uri.strip_prefix("agent://") {
        if let Some(agent_id) = rest.strip_suffix("/memory") {
            return agent_memory(ctx, claims, agent_id).await;
        }
    }
    if let Some(rest) = uri.strip_prefix("session://") {
        return match rest.split_once('/') {
            None => session_view(ctx, claims, rest).await,
            Some((id, tail)) => {
                let limit = tail
                    .strip_prefix("messages/")
                    .and_then(|l| l.parse::<i64>().ok())
                    .ok_or_else(|| invalid_uri(uri))?;
                session_messages(ctx, claims, id, limit).await
            }
        };
    }

    Err(invalid_uri(uri))
}

fn invalid_uri(uri: &str) -> ApiError {
    ApiError::InvalidInput(format!("unknown resource uri: {uri}"))
}

fn server_info(ctx: &ServerContext, _section: &str) -> Value {
    json!({
        "name": "quorum-server",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "capabilities": {
            "tools": tools::registry().len(),
            "resources": list_resources()["resources"].as_array().map(Vec::len).unwrap_or(0),
            "resource_templates": list_templates()["resourceTemplates"]
                .as_array()
                .map(Vec::len)
                .unwrap_or(0),
            "prompts": 2,
        },
    })
}

fn tool_docs(selector: &str) -> Result<Value, ApiError> {
    let entries: Vec<Value> = tools::registry()
        .iter()
        .filter(|t| selector == "catalog" || selector == "all" || t.name == selector)
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "required_permission": t.required_permission.map(|p| p.as_str()),
                "input_schema": (t.schema)(),
            })
        })
        .collect();
    if entries.is_empty() {
        return Err(ApiError::InvalidInput(format!(
            "no tool named {selector:?}"
        )));
    }
    Ok(json!({ "tools": entries }))
}

async fn agent_memory(
    ctx: &ServerContext,
    claims: &Claims,
    agent_id: &str,
) -> Result<Value, ApiError> {
    // Strictly self-scoped: even admins read only their own memory here.
    if claims.agent_id != agent_id {
        return Err(ApiError::PermissionDenied {
            missing: Permission::Read,
        });
    }
    let entries = ctx.memory.list(claims, None, None, None, None).await?;
    Ok(json!({
        "agent_id": agent_id,
        "count": entries.len(),
        "entries": entries,
    }))
}

async fn session_view(
    ctx: &ServerContext,
    claims: &Claims,
    raw_id: &str,
) -> Result<Value, ApiError> {
    let session_id = parse_session_uri_id(raw_id)?;
    let (session, summary) = ctx.sessions.get_session(claims, &session_id).await?;
    let recent = ctx
        .sessions
        .get_messages(claims, &session_id, Some(50), None, None, None)
        .await?;
    Ok(json!({
        "session": session,
        "summary": summary,
        "recent_messages": render_for_dashboard(recent),
    }))
}

async fn session_messages(
    ctx: &ServerContext,
    claims: &Claims,
    raw_id: &str,
    limit: i64,
) -> Result<Value, ApiError> {
    let session_id = parse_session_uri_id(raw_id)?;
    let messages = ctx
        .sessions
        .get_messages(claims, &session_id, Some(limit), None, None, None)
        .await?;
    Ok(json!({
        "session_id": session_id,
        "count": messages.len(),
        "messages": render_for_dashboard(messages),
    }))
}

fn parse_session_uri_id(raw: &str) -> Result<SessionId, ApiError> {
    SessionId::parse(raw).map_err(|_| ApiError::InvalidInputFormat {
        field: "session_id",
        expected: "session_<16 lowercase hex>",
    })
}

/// Resource views feed the dashboard; message content is HTML-escaped here
/// and only here.
fn render_for_dashboard(messages: Vec<quorum_protocol::types::Message>) -> Vec<Value> {
    messages
        .into_iter()
        .map(|m| {
            json!({
                "id": m.id,
                "sender": m.sender,
                "sender_type": m.sender_type,
                "content": escape_html(&m.content),
                "visibility": m.visibility,
                "message_type": m.message_type,
                "timestamp": m.timestamp.to_rfc3339(),
                "parent_message_id": m.parent_message_id,
            })
        })
        .collect()
}
