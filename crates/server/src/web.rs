use axum::Router;
use axum::body::Body;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use tokio::time::{Duration, Instant, interval};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;

use crate::auth::{Claims, verify_api_key};
use crate::bus::Subscription;
use crate::rpc::{self, SharedContext};
use quorum_protocol::envelope::{self, RpcError, RpcRequest, RpcResponse};
use quorum_protocol::events::{ClientHello, SessionEvent};
use quorum_protocol::types::SessionId;

/// Interval between WebSocket ping frames.
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum time to wait for a pong response before considering the
/// connection dead. This allows 3 missed pings.
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(90);

/// Upper bound on `since_id` replay after a reconnect.
const WS_REPLAY_LIMIT: i64 = 100;

/// Request bodies are bounded above the 1 MiB memory-value ceiling with
/// room for the envelope around it.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Build the Axum router with all routes.
pub fn build_router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/mcp", post(mcp_endpoint))
        .route("/mcp/", post(mcp_endpoint))
        .merge(feed_routes())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// The dashboard data feed alone: WebSocket push and the health probe.
/// This is what stays bound on HTTP while MCP itself runs over stdio.
pub fn build_feed_router(ctx: SharedContext) -> Router {
    feed_routes()
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

fn feed_routes() -> Router<SharedContext> {
    Router::new()
        .route("/ws/{session_id}", get(ws_upgrade))
        .route("/health", get(health))
}

#[derive(Deserialize)]
struct McpQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Transport-level api key gate. `/health` stays open; everything else
/// requires the configured header when auth is enabled.
fn check_api_key(ctx: &SharedContext, headers: &HeaderMap) -> Result<(), Response> {
    let cfg = &ctx.config.server;
    if !cfg.require_api_key {
        return Ok(());
    }
    let presented = headers
        .get(cfg.api_key_header.as_str())
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    match verify_api_key(cfg, presented) {
        Ok(_) => Ok(()),
        Err(_) => {
            tracing::warn!(header = %cfg.api_key_header, "Rejected request with bad api key");
            Err((
                StatusCode::UNAUTHORIZED,
                axum::Json(json!({ "error": "invalid or missing api key" })),
            )
                .into_response())
        }
    }
}

/// POST /mcp/ - the MCP endpoint. Returns plain JSON, or a single-event
/// SSE rendering when the client asks for `text/event-stream`.
async fn mcp_endpoint(
    State(ctx): State<SharedContext>,
    Query(query): Query<McpQuery>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(denied) = check_api_key(&ctx, &headers) {
        return denied;
    }
    if let Some(scope) = &query.session_id {
        tracing::debug!(session_id = %scope, "MCP request scoped to session");
    }

    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => {
            let resp = RpcResponse::failure(
                serde_json::Value::Null,
                RpcError {
                    code: envelope::PARSE_ERROR,
                    message: format!("invalid JSON: {e}"),
                    data: None,
                },
            );
            return axum::Json(resp).into_response();
        }
    };

    match rpc::dispatch(&ctx, request).await {
        None => StatusCode::ACCEPTED.into_response(),
        Some(resp) => {
            let wants_stream = headers
                .get(header::ACCEPT)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|accept| accept.contains("text/event-stream"));
            if wants_stream {
                sse_response(&resp)
            } else {
                axum::Json(resp).into_response()
            }
        }
    }
}

/// Render one response as a minimal SSE stream that closes immediately.
fn sse_response(resp: &RpcResponse) -> Response {
    let payload = serde_json::to_string(resp).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(format!("event: message\ndata: {payload}\n\n")))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// GET /health - unauthenticated probe for load balancers.
async fn health(State(ctx): State<SharedContext>) -> Response {
    let (db_ok, migrations) = ctx.storage.health().await;
    let status = if db_ok { "ok" } else { "error" };
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        axum::Json(json!({
            "status": status,
            "db": if db_ok { "connected" } else { "disconnected" },
            "migrations": migrations.to_string(),
        })),
    )
        .into_response()
}

/// GET /ws/{session_id} - WebSocket push feed. Requires the api key (when
/// enabled) plus a valid protected token in the Authorization header or
/// `?token=` query parameter.
async fn ws_upgrade(
    State(ctx): State<SharedContext>,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(denied) = check_api_key(&ctx, &headers) {
        return denied;
    }

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(query.token.as_deref());
    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "Missing token").into_response();
    };
    let claims = match ctx.vault.validate(token).await {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!("WebSocket token rejected: {e}");
            return (StatusCode::UNAUTHORIZED, "Invalid or expired token").into_response();
        }
    };

    let Ok(session_id) = SessionId::parse(&session_id) else {
        return (StatusCode::BAD_REQUEST, "Invalid session id").into_response();
    };
    if ctx.sessions.get_session(&claims, &session_id).await.is_err() {
        return (StatusCode::NOT_FOUND, "Session not found").into_response();
    }

    tracing::info!(%session_id, agent_id = %claims.agent_id, "WebSocket upgrade");
    let subscription = ctx.bus.subscribe(session_id.clone(), claims.viewer());
    ws.max_message_size(65_536)
        .on_upgrade(move |socket| handle_ws(socket, ctx, claims, session_id, subscription))
}

/// Pump events to one WebSocket subscriber. The subscription unregisters
/// itself on drop, so every exit path detaches promptly.
async fn handle_ws(
    mut socket: WebSocket,
    ctx: SharedContext,
    claims: Claims,
    session_id: SessionId,
    mut subscription: Subscription,
) {
    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await; // consume the immediate first tick
    let mut last_pong = Instant::now();

    tracing::info!(%session_id, "WebSocket connected");

    loop {
        tokio::select! {
            // Send periodic WebSocket ping frames
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    tracing::debug!(%session_id, "WebSocket ping timeout, closing");
                    break;
                }
                if socket.send(WsMessage::Ping(vec![].into())).await.is_err() {
                    tracing::debug!(%session_id, "WebSocket ping send failed");
                    break;
                }
            }
            // Forward bus events
            event = subscription.rx.recv() => {
                let Some(event) = event else {
                    tracing::debug!(%session_id, "Subscription closed (lagging or shutdown)");
                    break;
                };
                let json = match serde_json::to_string(&event) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize event: {e}");
                        continue;
                    }
                };
                if socket.send(WsMessage::Text(json.into())).await.is_err() {
                    tracing::debug!(%session_id, "WebSocket send failed");
                    break;
                }
            }
            // Receive client frames
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientHello>(&text) {
                            Ok(hello) if hello.op == "hello" => {
                                if replay_missed(&mut socket, &ctx, &claims, &session_id, hello.since_id)
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            _ => {
                                tracing::debug!(%session_id, "Ignoring unrecognized client frame");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        tracing::info!(%session_id, "WebSocket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(%session_id, "WebSocket error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::info!(%session_id, "WebSocket disconnected");
}

/// Replay messages missed while disconnected, bounded to the most recent
/// `WS_REPLAY_LIMIT`, as ordinary `message_added` events.
async fn replay_missed(
    socket: &mut WebSocket,
    ctx: &SharedContext,
    claims: &Claims,
    session_id: &SessionId,
    since_id: Option<i64>,
) -> Result<(), ()> {
    let messages = match ctx
        .sessions
        .get_messages(claims, session_id, Some(WS_REPLAY_LIMIT), None, None, since_id)
        .await
    {
        Ok(messages) => messages,
        Err(e) => {
            tracing::warn!(%session_id, "Replay failed: {e}");
            return Ok(());
        }
    };

    tracing::debug!(%session_id, count = messages.len(), "Replaying missed messages");
    for message in messages {
        let event = SessionEvent::MessageAdded {
            id: message.id,
            sender: message.sender.clone(),
            visibility: message.visibility,
            timestamp: message.timestamp,
        };
        let json = serde_json::to_string(&event).map_err(|_| ())?;
        if socket.send(WsMessage::Text(json.into())).await.is_err() {
            return Err(());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::test_support::{authenticate, call_ok, test_context};
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read response body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("response body is not valid JSON")
    }

    fn mcp_request(api_key: Option<&str>, payload: &Value) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder()
            .method("POST")
            .uri("/mcp/")
            .header("content-type", "application/json");
        if let Some(key) = api_key {
            builder = builder.header("x-api-key", key);
        }
        builder
            .body(Body::from(serde_json::to_vec(payload).unwrap()))
            .unwrap()
    }

    fn rpc_payload(method: &str, params: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params })
    }

    #[tokio::test]
    async fn health_is_open_and_reports_migrations() {
        let ctx = test_context().await;
        let app = build_router(ctx);

        let request = axum::http::Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["db"], "connected");
        assert_eq!(json["migrations"], "2");
    }

    #[tokio::test]
    async fn mcp_requires_the_api_key() {
        let ctx = test_context().await;
        let app = build_router(ctx);

        let payload = rpc_payload("tools/list", json!({}));
        let response = app
            .clone()
            .oneshot(mcp_request(None, &payload))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(mcp_request(Some("transport-key"), &payload))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json["result"]["tools"].is_array());
    }

    #[tokio::test]
    async fn malformed_json_yields_parse_error_envelope() {
        let ctx = test_context().await;
        let app = build_router(ctx);

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/mcp/")
            .header("content-type", "application/json")
            .header("x-api-key", "transport-key")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], envelope::PARSE_ERROR);
        assert!(json["id"].is_null());
    }

    #[tokio::test]
    async fn full_flow_over_http() {
        let ctx = test_context().await;
        let app = build_router(Arc::clone(&ctx));

        // authenticate
        let auth = rpc_payload(
            "tools/call",
            json!({
                "name": "authenticate_agent",
                "arguments": {
                    "agent_id": "claude-main",
                    "agent_type": "claude",
                    "api_key": "transport-key",
                    "requested_permissions": ["read", "write"],
                },
            }),
        );
        let response = app
            .clone()
            .oneshot(mcp_request(Some("transport-key"), &auth))
            .await
            .unwrap();
        let token = body_json(response).await["result"]["structuredContent"]["token"]
            .as_str()
            .unwrap()
            .to_string();

        // create a session
        let create = rpc_payload(
            "tools/call",
            json!({
                "name": "create_session",
                "arguments": { "auth_token": token, "purpose": "http e2e" },
            }),
        );
        let response = app
            .clone()
            .oneshot(mcp_request(Some("transport-key"), &create))
            .await
            .unwrap();
        let session_id = body_json(response).await["result"]["structuredContent"]["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        // post and fetch a message
        let add = rpc_payload(
            "tools/call",
            json!({
                "name": "add_message",
                "arguments": {
                    "auth_token": token,
                    "session_id": session_id,
                    "content": "over http",
                },
            }),
        );
        let response = app
            .clone()
            .oneshot(mcp_request(Some("transport-key"), &add))
            .await
            .unwrap();
        assert_eq!(
            body_json(response).await["result"]["structuredContent"]["message_id"],
            1
        );

        let list = rpc_payload(
            "tools/call",
            json!({
                "name": "get_messages",
                "arguments": { "auth_token": token, "session_id": session_id },
            }),
        );
        let response = app
            .oneshot(mcp_request(Some("transport-key"), &list))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["result"]["structuredContent"]["count"], 1);
        assert_eq!(
            json["result"]["structuredContent"]["messages"][0]["content"],
            "over http"
        );
    }

    #[tokio::test]
    async fn sse_rendering_when_requested() {
        let ctx = test_context().await;
        let app = build_router(ctx);

        let payload = rpc_payload("ping", json!({}));
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/mcp/")
            .header("content-type", "application/json")
            .header("x-api-key", "transport-key")
            .header("accept", "text/event-stream")
            .body(Body::from(serde_json::to_vec(&payload).unwrap()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some("text/event-stream")
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("event: message\ndata: "));
        assert!(text.trim_end().ends_with("}"));
    }

    #[tokio::test]
    async fn notifications_are_accepted_without_body() {
        let ctx = test_context().await;
        let app = build_router(ctx);

        let payload = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
        let response = app
            .oneshot(mcp_request(Some("transport-key"), &payload))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn feed_router_serves_health_but_not_mcp() {
        let ctx = test_context().await;
        let app = build_feed_router(ctx);

        let request = axum::http::Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let payload = rpc_payload("ping", json!({}));
        let response = app.oneshot(mcp_request(Some("transport-key"), &payload)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ws_route_rejects_missing_token() {
        let ctx = test_context().await;
        let token = authenticate(&ctx, "claude-main", &["read", "write"]).await;
        let created = call_ok(
            &ctx,
            "create_session",
            json!({ "auth_token": token, "purpose": "ws test" }),
        )
        .await;
        let session_id = created["session_id"].as_str().unwrap().to_string();
        let app = build_router(ctx);

        // A plain GET (no upgrade headers, no token) must not reach the
        // subscriber path; the exact status depends on extractor order but
        // it is always a client error.
        let request = axum::http::Request::builder()
            .uri(format!("/ws/{session_id}"))
            .header("x-api-key", "transport-key")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
    }
}
