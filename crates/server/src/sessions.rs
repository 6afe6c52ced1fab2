use std::sync::Arc;

use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::Value;

use crate::auth::Claims;
use crate::bus::{MessageNotice, NotificationBus};
use crate::error::ApiError;
use crate::storage::{Storage, ms_to_datetime, now_ms};
use quorum_protocol::config::LimitsConfig;
use quorum_protocol::types::{
    AgentType, DEFAULT_MESSAGE_TYPE, Message, Session, SessionId, SessionSummary, Visibility,
    canonical_sender,
};

/// Purpose length ceiling after trimming.
const MAX_PURPOSE_CHARS: usize = 500;
/// Serialized metadata ceiling for sessions, messages, and memory entries.
pub const MAX_METADATA_BYTES: usize = 4096;
/// get_messages page size ceiling.
const MAX_PAGE_SIZE: i64 = 1000;

/// Session lifecycle and the append-only message log, with the visibility
/// matrix enforced on every read.
pub struct SessionStore {
    storage: Arc<Storage>,
    bus: NotificationBus,
    limits: LimitsConfig,
}

/// Optional first message inserted in the same transaction as its session.
pub struct InitialMessage {
    pub content: String,
    pub visibility: Visibility,
}

impl SessionStore {
    pub fn new(storage: Arc<Storage>, bus: NotificationBus, limits: LimitsConfig) -> Self {
        Self {
            storage,
            bus,
            limits,
        }
    }

    /// Create a session, optionally seeding it with a first message.
    pub async fn create_session(
        &self,
        claims: &Claims,
        purpose: &str,
        metadata: Option<Value>,
        initial_message: Option<InitialMessage>,
    ) -> Result<Session, ApiError> {
        let purpose = purpose.trim();
        if purpose.is_empty() {
            return Err(ApiError::InvalidInput(
                "purpose must not be empty".to_string(),
            ));
        }
        if purpose.chars().count() > MAX_PURPOSE_CHARS {
            return Err(ApiError::InvalidInput(format!(
                "purpose exceeds {MAX_PURPOSE_CHARS} characters"
            )));
        }
        let metadata_json = validate_metadata(metadata)?.unwrap_or_else(|| "{}".to_string());

        let id = generate_session_id();
        let now = now_ms();

        let mut wtx = self.storage.begin_write().await?;
        sqlx::query(
            "INSERT INTO sessions (id, purpose, created_at, updated_at, is_active, created_by, metadata) \
             VALUES (?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(id.as_str())
        .bind(purpose)
        .bind(now)
        .bind(now)
        .bind(&claims.agent_id)
        .bind(&metadata_json)
        .execute(&mut *wtx.tx)
        .await?;

        if let Some(initial) = initial_message {
            if initial.visibility == Visibility::AdminOnly && !claims.is_admin() {
                return Err(ApiError::VisibilityPermissionDenied);
            }
            let content = sanitize_content(&initial.content, self.limits.message_max_chars)?;
            insert_message(
                &mut wtx.tx,
                &id,
                claims,
                &content,
                initial.visibility,
                DEFAULT_MESSAGE_TYPE,
                None,
                None,
                now,
            )
            .await?;
        }
        wtx.commit().await?;

        tracing::info!(
            target: "audit",
            event = "session_created",
            session_id = %id,
            created_by = %claims.agent_id,
            "Session created"
        );

        Ok(Session {
            id,
            purpose: purpose.to_string(),
            created_by: claims.agent_id.clone(),
            created_at: ms_to_datetime(now),
            updated_at: ms_to_datetime(now),
            is_active: true,
            metadata: serde_json::from_str(&metadata_json).unwrap_or(Value::Null),
        })
    }

    /// Fetch a session plus its aggregate summary.
    pub async fn get_session(
        &self,
        _claims: &Claims,
        id: &SessionId,
    ) -> Result<(Session, SessionSummary), ApiError> {
        let mut conn = self.storage.acquire_read().await?;

        let row: Option<(String, String, i64, i64, i64, String, String)> = sqlx::query_as(
            "SELECT id, purpose, created_at, updated_at, is_active, created_by, metadata \
             FROM sessions WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
        let Some(row) = row else {
            return Err(ApiError::SessionNotFound(id.to_string()));
        };

        let (message_count, participant_count, last_activity): (i64, i64, Option<i64>) =
            sqlx::query_as(
                "SELECT COUNT(*), COUNT(DISTINCT sender), MAX(timestamp) \
                 FROM messages WHERE session_id = ?",
            )
            .bind(id.as_str())
            .fetch_one(&mut *conn)
            .await?;

        Ok((
            row_to_session(row),
            SessionSummary {
                message_count,
                participant_count,
                last_activity: last_activity.map(ms_to_datetime),
            },
        ))
    }

    /// Append a message to an active session. Publishes `message_added` to
    /// the notification bus only after the transaction commits.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_message(
        &self,
        claims: &Claims,
        session_id: &SessionId,
        content: &str,
        visibility: Visibility,
        message_type: Option<&str>,
        metadata: Option<Value>,
        parent_message_id: Option<i64>,
    ) -> Result<Message, ApiError> {
        if visibility == Visibility::AdminOnly && !claims.is_admin() {
            return Err(ApiError::VisibilityPermissionDenied);
        }
        let content = sanitize_content(content, self.limits.message_max_chars)?;
        let metadata_json = validate_metadata(metadata)?;
        let message_type = match message_type {
            Some(t) if !t.trim().is_empty() => t.trim().to_string(),
            _ => DEFAULT_MESSAGE_TYPE.to_string(),
        };

        let mut wtx = self.storage.begin_write().await?;

        let session: Option<(i64,)> =
            sqlx::query_as("SELECT is_active FROM sessions WHERE id = ?")
                .bind(session_id.as_str())
                .fetch_optional(&mut *wtx.tx)
                .await?;
        match session {
            None => return Err(ApiError::SessionNotFound(session_id.to_string())),
            Some((0,)) => return Err(ApiError::SessionInactive(session_id.to_string())),
            Some(_) => {}
        }

        if let Some(parent_id) = parent_message_id {
            let parent: Option<(String,)> =
                sqlx::query_as("SELECT session_id FROM messages WHERE id = ?")
                    .bind(parent_id)
                    .fetch_optional(&mut *wtx.tx)
                    .await?;
            match parent {
                Some((parent_session,)) if parent_session == session_id.as_str() => {}
                _ => {
                    return Err(ApiError::InvalidInput(
                        "parent_message_id must reference a message in the same session"
                            .to_string(),
                    ));
                }
            }
        }

        let now = now_ms();
        let (message_id, timestamp) = insert_message(
            &mut wtx.tx,
            session_id,
            claims,
            &content,
            visibility,
            &message_type,
            metadata_json.as_deref(),
            parent_message_id,
            now,
        )
        .await?;

        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(timestamp)
            .bind(session_id.as_str())
            .execute(&mut *wtx.tx)
            .await?;

        wtx.commit().await?;

        let ts = ms_to_datetime(timestamp);
        self.bus.publish_message(
            session_id,
            &MessageNotice {
                id: message_id,
                sender: claims.agent_id.clone(),
                sender_type: claims.agent_type,
                visibility,
                timestamp: ts,
            },
        );

        Ok(Message {
            id: message_id,
            session_id: session_id.clone(),
            sender: claims.agent_id.clone(),
            sender_type: claims.agent_type,
            content,
            visibility,
            message_type,
            metadata: metadata_json
                .as_deref()
                .and_then(|m| serde_json::from_str(m).ok()),
            timestamp: ts,
            parent_message_id,
        })
    }

    /// List messages the caller is allowed to see, ascending by id.
    pub async fn get_messages(
        &self,
        claims: &Claims,
        session_id: &SessionId,
        limit: Option<i64>,
        offset: Option<i64>,
        visibility_filter: Option<Visibility>,
        since_id: Option<i64>,
    ) -> Result<Vec<Message>, ApiError> {
        let limit = limit.unwrap_or(50).clamp(1, MAX_PAGE_SIZE);
        let offset = offset.unwrap_or(0).max(0);

        let mut conn = self.storage.acquire_read().await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM sessions WHERE id = ?")
            .bind(session_id.as_str())
            .fetch_optional(&mut *conn)
            .await?;
        if exists.is_none() {
            return Err(ApiError::SessionNotFound(session_id.to_string()));
        }

        let mut sql = String::from(
            "SELECT id, session_id, sender, sender_type, content, visibility, message_type, \
                    metadata, timestamp, parent_message_id \
             FROM messages WHERE session_id = ? AND ",
        );
        sql.push_str(visibility_clause());
        if visibility_filter.is_some() {
            sql.push_str(" AND visibility = ?");
        }
        if since_id.is_some() {
            sql.push_str(" AND id > ?");
        }
        sql.push_str(" ORDER BY id ASC LIMIT ? OFFSET ?");

        let viewer = claims.viewer();
        let mut query = sqlx::query_as::<
            _,
            (
                i64,
                String,
                String,
                String,
                String,
                String,
                String,
                Option<String>,
                i64,
                Option<i64>,
            ),
        >(&sql)
        .bind(session_id.as_str())
        .bind(&viewer.agent_id)
        .bind(viewer.agent_type.as_str())
        .bind(viewer.is_admin);
        if let Some(filter) = visibility_filter {
            query = query.bind(filter.as_str());
        }
        if let Some(since) = since_id {
            query = query.bind(since);
        }
        let rows = query
            .bind(limit)
            .bind(offset)
            .fetch_all(&mut *conn)
            .await?;

        Ok(rows.into_iter().map(row_to_message).collect())
    }

    /// Change a message's visibility after the fact. Admin-only; audited.
    pub async fn set_message_visibility(
        &self,
        claims: &Claims,
        message_id: i64,
        visibility: Visibility,
    ) -> Result<(), ApiError> {
        if !claims.is_admin() {
            return Err(ApiError::PermissionDenied {
                missing: quorum_protocol::types::Permission::Admin,
            });
        }

        let mut wtx = self.storage.begin_write().await?;
        let updated = sqlx::query("UPDATE messages SET visibility = ? WHERE id = ?")
            .bind(visibility.as_str())
            .bind(message_id)
            .execute(&mut *wtx.tx)
            .await?
            .rows_affected();
        wtx.commit().await?;

        if updated == 0 {
            return Err(ApiError::InvalidInput(format!(
                "message {message_id} does not exist"
            )));
        }

        tracing::info!(
            target: "audit",
            event = "message_visibility_changed",
            message_id,
            visibility = visibility.as_str(),
            admin = %claims.agent_id,
            "Message visibility changed"
        );
        Ok(())
    }

    /// Soft-close a session. Only the creator or an admin may close it;
    /// INACTIVE sessions stay readable and never reactivate.
    pub async fn deactivate_session(
        &self,
        claims: &Claims,
        session_id: &SessionId,
    ) -> Result<(), ApiError> {
        let mut wtx = self.storage.begin_write().await?;

        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT created_by, is_active FROM sessions WHERE id = ?")
                .bind(session_id.as_str())
                .fetch_optional(&mut *wtx.tx)
                .await?;
        let Some((created_by, is_active)) = row else {
            return Err(ApiError::SessionNotFound(session_id.to_string()));
        };
        if created_by != claims.agent_id && !claims.is_admin() {
            return Err(ApiError::PermissionDenied {
                missing: quorum_protocol::types::Permission::Admin,
            });
        }
        if is_active == 0 {
            // already closed; closing is idempotent
            return Ok(());
        }

        sqlx::query("UPDATE sessions SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(now_ms())
            .bind(session_id.as_str())
            .execute(&mut *wtx.tx)
            .await?;
        wtx.commit().await?;

        tracing::info!(
            target: "audit",
            event = "session_deactivated",
            session_id = %session_id,
            by = %claims.agent_id,
            "Session deactivated"
        );
        self.bus.publish_session_updated(session_id, false);
        Ok(())
    }
}

/// SQL fragment implementing the visibility matrix. Binds, in order:
/// viewer agent_id, viewer agent_type, viewer is_admin.
pub fn visibility_clause() -> &'static str {
    "(visibility = 'public' \
      OR (visibility = 'private' AND sender = ?) \
      OR (visibility = 'agent_only' AND sender_type = ?) \
      OR (visibility = 'admin_only' AND ?))"
}

#[allow(clippy::too_many_arguments)]
async fn insert_message(
    tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
    session_id: &SessionId,
    claims: &Claims,
    content: &str,
    visibility: Visibility,
    message_type: &str,
    metadata_json: Option<&str>,
    parent_message_id: Option<i64>,
    now: i64,
) -> Result<(i64, i64), ApiError> {
    // Clamp the timestamp so it never regresses within a session even if
    // the wall clock steps backwards.
    let (max_ts,): (Option<i64>,) =
        sqlx::query_as("SELECT MAX(timestamp) FROM messages WHERE session_id = ?")
            .bind(session_id.as_str())
            .fetch_one(&mut **tx)
            .await?;
    let timestamp = now.max(max_ts.unwrap_or(0));

    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO messages \
         (session_id, sender, sender_canonical, sender_type, content, visibility, \
          message_type, metadata, timestamp, parent_message_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(session_id.as_str())
    .bind(&claims.agent_id)
    .bind(canonical_sender(&claims.agent_id))
    .bind(claims.agent_type.as_str())
    .bind(content)
    .bind(visibility.as_str())
    .bind(message_type)
    .bind(metadata_json)
    .bind(timestamp)
    .bind(parent_message_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok((id, timestamp))
}

/// Strip NUL bytes, trim, and bound the length. Rejects content that is
/// empty once sanitized.
pub fn sanitize_content(raw: &str, max_chars: usize) -> Result<String, ApiError> {
    let cleaned: String = raw.chars().filter(|&c| c != '\0').collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Err(ApiError::InvalidInput(
            "content must not be empty".to_string(),
        ));
    }
    let len = cleaned.chars().count();
    if len > max_chars {
        return Err(ApiError::ContentTooLarge {
            actual: len,
            limit: max_chars,
        });
    }
    Ok(cleaned.to_string())
}

/// Validate metadata: must be a JSON object of bounded serialized size.
pub fn validate_metadata(metadata: Option<Value>) -> Result<Option<String>, ApiError> {
    let Some(value) = metadata else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    if !value.is_object() {
        return Err(ApiError::InvalidInputFormat {
            field: "metadata",
            expected: "JSON object",
        });
    }
    let serialized =
        serde_json::to_string(&value).map_err(|e| ApiError::Internal(e.to_string()))?;
    if serialized.len() > MAX_METADATA_BYTES {
        return Err(ApiError::InvalidInput(format!(
            "metadata exceeds {MAX_METADATA_BYTES} bytes when serialized"
        )));
    }
    Ok(Some(serialized))
}

/// Neutralize HTML metacharacters in content rendered into the dashboard
/// feed. Stored content is untouched; only dashboard-bound views escape.
pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn generate_session_id() -> SessionId {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    // hex of 8 random bytes is exactly 16 lowercase hex chars
    SessionId::from_hex_suffix(&hex::encode(bytes)).expect("generated hex suffix is valid")
}

fn row_to_session(row: (String, String, i64, i64, i64, String, String)) -> Session {
    let (id, purpose, created_at, updated_at, is_active, created_by, metadata) = row;
    Session {
        id: SessionId::parse(&id).unwrap_or_else(|_| {
            // ids are validated on insert; an invalid row means corruption
            SessionId::from_hex_suffix("0000000000000000").expect("fallback id")
        }),
        purpose,
        created_by,
        created_at: ms_to_datetime(created_at),
        updated_at: ms_to_datetime(updated_at),
        is_active: is_active != 0,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
    }
}

type MessageRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    Option<i64>,
);

pub(crate) fn row_to_message(row: MessageRow) -> Message {
    let (
        id,
        session_id,
        sender,
        sender_type,
        content,
        visibility,
        message_type,
        metadata,
        timestamp,
        parent_message_id,
    ) = row;
    Message {
        id,
        session_id: SessionId::parse(&session_id).unwrap_or_else(|_| {
            SessionId::from_hex_suffix("0000000000000000").expect("fallback id")
        }),
        sender,
        sender_type: AgentType::parse(&sender_type),
        content,
        visibility: Visibility::parse(&visibility).unwrap_or(Visibility::Public),
        message_type,
        metadata: metadata.as_deref().and_then(|m| serde_json::from_str(m).ok()),
        timestamp: ms_to_datetime(timestamp),
        parent_message_id,
    }
}
