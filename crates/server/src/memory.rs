use std::sync::Arc;

use serde_json::Value;

use crate::auth::Claims;
use crate::error::ApiError;
use crate::sessions::validate_metadata;
use crate::storage::{Storage, ms_to_datetime, now_ms};
use quorum_protocol::config::LimitsConfig;
use quorum_protocol::types::{MemoryEntry, SessionId, is_valid_memory_key};

/// Serialized value ceiling per entry.
const MAX_VALUE_BYTES: usize = 1024 * 1024;
/// list_memory page size ceiling.
const MAX_PAGE_SIZE: i64 = 500;

/// Private per-agent key/value store, session- or globally scoped, with
/// TTLs and a soft quota. Isolation is enforced in the SQL predicates:
/// every statement filters on the caller's agent_id.
pub struct MemoryStore {
    storage: Arc<Storage>,
    limits: LimitsConfig,
}

impl MemoryStore {
    pub fn new(storage: Arc<Storage>, limits: LimitsConfig) -> Self {
        Self { storage, limits }
    }

    /// Upsert a key. `ttl_seconds` computes an absolute expiry; expired
    /// entries behave as absent everywhere.
    pub async fn set(
        &self,
        claims: &Claims,
        key: &str,
        value: Value,
        session_id: Option<&SessionId>,
        ttl_seconds: Option<u64>,
        metadata: Option<Value>,
    ) -> Result<(), ApiError> {
        validate_key(key)?;
        let serialized =
            serde_json::to_string(&value).map_err(|e| ApiError::Internal(e.to_string()))?;
        if serialized.len() > MAX_VALUE_BYTES {
            return Err(ApiError::ContentTooLarge {
                actual: serialized.len(),
                limit: MAX_VALUE_BYTES,
            });
        }
        let metadata_json = validate_metadata(metadata)?;
        let scope = scope_key(session_id);
        let now = now_ms();
        let expires_at = ttl_seconds.map(|ttl| now + ttl as i64 * 1000);

        let mut wtx = self.storage.begin_write().await?;

        // Soft quota on the serialized bytes this agent already holds,
        // not counting the row being replaced.
        let (used,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(LENGTH(value)), 0) FROM agent_memory \
             WHERE agent_id = ? AND NOT (session_id = ? AND key = ?)",
        )
        .bind(&claims.agent_id)
        .bind(&scope)
        .bind(key)
        .fetch_one(&mut *wtx.tx)
        .await?;
        let quota = self.limits.memory_quota_bytes;
        if used as u64 + serialized.len() as u64 > quota {
            return Err(ApiError::MemoryLimitExceeded {
                used: used as u64,
                quota,
            });
        }

        sqlx::query(
            "INSERT INTO agent_memory \
             (agent_id, session_id, key, value, metadata, created_at, updated_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(agent_id, session_id, key) DO UPDATE SET \
               value = excluded.value, \
               metadata = excluded.metadata, \
               updated_at = excluded.updated_at, \
               expires_at = excluded.expires_at",
        )
        .bind(&claims.agent_id)
        .bind(&scope)
        .bind(key)
        .bind(&serialized)
        .bind(&metadata_json)
        .bind(now)
        .bind(now)
        .bind(expires_at)
        .execute(&mut *wtx.tx)
        .await?;

        wtx.commit().await?;
        Ok(())
    }

    /// Fetch a key in the given scope. A session-scoped miss falls back to
    /// the global scope only when `fallback` is set.
    pub async fn get(
        &self,
        claims: &Claims,
        key: &str,
        session_id: Option<&SessionId>,
        fallback: bool,
    ) -> Result<Option<MemoryEntry>, ApiError> {
        validate_key(key)?;
        let mut conn = self.storage.acquire_read().await?;

        let scoped = self
            .fetch_one(&mut conn, &claims.agent_id, key, &scope_key(session_id))
            .await?;
        if scoped.is_some() {
            return Ok(scoped);
        }
        if fallback && session_id.is_some() {
            return self.fetch_one(&mut conn, &claims.agent_id, key, "").await;
        }
        Ok(None)
    }

    async fn fetch_one(
        &self,
        conn: &mut sqlx::pool::PoolConnection<sqlx::Sqlite>,
        agent_id: &str,
        key: &str,
        scope: &str,
    ) -> Result<Option<MemoryEntry>, ApiError> {
        let row: Option<MemoryRow> = sqlx::query_as(
            "SELECT key, value, session_id, metadata, created_at, updated_at, expires_at \
             FROM agent_memory \
             WHERE agent_id = ? AND session_id = ? AND key = ? \
               AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(agent_id)
        .bind(scope)
        .bind(key)
        .bind(now_ms())
        .fetch_optional(&mut **conn)
        .await?;
        Ok(row.map(row_to_entry))
    }

    /// Paginated listing of the caller's keys in one scope, optionally
    /// filtered by key prefix.
    pub async fn list(
        &self,
        claims: &Claims,
        session_id: Option<&SessionId>,
        prefix: Option<&str>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<MemoryEntry>, ApiError> {
        let limit = limit.unwrap_or(100).clamp(1, MAX_PAGE_SIZE);
        let offset = offset.unwrap_or(0).max(0);
        let mut conn = self.storage.acquire_read().await?;

        let mut sql = String::from(
            "SELECT key, value, session_id, metadata, created_at, updated_at, expires_at \
             FROM agent_memory \
             WHERE agent_id = ? AND session_id = ? \
               AND (expires_at IS NULL OR expires_at > ?)",
        );
        if prefix.is_some() {
            // ESCAPE so literal % and _ in the prefix match themselves
            sql.push_str(" AND key LIKE ? ESCAPE '\\'");
        }
        sql.push_str(" ORDER BY key ASC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, MemoryRow>(&sql)
            .bind(&claims.agent_id)
            .bind(scope_key(session_id))
            .bind(now_ms());
        if let Some(prefix) = prefix {
            query = query.bind(format!("{}%", escape_like(prefix)));
        }
        let rows = query
            .bind(limit)
            .bind(offset)
            .fetch_all(&mut *conn)
            .await?;

        Ok(rows.into_iter().map(row_to_entry).collect())
    }

    /// Delete a key. Returns whether a live row was removed.
    pub async fn delete(
        &self,
        claims: &Claims,
        key: &str,
        session_id: Option<&SessionId>,
    ) -> Result<bool, ApiError> {
        validate_key(key)?;
        let mut wtx = self.storage.begin_write().await?;
        let removed = sqlx::query(
            "DELETE FROM agent_memory WHERE agent_id = ? AND session_id = ? AND key = ?",
        )
        .bind(&claims.agent_id)
        .bind(scope_key(session_id))
        .bind(key)
        .execute(&mut *wtx.tx)
        .await?
        .rows_affected();
        wtx.commit().await?;
        Ok(removed > 0)
    }

    /// Physically remove expired entries. Reads already hide them; this
    /// reclaims the space.
    pub async fn sweep_expired(&self) -> Result<u64, ApiError> {
        let mut wtx = self.storage.begin_write().await?;
        let removed = sqlx::query(
            "DELETE FROM agent_memory WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now_ms())
        .execute(&mut *wtx.tx)
        .await?
        .rows_affected();
        wtx.commit().await?;
        if removed > 0 {
            tracing::debug!(removed, "Memory sweep removed expired entries");
        }
        Ok(removed)
    }
}

fn validate_key(key: &str) -> Result<(), ApiError> {
    if is_valid_memory_key(key) {
        Ok(())
    } else {
        Err(ApiError::InvalidKey(format!(
            "key {key:?} must start with an alphanumeric and contain only \
             alphanumerics, '_', '-', '.' (max 128 chars)"
        )))
    }
}

/// Session scope is stored as the session id, global scope as ''.
fn scope_key(session_id: Option<&SessionId>) -> String {
    session_id.map(|s| s.as_str().to_string()).unwrap_or_default()
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

type MemoryRow = (
    String,
    String,
    String,
    Option<String>,
    i64,
    i64,
    Option<i64>,
);

fn row_to_entry(row: MemoryRow) -> MemoryEntry {
    let (key, value, session_id, metadata, created_at, updated_at, expires_at) = row;
    MemoryEntry {
        key,
        value: serde_json::from_str(&value).unwrap_or(Value::Null),
        session_id: if session_id.is_empty() {
            None
        } else {
            SessionId::parse(&session_id).ok()
        },
        metadata: metadata.as_deref().and_then(|m| serde_json::from_str(m).ok()),
        created_at: ms_to_datetime(created_at),
        updated_at: ms_to_datetime(updated_at),
        expires_at: expires_at.map(ms_to_datetime),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::test_support::claims_for;
    use quorum_protocol::types::{AgentType, Permission};
    use serde_json::json;

    fn agent(id: &str) -> Claims {
        claims_for(id, AgentType::Claude, &[Permission::Read, Permission::Write])
    }

    async fn test_memory() -> MemoryStore {
        let storage = Arc::new(crate::storage::test_storage().await);
        MemoryStore::new(storage, LimitsConfig::default())
    }

    async fn test_memory_with_quota(quota: u64) -> MemoryStore {
        let storage = Arc::new(crate::storage::test_storage().await);
        MemoryStore::new(
            storage,
            LimitsConfig {
                memory_quota_bytes: quota,
                ..LimitsConfig::default()
            },
        )
    }

    fn sid(hex: &str) -> SessionId {
        SessionId::parse(&format!("session_{hex:0>16}")).unwrap()
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let memory = test_memory().await;
        let alice = agent("alice");
        let value = json!({ "plan": ["a", "b"], "step": 2 });

        memory
            .set(&alice, "plan", value.clone(), None, None, None)
            .await
            .unwrap();
        let entry = memory.get(&alice, "plan", None, false).await.unwrap().unwrap();
        assert_eq!(entry.value, value);
        assert_eq!(entry.key, "plan");
        assert!(entry.session_id.is_none());
        assert!(entry.expires_at.is_none());
    }

    #[tokio::test]
    async fn upsert_replaces_value() {
        let memory = test_memory().await;
        let alice = agent("alice");
        memory
            .set(&alice, "k", json!(1), None, None, None)
            .await
            .unwrap();
        memory
            .set(&alice, "k", json!(2), None, None, None)
            .await
            .unwrap();
        let entry = memory.get(&alice, "k", None, false).await.unwrap().unwrap();
        assert_eq!(entry.value, json!(2));
    }

    #[tokio::test]
    async fn agents_never_see_each_others_entries() {
        let memory = test_memory().await;
        let alice = agent("alice");
        let bob = agent("bob");

        memory
            .set(&alice, "shared-name", json!("alice data"), None, None, None)
            .await
            .unwrap();

        assert!(memory.get(&bob, "shared-name", None, false).await.unwrap().is_none());
        assert!(memory.list(&bob, None, None, None, None).await.unwrap().is_empty());
        // bob "deleting" alice's key is a no-op
        assert!(!memory.delete(&bob, "shared-name", None).await.unwrap());
        assert!(memory.get(&alice, "shared-name", None, false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn session_scope_is_distinct_from_global() {
        let memory = test_memory().await;
        let alice = agent("alice");
        let session = sid("ab");

        memory
            .set(&alice, "ctx", json!("global"), None, None, None)
            .await
            .unwrap();
        memory
            .set(&alice, "ctx", json!("scoped"), Some(&session), None, None)
            .await
            .unwrap();

        let scoped = memory
            .get(&alice, "ctx", Some(&session), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scoped.value, json!("scoped"));
        assert_eq!(scoped.session_id, Some(session.clone()));

        let global = memory.get(&alice, "ctx", None, false).await.unwrap().unwrap();
        assert_eq!(global.value, json!("global"));
    }

    #[tokio::test]
    async fn session_miss_falls_back_only_when_asked() {
        let memory = test_memory().await;
        let alice = agent("alice");
        let session = sid("cd");

        memory
            .set(&alice, "only-global", json!(42), None, None, None)
            .await
            .unwrap();

        assert!(
            memory
                .get(&alice, "only-global", Some(&session), false)
                .await
                .unwrap()
                .is_none()
        );
        let fell_back = memory
            .get(&alice, "only-global", Some(&session), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fell_back.value, json!(42));
    }

    #[tokio::test]
    async fn expired_entries_behave_as_absent() {
        let memory = test_memory().await;
        let alice = agent("alice");

        memory
            .set(&alice, "ephemeral", json!("soon gone"), None, Some(3600), None)
            .await
            .unwrap();
        assert!(memory.get(&alice, "ephemeral", None, false).await.unwrap().is_some());

        // Force the expiry into the past.
        sqlx::query("UPDATE agent_memory SET expires_at = 1")
            .execute(memory.storage.pool())
            .await
            .unwrap();

        assert!(memory.get(&alice, "ephemeral", None, false).await.unwrap().is_none());
        assert!(memory.list(&alice, None, None, None, None).await.unwrap().is_empty());

        let swept = memory.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
    }

    #[tokio::test]
    async fn list_filters_by_prefix_and_paginates() {
        let memory = test_memory().await;
        let alice = agent("alice");
        for key in ["task.1", "task.2", "task.3", "note.1"] {
            memory
                .set(&alice, key, json!(key), None, None, None)
                .await
                .unwrap();
        }

        let tasks = memory
            .list(&alice, None, Some("task."), None, None)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|e| e.key.starts_with("task.")));

        let page = memory
            .list(&alice, None, Some("task."), Some(2), Some(1))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].key, "task.2");
    }

    #[tokio::test]
    async fn delete_removes_only_the_addressed_scope() {
        let memory = test_memory().await;
        let alice = agent("alice");
        let session = sid("ef");

        memory.set(&alice, "k", json!(1), None, None, None).await.unwrap();
        memory
            .set(&alice, "k", json!(2), Some(&session), None, None)
            .await
            .unwrap();

        assert!(memory.delete(&alice, "k", Some(&session)).await.unwrap());
        assert!(memory.get(&alice, "k", Some(&session), false).await.unwrap().is_none());
        assert!(memory.get(&alice, "k", None, false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn key_format_is_enforced() {
        let memory = test_memory().await;
        let alice = agent("alice");

        for bad in ["", "_x", "has space", "ctl\x01", &"k".repeat(129)] {
            assert!(matches!(
                memory.set(&alice, bad, json!(1), None, None, None).await,
                Err(ApiError::InvalidKey(_))
            ));
        }
        assert!(memory.set(&alice, "ok-key.v2", json!(1), None, None, None).await.is_ok());
    }

    #[tokio::test]
    async fn oversized_values_are_rejected() {
        let memory = test_memory().await;
        let alice = agent("alice");
        let big = json!("x".repeat(MAX_VALUE_BYTES));
        assert!(matches!(
            memory.set(&alice, "big", big, None, None, None).await,
            Err(ApiError::ContentTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn quota_is_enforced_with_usage_context() {
        let memory = test_memory_with_quota(64).await;
        let alice = agent("alice");

        memory
            .set(&alice, "a", json!("0123456789012345678901234567890123456789"), None, None, None)
            .await
            .unwrap();
        let err = memory
            .set(&alice, "b", json!("0123456789012345678901234567890123456789"), None, None, None)
            .await
            .unwrap_err();
        match err {
            ApiError::MemoryLimitExceeded { used, quota } => {
                assert_eq!(quota, 64);
                assert!(used > 0);
            }
            other => panic!("expected MemoryLimitExceeded, got {other:?}"),
        }

        // replacing an existing key does not double-count it
        memory
            .set(&alice, "a", json!("shorter"), None, None, None)
            .await
            .unwrap();
    }
}
