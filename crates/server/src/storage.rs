use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{SqlitePool, Transaction};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ApiError;
use quorum_protocol::config::DatabaseConfig;

/// One forward-only schema migration. Applied in order, each inside its own
/// transaction, tracked via `PRAGMA user_version`.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial schema",
        sql: r#"
CREATE TABLE sessions (
    id TEXT PRIMARY KEY,
    purpose TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_by TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    sender TEXT NOT NULL,
    sender_canonical TEXT NOT NULL,
    sender_type TEXT NOT NULL,
    content TEXT NOT NULL,
    visibility TEXT NOT NULL DEFAULT 'public',
    message_type TEXT NOT NULL DEFAULT 'agent_response',
    metadata TEXT,
    timestamp INTEGER NOT NULL,
    parent_message_id INTEGER REFERENCES messages(id)
);
CREATE INDEX idx_messages_session_timestamp ON messages(session_id, timestamp);
CREATE INDEX idx_messages_sender_timestamp ON messages(sender, timestamp);

CREATE TABLE agent_memory (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id TEXT NOT NULL,
    -- '' means global scope; a non-empty value is a session id. NULL would
    -- defeat the uniqueness constraint (SQLite treats NULLs as distinct).
    session_id TEXT NOT NULL DEFAULT '',
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    metadata TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    expires_at INTEGER
);
CREATE UNIQUE INDEX idx_agent_memory_scope ON agent_memory(agent_id, session_id, key);
CREATE INDEX idx_agent_memory_expiry ON agent_memory(expires_at) WHERE expires_at IS NOT NULL;

CREATE TABLE secure_tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token_hash TEXT NOT NULL UNIQUE,
    jwt_encrypted BLOB NOT NULL,
    salt BLOB NOT NULL,
    agent_id TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    predecessor_token_id INTEGER REFERENCES secure_tokens(id),
    refresh_count INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX idx_secure_tokens_expires ON secure_tokens(expires_at);
CREATE INDEX idx_secure_tokens_agent ON secure_tokens(agent_id);
"#,
    },
    Migration {
        version: 2,
        name: "canonical sender lookup",
        sql: r#"
CREATE INDEX idx_messages_sender_canonical ON messages(session_id, sender_canonical);
"#,
    },
];

/// Counters describing pool behavior, exported through performance metrics.
#[derive(Default)]
pub struct PoolCounters {
    acquires: AtomicU64,
    acquire_errors: AtomicU64,
    acquire_micros_total: AtomicU64,
    peak_in_use: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolSnapshot {
    pub size: u32,
    pub idle: usize,
    pub in_use: u64,
    pub peak_in_use: u64,
    pub acquires: u64,
    pub acquire_errors: u64,
    pub avg_acquire_ms: f64,
}

/// Owns the SQLite pool and the single-writer discipline. All persistent
/// state flows through this type.
pub struct Storage {
    pool: SqlitePool,
    writer: Arc<Semaphore>,
    counters: Arc<PoolCounters>,
    migration_rev: i64,
}

/// An open write transaction holding the process-wide writer permit.
/// Dropping it without `commit()` rolls the transaction back.
pub struct WriteTx {
    _permit: OwnedSemaphorePermit,
    pub tx: Transaction<'static, Sqlite>,
}

impl WriteTx {
    pub async fn commit(self) -> Result<(), ApiError> {
        self.tx.commit().await.map_err(ApiError::from)
    }
}

impl Storage {
    /// Open the database, configure pragmas, size the pool, and run any
    /// pending migrations.
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self, ApiError> {
        let options = if cfg.url.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(&cfg.url)
                .map_err(|e| ApiError::StorageUnavailable(format!("bad database url: {e}")))?
        } else {
            SqliteConnectOptions::new().filename(&cfg.url)
        }
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        // negative cache_size is KiB: 16 MiB page cache per connection
        .pragma("cache_size", "-16384")
        .pragma("mmap_size", "268435456");

        let pool = SqlitePoolOptions::new()
            .min_connections(cfg.pool_min_size)
            .max_connections(cfg.pool_max_size)
            .acquire_timeout(Duration::from_secs(cfg.connection_timeout_secs))
            .connect_with(options)
            .await
            .map_err(|e| ApiError::StorageUnavailable(e.to_string()))?;

        let migration_rev = run_migrations(&pool).await?;

        Ok(Self {
            pool,
            writer: Arc::new(Semaphore::new(1)),
            counters: Arc::new(PoolCounters::default()),
            migration_rev,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn migration_revision(&self) -> i64 {
        self.migration_rev
    }

    /// Acquire a read connection, recording acquire latency.
    pub async fn acquire_read(
        &self,
    ) -> Result<sqlx::pool::PoolConnection<Sqlite>, ApiError> {
        let start = Instant::now();
        let result = self.pool.acquire().await;
        self.note_acquire(start, result.is_err());
        result.map_err(ApiError::from)
    }

    /// Begin a write transaction. Writes serialize on a single writer permit
    /// so concurrent writers queue here instead of hitting SQLITE_BUSY.
    pub async fn begin_write(&self) -> Result<WriteTx, ApiError> {
        let permit = self
            .writer
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ApiError::StorageUnavailable("writer closed".to_string()))?;
        let start = Instant::now();
        let result = self.pool.begin().await;
        self.note_acquire(start, result.is_err());
        let tx = result.map_err(ApiError::from)?;
        Ok(WriteTx {
            _permit: permit,
            tx,
        })
    }

    fn note_acquire(&self, start: Instant, failed: bool) {
        self.counters.acquires.fetch_add(1, Ordering::Relaxed);
        self.counters
            .acquire_micros_total
            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
        if failed {
            self.counters.acquire_errors.fetch_add(1, Ordering::Relaxed);
        }
        let in_use = self.pool.size() as u64 - self.pool.num_idle() as u64;
        self.counters.peak_in_use.fetch_max(in_use, Ordering::Relaxed);
    }

    pub fn pool_snapshot(&self) -> PoolSnapshot {
        let acquires = self.counters.acquires.load(Ordering::Relaxed);
        let total_micros = self.counters.acquire_micros_total.load(Ordering::Relaxed);
        PoolSnapshot {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            in_use: self.pool.size() as u64 - self.pool.num_idle() as u64,
            peak_in_use: self.counters.peak_in_use.load(Ordering::Relaxed),
            acquires,
            acquire_errors: self.counters.acquire_errors.load(Ordering::Relaxed),
            avg_acquire_ms: if acquires == 0 {
                0.0
            } else {
                total_micros as f64 / acquires as f64 / 1000.0
            },
        }
    }

    /// Health probe: confirms a read connection is obtainable and reports
    /// the migration revision.
    pub async fn health(&self) -> (bool, i64) {
        let ok = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok();
        (ok, self.migration_rev)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn run_migrations(pool: &SqlitePool) -> Result<i64, ApiError> {
    let current: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .map_err(|e| ApiError::StorageUnavailable(format!("cannot read schema version: {e}")))?;

    let mut applied = current;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| ApiError::StorageUnavailable(e.to_string()))?;
        sqlx::raw_sql(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                ApiError::StorageUnavailable(format!(
                    "migration {} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
        sqlx::query(&format!("PRAGMA user_version = {}", migration.version))
            .execute(&mut *tx)
            .await
            .map_err(|e| ApiError::StorageUnavailable(e.to_string()))?;
        tx.commit()
            .await
            .map_err(|e| ApiError::StorageUnavailable(e.to_string()))?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied migration"
        );
        applied = migration.version;
    }

    Ok(applied)
}

/// Retry a write closure on SQLITE_BUSY-class failures: up to 5 attempts
/// with capped exponential backoff, at most ~155 ms of sleeping.
pub async fn with_busy_retry<T, F, Fut>(mut op: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut delay_ms = 5u64;
    for attempt in 1..=5u32 {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < 5 && is_busy(&err) => {
                tracing::debug!(attempt, delay_ms, "Retrying busy write");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(80);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(ApiError::SessionLocked)
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code().unwrap_or_default();
            code == "5" || code == "6" || code.starts_with("517")
        }
        _ => false,
    }
}

/// Current wall-clock time as unix milliseconds, the canonical persisted
/// timestamp representation.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
pub(crate) async fn test_storage() -> Storage {
    let cfg = DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        pool_min_size: 1,
        // a single connection so the in-memory database is shared
        pool_max_size: 1,
        connection_timeout_secs: 5,
    };
    Storage::connect(&cfg).await.expect("in-memory storage")
}
