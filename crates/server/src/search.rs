use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth::Claims;
use crate::cache::{CacheStats, LruCache};
use crate::error::ApiError;
use crate::sessions::{row_to_message, visibility_clause};
use crate::storage::Storage;
use quorum_protocol::config::CacheConfig;
use quorum_protocol::types::{Message, SessionId, canonical_sender};

/// Minimum query length for fuzzy search.
const MIN_QUERY_CHARS: usize = 3;
/// Hard cap on requested result counts.
const MAX_SEARCH_LIMIT: u64 = 100;
/// Fuzzy sender match floor for the fallback path (0..=1).
const SENDER_FUZZY_FLOOR: f64 = 0.8;

/// What `search_context` scores the query against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    All,
    SenderAndContent,
}

impl SearchScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(SearchScope::All),
            "sender_and_content" => Some(SearchScope::SenderAndContent),
            _ => None,
        }
    }
}

/// One scored hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub score: f64,
    pub message: Message,
}

/// A message with its tokenization precomputed, cached per session.
#[derive(Clone)]
struct SearchDoc {
    message: Message,
    tokens: Vec<String>,
    sender_canonical: String,
}

type DocSet = Arc<Vec<SearchDoc>>;

/// Fuzzy retrieval over visible session messages. Tokenized message bodies
/// are cached keyed by `(session_id, max_message_id)`, so any append
/// naturally invalidates the cached entry.
pub struct SearchEngine {
    storage: Arc<Storage>,
    cache: LruCache<(String, i64), DocSet>,
}

impl SearchEngine {
    pub fn new(storage: Arc<Storage>, cache_cfg: &CacheConfig) -> Self {
        Self {
            storage,
            cache: LruCache::new(
                cache_cfg.l1_size,
                Duration::from_secs(cache_cfg.default_ttl_secs),
            ),
        }
    }

    pub fn cache_stats(&self) -> Arc<CacheStats> {
        self.cache.stats()
    }

    /// Fuzzy content search: token-set scoring, visibility applied before
    /// ranking, deterministic ordering (score desc, then newest id first).
    pub async fn search_context(
        &self,
        claims: &Claims,
        session_id: &SessionId,
        query: &str,
        fuzzy_threshold: f64,
        limit: u64,
        scope: SearchScope,
    ) -> Result<Vec<SearchResult>, ApiError> {
        let query = query.trim();
        if query.chars().count() < MIN_QUERY_CHARS {
            return Err(ApiError::InvalidSearchQuery(format!(
                "query must be at least {MIN_QUERY_CHARS} characters"
            )));
        }
        if limit > MAX_SEARCH_LIMIT {
            return Err(ApiError::SearchLimitExceeded {
                requested: limit,
                max: MAX_SEARCH_LIMIT,
            });
        }
        let threshold = fuzzy_threshold.clamp(0.0, 100.0);

        let docs = self.load_docs(session_id).await?;
        let viewer = claims.viewer();
        let query_tokens = tokenize(query);

        let mut results: Vec<SearchResult> = docs
            .iter()
            .filter(|doc| {
                doc.message.visibility.visible_to(
                    &viewer,
                    &doc.message.sender,
                    doc.message.sender_type,
                )
            })
            .filter_map(|doc| {
                let mut score = token_set_ratio(&query_tokens, &doc.tokens);
                if scope == SearchScope::SenderAndContent {
                    let sender_tokens = tokenize(&doc.message.sender);
                    score = score.max(token_set_ratio(&query_tokens, &sender_tokens));
                }
                (score >= threshold).then(|| SearchResult {
                    score,
                    message: doc.message.clone(),
                })
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.message.id.cmp(&a.message.id))
        });
        results.truncate(limit as usize);
        Ok(results)
    }

    /// Sender search: exact match on the canonical form first, fuzzy
    /// fallback when nothing matches exactly.
    pub async fn search_by_sender(
        &self,
        claims: &Claims,
        session_id: &SessionId,
        sender_query: &str,
        limit: u64,
    ) -> Result<Vec<SearchResult>, ApiError> {
        if sender_query.trim().is_empty() {
            return Err(ApiError::InvalidSearchQuery(
                "sender query must not be empty".to_string(),
            ));
        }
        if limit > MAX_SEARCH_LIMIT {
            return Err(ApiError::SearchLimitExceeded {
                requested: limit,
                max: MAX_SEARCH_LIMIT,
            });
        }

        let canonical_query = canonical_sender(sender_query);
        let docs = self.load_docs(session_id).await?;
        let viewer = claims.viewer();
        let visible = docs.iter().filter(|doc| {
            doc.message.visibility.visible_to(
                &viewer,
                &doc.message.sender,
                doc.message.sender_type,
            )
        });

        let mut exact: Vec<SearchResult> = visible
            .clone()
            .filter(|doc| doc.sender_canonical == canonical_query)
            .map(|doc| SearchResult {
                score: 100.0,
                message: doc.message.clone(),
            })
            .collect();

        let mut results = if exact.is_empty() {
            let mut fuzzy: Vec<SearchResult> = visible
                .filter_map(|doc| {
                    let similarity =
                        strsim::jaro_winkler(&canonical_query, &doc.sender_canonical);
                    (similarity >= SENDER_FUZZY_FLOOR).then(|| SearchResult {
                        score: similarity * 100.0,
                        message: doc.message.clone(),
                    })
                })
                .collect();
            fuzzy.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.message.id.cmp(&a.message.id))
            });
            fuzzy
        } else {
            exact.sort_by(|a, b| b.message.id.cmp(&a.message.id));
            exact
        };

        results.truncate(limit as usize);
        Ok(results)
    }

    /// Messages in the half-open interval `[start, end)`, ascending.
    pub async fn search_by_timerange(
        &self,
        claims: &Claims,
        session_id: &SessionId,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        limit: u64,
    ) -> Result<Vec<Message>, ApiError> {
        if limit > MAX_SEARCH_LIMIT {
            return Err(ApiError::SearchLimitExceeded {
                requested: limit,
                max: MAX_SEARCH_LIMIT,
            });
        }
        let end = end.unwrap_or_else(Utc::now);
        if end <= start {
            return Err(ApiError::InvalidInput(
                "end must be after start".to_string(),
            ));
        }

        self.ensure_session(session_id).await?;
        let viewer = claims.viewer();
        let mut conn = self.storage.acquire_read().await?;

        let sql = format!(
            "SELECT id, session_id, sender, sender_type, content, visibility, message_type, \
                    metadata, timestamp, parent_message_id \
             FROM messages \
             WHERE session_id = ? AND timestamp >= ? AND timestamp < ? AND {} \
             ORDER BY id ASC LIMIT ?",
            visibility_clause()
        );
        let rows: Vec<_> = sqlx::query_as(&sql)
            .bind(session_id.as_str())
            .bind(start.timestamp_millis())
            .bind(end.timestamp_millis())
            .bind(&viewer.agent_id)
            .bind(viewer.agent_type.as_str())
            .bind(viewer.is_admin)
            .bind(limit as i64)
            .fetch_all(&mut *conn)
            .await?;

        Ok(rows.into_iter().map(row_to_message).collect())
    }

    async fn ensure_session(&self, session_id: &SessionId) -> Result<(), ApiError> {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM sessions WHERE id = ?")
            .bind(session_id.as_str())
            .fetch_optional(self.storage.pool())
            .await?;
        if exists.is_none() {
            return Err(ApiError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Load (or reuse) the tokenized document set for a session. The cache
    /// key includes the newest message id, so stale entries are simply
    /// never requested again and age out of the LRU.
    async fn load_docs(&self, session_id: &SessionId) -> Result<DocSet, ApiError> {
        self.ensure_session(session_id).await?;

        let (max_id,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(id) FROM messages WHERE session_id = ?")
                .bind(session_id.as_str())
                .fetch_one(self.storage.pool())
                .await?;
        let max_id = max_id.unwrap_or(0);

        let key = (session_id.as_str().to_string(), max_id);
        if let Some(docs) = self.cache.get(&key) {
            return Ok(docs);
        }

        let mut conn = self.storage.acquire_read().await?;
        let rows: Vec<_> = sqlx::query_as(
            "SELECT id, session_id, sender, sender_type, content, visibility, message_type, \
                    metadata, timestamp, parent_message_id \
             FROM messages WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(session_id.as_str())
        .fetch_all(&mut *conn)
        .await?;

        let docs: DocSet = Arc::new(
            rows.into_iter()
                .map(|row| {
                    let message = row_to_message(row);
                    let tokens = tokenize(&message.content);
                    let sender_canonical = canonical_sender(&message.sender);
                    SearchDoc {
                        message,
                        tokens,
                        sender_canonical,
                    }
                })
                .collect(),
        );
        self.cache.insert(key, Arc::clone(&docs));
        Ok(docs)
    }
}

/// Lowercased alphanumeric tokens, sorted and deduplicated.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}

/// Token-set similarity on a 0-100 scale: tolerant of word reordering and
/// extra words, with edit-distance smoothing for near-miss tokens.
fn token_set_ratio(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let set_a: BTreeSet<&String> = a.iter().collect();
    let set_b: BTreeSet<&String> = b.iter().collect();

    let intersection: Vec<&str> = set_a.intersection(&set_b).map(|s| s.as_str()).collect();
    let only_a: Vec<&str> = set_a.difference(&set_b).map(|s| s.as_str()).collect();
    let only_b: Vec<&str> = set_b.difference(&set_a).map(|s| s.as_str()).collect();

    // One side fully contained in the other: a perfect token-set match.
    if !intersection.is_empty() && (only_a.is_empty() || only_b.is_empty()) {
        return 100.0;
    }

    let joined_inter = intersection.join(" ");
    let joined_a = join_parts(&joined_inter, &only_a);
    let joined_b = join_parts(&joined_inter, &only_b);

    let candidates = [
        strsim::normalized_levenshtein(&joined_inter, &joined_a),
        strsim::normalized_levenshtein(&joined_inter, &joined_b),
        strsim::normalized_levenshtein(&joined_a, &joined_b),
    ];
    let best = candidates
        .iter()
        .copied()
        .fold(0.0f64, f64::max);
    best * 100.0
}

fn join_parts(base: &str, rest: &[&str]) -> String {
    if base.is_empty() {
        rest.join(" ")
    } else if rest.is_empty() {
        base.to_string()
    } else {
        format!("{base} {}", rest.join(" "))
    }
}
