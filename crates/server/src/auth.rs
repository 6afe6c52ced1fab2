use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::ApiError;
use crate::storage::{Storage, now_ms, with_busy_retry};
use quorum_protocol::config::{ServerConfig, TokenConfig};
use quorum_protocol::types::{
    AgentType, Permission, ViewerContext, format_protected_token, parse_protected_token,
    permissions_allow,
};

type HmacSha256 = Hmac<Sha256>;

/// Audience marker baked into every JWT this server mints.
const JWT_AUDIENCE: &str = "quorum-agents";

/// Decrypted identity of a caller. Never serialized back to clients; the
/// dispatcher converts between this and the opaque `sct_` token at the
/// boundary and nowhere else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub permissions: Vec<Permission>,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub aud: String,
}

impl Claims {
    pub fn can(&self, required: Permission) -> bool {
        permissions_allow(&self.permissions, required)
    }

    pub fn is_admin(&self) -> bool {
        self.permissions.contains(&Permission::Admin)
    }

    pub fn viewer(&self) -> ViewerContext {
        ViewerContext {
            agent_id: self.agent_id.clone(),
            agent_type: self.agent_type,
            is_admin: self.is_admin(),
        }
    }
}

/// Pure permission check exposed to the dispatcher.
pub fn has_permission(claims: &Claims, required: Permission) -> bool {
    claims.can(required)
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
/// Returns true only if both slices have equal length and identical contents.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Check the transport-level api key. Returns whether the caller presented
/// the admin secret (gating elevation to admin/debug permissions).
pub fn verify_api_key(cfg: &ServerConfig, presented: &str) -> Result<bool, ApiError> {
    if let Some(admin) = &cfg.admin_api_key {
        if constant_time_eq(admin.as_bytes(), presented.as_bytes()) {
            return Ok(true);
        }
    }
    if let Some(key) = &cfg.api_key {
        if constant_time_eq(key.as_bytes(), presented.as_bytes()) {
            return Ok(false);
        }
    }
    if !cfg.require_api_key {
        return Ok(false);
    }
    Err(ApiError::InvalidApiKey)
}

/// First/last four chars of a token for log lines. The full opaque body
/// never reaches the log stream.
pub fn redact_token(token: &str) -> String {
    if token.len() <= 12 {
        return "****".to_string();
    }
    format!("{}..{}", &token[..8], &token[token.len() - 4..])
}

#[derive(Default)]
struct VaultCounters {
    minted: AtomicU64,
    refreshes: AtomicU64,
    auto_renewals: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VaultSnapshot {
    pub active_tokens: i64,
    pub minted: u64,
    pub refreshes: u64,
    pub auto_renewals: u64,
}

/// Maps opaque protected tokens to sealed JWTs and back.
///
/// The opaque body is looked up by a keyed hash so a leaked database does
/// not allow offline token forgery; the JWT itself is sealed with a per-row
/// key derived from the master encryption key and a fresh salt.
pub struct TokenVault {
    storage: Arc<Storage>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    master_key: [u8; 32],
    hash_key: [u8; 32],
    cfg: TokenConfig,
    counters: VaultCounters,
}

impl TokenVault {
    pub fn new(
        server_cfg: &ServerConfig,
        token_cfg: TokenConfig,
        storage: Arc<Storage>,
    ) -> Result<Self, ApiError> {
        let signing = server_cfg
            .jwt_secret_key
            .as_deref()
            .ok_or_else(|| ApiError::Internal("jwt_secret_key not configured".to_string()))?;
        let sealing = server_cfg
            .jwt_encryption_key
            .as_deref()
            .ok_or_else(|| ApiError::Internal("jwt_encryption_key not configured".to_string()))?;

        Ok(Self {
            storage,
            encoding_key: EncodingKey::from_secret(signing.as_bytes()),
            decoding_key: DecodingKey::from_secret(signing.as_bytes()),
            master_key: derive_key(sealing, b"quorum.token.seal"),
            hash_key: derive_key(sealing, b"quorum.token.hash"),
            cfg: token_cfg,
            counters: VaultCounters::default(),
        })
    }

    /// Mint a protected token for an agent. `elevated` reflects whether the
    /// caller presented the admin api key; without it, `admin` and `debug`
    /// are clamped out of the requested set.
    pub async fn authenticate(
        &self,
        agent_id: &str,
        agent_type: AgentType,
        requested: &[Permission],
        elevated: bool,
    ) -> Result<(String, DateTime<Utc>, Vec<Permission>), ApiError> {
        let mut granted: Vec<Permission> = Vec::new();
        for &perm in requested {
            let allowed = match perm {
                Permission::Admin | Permission::Debug => elevated,
                Permission::Read | Permission::Write => true,
            };
            if allowed {
                if !granted.contains(&perm) {
                    granted.push(perm);
                }
            } else {
                tracing::warn!(
                    agent_id,
                    permission = perm.as_str(),
                    "Clamped permission not covered by the presented api key"
                );
            }
        }
        if granted.is_empty() {
            granted.push(Permission::Read);
        }

        let now = now_ms();
        let expires_ms = now + self.cfg.default_ttl_secs as i64 * 1000;
        let claims = Claims {
            agent_id: agent_id.to_string(),
            agent_type,
            permissions: granted.clone(),
            iat: now / 1000,
            exp: expires_ms / 1000,
            jti: Uuid::new_v4().to_string(),
            aud: JWT_AUDIENCE.to_string(),
        };

        let jwt = self.sign(&claims)?;
        let (token, body) = new_opaque_token(now / 1000);
        let token_hash = self.hash_body(&body);
        let salt = random_bytes::<16>();
        let sealed = self.seal(&jwt, &salt)?;

        let mut wtx = self.storage.begin_write().await?;
        sqlx::query(
            "INSERT INTO secure_tokens \
             (token_hash, jwt_encrypted, salt, agent_id, expires_at, created_at, refresh_count, active) \
             VALUES (?, ?, ?, ?, ?, ?, 0, 1)",
        )
        .bind(&token_hash)
        .bind(&sealed)
        .bind(salt.as_slice())
        .bind(agent_id)
        .bind(expires_ms)
        .bind(now)
        .execute(&mut *wtx.tx)
        .await?;
        wtx.commit().await?;

        self.counters.minted.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: "audit",
            event = "token_minted",
            agent_id,
            token = %redact_token(&token),
            "Protected token issued"
        );

        Ok((token, crate::storage::ms_to_datetime(expires_ms), granted))
    }

    /// Resolve a protected token to claims. Rejects missing, revoked, and
    /// expired rows; silently extends tokens inside the renewal window so a
    /// long-running operation does not expire mid-flight.
    pub async fn validate(&self, token: &str) -> Result<Claims, ApiError> {
        let (body, _created) = parse_protected_token(token).map_err(|_| ApiError::TokenRevoked)?;
        let token_hash = self.hash_body(body);

        let row: Option<(i64, Vec<u8>, Vec<u8>, i64, i64)> = sqlx::query_as(
            "SELECT id, jwt_encrypted, salt, expires_at, active \
             FROM secure_tokens WHERE token_hash = ?",
        )
        .bind(&token_hash)
        .fetch_optional(self.storage.pool())
        .await?;

        let Some((id, sealed, salt, mut expires_ms, active)) = row else {
            return Err(ApiError::TokenRevoked);
        };
        if active == 0 {
            return Err(ApiError::TokenRevoked);
        }
        let now = now_ms();
        if expires_ms <= now {
            return Err(ApiError::TokenExpired);
        }

        // Safety-net renewal: extend tokens about to expire instead of
        // failing the operation that presented them.
        if expires_ms - now < self.cfg.renewal_window_secs as i64 * 1000 {
            let extension = self.cfg.renewal_extension_secs as i64 * 1000;
            let pool = self.storage.pool();
            let updated = with_busy_retry(|| async {
                sqlx::query(
                    "UPDATE secure_tokens \
                     SET expires_at = expires_at + ?, refresh_count = refresh_count + 1 \
                     WHERE id = ? AND active = 1",
                )
                .bind(extension)
                .bind(id)
                .execute(pool)
                .await
            })
            .await?;
            if updated.rows_affected() == 1 {
                expires_ms += extension;
                self.counters.auto_renewals.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    target: "audit",
                    event = "token_auto_renewed",
                    token = %redact_token(token),
                    new_expiry_ms = expires_ms,
                    "Token auto-renewed inside the expiry window"
                );
            }
        }

        let jwt = self.unseal(&sealed, &salt)?;
        let mut claims = self.verify(&jwt)?;
        // The row is the authority on expiry; the embedded exp is informational.
        claims.exp = expires_ms / 1000;
        Ok(claims)
    }

    /// Rotate a protected token: mint a successor and deactivate the
    /// predecessor in one transaction. After this returns, the old token
    /// fails validation and the new one validates.
    pub async fn refresh(&self, token: &str) -> Result<(String, DateTime<Utc>), ApiError> {
        let (body, _) = parse_protected_token(token).map_err(|_| ApiError::TokenRevoked)?;
        let token_hash = self.hash_body(body);
        let now = now_ms();

        let mut wtx = self.storage.begin_write().await?;

        let row: Option<(i64, Vec<u8>, Vec<u8>, String, i64, i64, i64)> = sqlx::query_as(
            "SELECT id, jwt_encrypted, salt, agent_id, expires_at, refresh_count, active \
             FROM secure_tokens WHERE token_hash = ?",
        )
        .bind(&token_hash)
        .fetch_optional(&mut *wtx.tx)
        .await?;

        let Some((old_id, sealed, salt, agent_id, expires_ms, refresh_count, active)) = row else {
            return Err(ApiError::TokenRevoked);
        };
        if active == 0 {
            return Err(ApiError::TokenRevoked);
        }
        if expires_ms <= now {
            return Err(ApiError::TokenExpired);
        }

        let old_jwt = self.unseal(&sealed, &salt)?;
        let old_claims = self.verify(&old_jwt)?;

        let new_expires_ms = now + self.cfg.default_ttl_secs as i64 * 1000;
        let new_claims = Claims {
            agent_id: old_claims.agent_id.clone(),
            agent_type: old_claims.agent_type,
            permissions: old_claims.permissions.clone(),
            iat: now / 1000,
            exp: new_expires_ms / 1000,
            jti: Uuid::new_v4().to_string(),
            aud: JWT_AUDIENCE.to_string(),
        };
        let new_jwt = self.sign(&new_claims)?;
        let (new_token, new_body) = new_opaque_token(now / 1000);
        let new_hash = self.hash_body(&new_body);
        let new_salt = random_bytes::<16>();
        let new_sealed = self.seal(&new_jwt, &new_salt)?;

        sqlx::query(
            "INSERT INTO secure_tokens \
             (token_hash, jwt_encrypted, salt, agent_id, expires_at, created_at, \
              predecessor_token_id, refresh_count, active) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(&new_hash)
        .bind(&new_sealed)
        .bind(new_salt.as_slice())
        .bind(&agent_id)
        .bind(new_expires_ms)
        .bind(now)
        .bind(old_id)
        .bind(refresh_count + 1)
        .execute(&mut *wtx.tx)
        .await?;

        sqlx::query("UPDATE secure_tokens SET active = 0 WHERE id = ?")
            .bind(old_id)
            .execute(&mut *wtx.tx)
            .await?;

        wtx.commit().await?;

        self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: "audit",
            event = "token_refreshed",
            agent_id,
            predecessor = %redact_token(token),
            successor = %redact_token(&new_token),
            "Token rotated"
        );

        Ok((new_token, crate::storage::ms_to_datetime(new_expires_ms)))
    }

    /// Remove expired rows and deactivated rows past the audit retention
    /// window. Returns the number of rows deleted.
    pub async fn cleanup(&self) -> Result<u64, ApiError> {
        let now = now_ms();
        let retention_cutoff = now - self.cfg.retention_secs as i64 * 1000;

        let mut wtx = self.storage.begin_write().await?;
        let inactive = sqlx::query("DELETE FROM secure_tokens WHERE active = 0 AND created_at < ?")
            .bind(retention_cutoff)
            .execute(&mut *wtx.tx)
            .await?
            .rows_affected();
        let expired = sqlx::query("DELETE FROM secure_tokens WHERE active = 1 AND expires_at < ?")
            .bind(now)
            .execute(&mut *wtx.tx)
            .await?
            .rows_affected();
        wtx.commit().await?;

        let removed = inactive + expired;
        if removed > 0 {
            tracing::debug!(inactive, expired, "Token cleanup removed rows");
        }
        Ok(removed)
    }

    pub async fn snapshot(&self) -> VaultSnapshot {
        let active_tokens: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM secure_tokens WHERE active = 1 AND expires_at > ?",
        )
        .bind(now_ms())
        .fetch_one(self.storage.pool())
        .await
        .unwrap_or(0);

        VaultSnapshot {
            active_tokens,
            minted: self.counters.minted.load(Ordering::Relaxed),
            refreshes: self.counters.refreshes.load(Ordering::Relaxed),
            auto_renewals: self.counters.auto_renewals.load(Ordering::Relaxed),
        }
    }

    fn sign(&self, claims: &Claims) -> Result<String, ApiError> {
        jsonwebtoken::encode(&Header::default(), claims, &self.encoding_key)
            .map_err(|e| ApiError::Internal(format!("jwt encode failed: {e}")))
    }

    fn verify(&self, jwt: &str) -> Result<Claims, ApiError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[JWT_AUDIENCE]);
        // Expiry authority is the vault row, which outlives the embedded
        // exp once safety-net renewals kick in.
        validation.validate_exp = false;
        let data = jsonwebtoken::decode::<Claims>(jwt, &self.decoding_key, &validation)
            .map_err(|_| ApiError::TokenRevoked)?;
        Ok(data.claims)
    }

    fn hash_body(&self, body: &str) -> String {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.hash_key).expect("HMAC accepts keys of any length");
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn row_key(&self, salt: &[u8]) -> [u8; 32] {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.master_key).expect("HMAC accepts keys of any length");
        mac.update(salt);
        mac.finalize().into_bytes().into()
    }

    /// AEAD-seal a JWT: random 96-bit nonce prepended to the ciphertext,
    /// per-row key derived from the master key and the row salt.
    fn seal(&self, jwt: &str, salt: &[u8]) -> Result<Vec<u8>, ApiError> {
        let key = self.row_key(salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce_bytes = random_bytes::<12>();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, jwt.as_bytes())
            .map_err(|_| ApiError::Internal("token sealing failed".to_string()))?;
        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unseal(&self, sealed: &[u8], salt: &[u8]) -> Result<String, ApiError> {
        if sealed.len() < 13 {
            return Err(ApiError::TokenRevoked);
        }
        let key = self.row_key(salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let (nonce_bytes, ciphertext) = sealed.split_at(12);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| ApiError::TokenRevoked)?;
        String::from_utf8(plaintext).map_err(|_| ApiError::TokenRevoked)
    }
}

fn derive_key(secret: &str, label: &[u8]) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(label);
    mac.finalize().into_bytes().into()
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generate a fresh opaque token. Returns (full token, body) where the body
/// is the URL-safe base64 of 32 random bytes.
fn new_opaque_token(created_unix: i64) -> (String, String) {
    use base64::Engine;
    let body = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes::<32>());
    (format_protected_token(&body, created_unix), body)
}
