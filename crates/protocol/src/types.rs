use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session identifier: `session_` followed by 16 lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Build a session id from a 16-char lowercase hex suffix.
    /// The caller is responsible for sourcing the hex from a CSPRNG.
    pub fn from_hex_suffix(hex: &str) -> Result<Self, IdFormatError> {
        Self::parse(&format!("session_{hex}"))
    }

    /// Parse and validate a full session id string.
    pub fn parse(s: &str) -> Result<Self, IdFormatError> {
        let suffix = s.strip_prefix("session_").ok_or(IdFormatError::Session)?;
        if suffix.len() != 16
            || !suffix
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(IdFormatError::Session);
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = IdFormatError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IdFormatError {
    #[error("expected session_<16 lowercase hex>")]
    Session,
    #[error("expected sct_<base64url>_<unix seconds>")]
    Token,
}

/// Who may read a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
    AgentOnly,
    AdminOnly,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
            Visibility::AgentOnly => "agent_only",
            Visibility::AdminOnly => "admin_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Visibility::Public),
            "private" => Some(Visibility::Private),
            "agent_only" => Some(Visibility::AgentOnly),
            "admin_only" => Some(Visibility::AdminOnly),
            _ => None,
        }
    }

    /// Apply the visibility matrix: may `viewer` read a message with this
    /// visibility, posted by `sender` of `sender_type`?
    pub fn visible_to(&self, viewer: &ViewerContext, sender: &str, sender_type: AgentType) -> bool {
        match self {
            Visibility::Public => true,
            Visibility::Private => viewer.agent_id == sender,
            Visibility::AgentOnly => viewer.agent_type == sender_type,
            Visibility::AdminOnly => viewer.is_admin,
        }
    }
}

impl Default for Visibility {
    fn default() -> Self {
        Visibility::Public
    }
}

/// The reader's identity as seen by visibility checks.
#[derive(Debug, Clone)]
pub struct ViewerContext {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub is_admin: bool,
}

/// Canonical agent kinds recognized by authorization and visibility checks.
/// Anything unrecognized on the wire collapses to `Generic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Claude,
    Admin,
    System,
    #[serde(other)]
    Generic,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Claude => "claude",
            AgentType::Admin => "admin",
            AgentType::System => "system",
            AgentType::Generic => "generic",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "claude" => AgentType::Claude,
            "admin" => AgentType::Admin,
            "system" => AgentType::System,
            _ => AgentType::Generic,
        }
    }
}

/// Grantable permissions. `admin` implies everything, `write` implies
/// `read`, `debug` stands alone (metrics/admin tooling).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Admin,
    Debug,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
            Permission::Debug => "debug",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Permission::Read),
            "write" => Some(Permission::Write),
            "admin" => Some(Permission::Admin),
            "debug" => Some(Permission::Debug),
            _ => None,
        }
    }
}

/// Check a granted permission set against a requirement, applying the
/// implication lattice.
pub fn permissions_allow(granted: &[Permission], required: Permission) -> bool {
    if granted.contains(&Permission::Admin) {
        return true;
    }
    match required {
        Permission::Read => {
            granted.contains(&Permission::Read) || granted.contains(&Permission::Write)
        }
        Permission::Write => granted.contains(&Permission::Write),
        Permission::Admin => false,
        Permission::Debug => granted.contains(&Permission::Debug),
    }
}

/// A session: a named, append-only conversation scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub purpose: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
    pub metadata: serde_json::Value,
}

/// Aggregate counters returned alongside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub message_count: i64,
    pub participant_count: i64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// An immutable entry in a session's message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: SessionId,
    pub sender: String,
    pub sender_type: AgentType,
    pub content: String,
    pub visibility: Visibility,
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<i64>,
}

/// One agent-memory key/value pair as returned to its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Default message_type when a caller doesn't set one.
pub const DEFAULT_MESSAGE_TYPE: &str = "agent_response";

/// Opaque protected-token literal prefix.
pub const PROTECTED_TOKEN_PREFIX: &str = "sct_";

/// Render a protected token: `sct_<body>_<unix-seconds>`.
/// The trailing timestamp is informational only.
pub fn format_protected_token(body: &str, created_unix: i64) -> String {
    format!("{PROTECTED_TOKEN_PREFIX}{body}_{created_unix:010}")
}

/// Split a protected token into its base64url body and creation timestamp.
/// Enforces `^sct_[A-Za-z0-9_-]+_\d{10}$`.
pub fn parse_protected_token(token: &str) -> Result<(&str, i64), IdFormatError> {
    let rest = token
        .strip_prefix(PROTECTED_TOKEN_PREFIX)
        .ok_or(IdFormatError::Token)?;
    let (body, ts) = rest.rsplit_once('_').ok_or(IdFormatError::Token)?;
    if body.is_empty()
        || !body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(IdFormatError::Token);
    }
    if ts.len() != 10 || !ts.chars().all(|c| c.is_ascii_digit()) {
        return Err(IdFormatError::Token);
    }
    let created = ts.parse::<i64>().map_err(|_| IdFormatError::Token)?;
    Ok((body, created))
}

/// Validate a memory key: `^[A-Za-z0-9][A-Za-z0-9_\-\.]{0,127}$`.
pub fn is_valid_memory_key(key: &str) -> bool {
    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && key.len() <= 128
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Canonical sender form used for sender search: lowercase, every run of
/// non-alphanumeric characters collapsed to a single `-`, ends trimmed.
pub fn canonical_sender(sender: &str) -> String {
    let mut out = String::with_capacity(sender.len());
    let mut pending_dash = false;
    for c in sender.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}
