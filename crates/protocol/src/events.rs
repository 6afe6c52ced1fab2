use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{SessionId, Visibility};

/// Events fanned out to session subscribers.
///
/// Serialized as the small `{"type": ..., "data": {...}}` envelope the
/// WebSocket feed delivers. `MessageAdded` carries only metadata, never
/// content; clients fetch bodies through the normal read path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A message was committed to the session log.
    MessageAdded {
        id: i64,
        sender: String,
        visibility: Visibility,
        timestamp: DateTime<Utc>,
    },
    /// Delivered instead of `MessageAdded` when the subscriber's view does
    /// not include the message. Enough to notice activity and poll after a
    /// permission escalation.
    MessageHeartbeat { id: i64, timestamp: DateTime<Utc> },
    /// Session lifecycle change (purpose/metadata update or deactivation).
    SessionUpdated {
        session_id: SessionId,
        is_active: bool,
        timestamp: DateTime<Utc>,
    },
}

impl SessionEvent {
    /// Message id the event refers to, when it refers to one.
    pub fn message_id(&self) -> Option<i64> {
        match self {
            SessionEvent::MessageAdded { id, .. } | SessionEvent::MessageHeartbeat { id, .. } => {
                Some(*id)
            }
            SessionEvent::SessionUpdated { .. } => None,
        }
    }
}

/// First frame a WebSocket client may send after connecting, requesting a
/// bounded replay of messages it missed while disconnected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_id: Option<i64>,
}
