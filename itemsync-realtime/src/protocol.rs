//! JSON wire protocol spoken over a channel.
//!
//! Inbound (client → server), one recognized kind:
//! ```text
//! {"type":"auth","token":"<bearer token>"}
//! ```
//! Anything else is logged and ignored; it never errors the connection.
//!
//! Outbound (server → client):
//! ```text
//! {"event":"authenticated","payload":{"userId":7,"connectionId":"7-1700000000000-…"}}
//! {"event":"error","payload":{"message":"Invalid or expired token"}}
//! {"event":"created"|"updated"|"deleted","payload":{"record":{…}}}
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::channel::ConnectionId;
use crate::error::{SyncError, SyncResult};
use crate::record::{Record, UserId};

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Auth { token: String },
    /// Any other `type`. Kept so unknown kinds can be told apart from
    /// malformed frames in the logs.
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn auth(token: impl Into<String>) -> Self {
        Self::Auth {
            token: token.into(),
        }
    }

    pub fn decode(text: &str) -> SyncResult<Self> {
        serde_json::from_str(text).map_err(|e| SyncError::Protocol(format!("malformed frame: {e}")))
    }

    pub fn encode(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(|e| SyncError::Protocol(e.to_string()))
    }
}

/// The three mutation notifications fanned out to a user's sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Created,
    Updated,
    Deleted,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }

    /// Wraps the post-mutation state of `record` in the matching event.
    pub fn event(self, record: Record) -> ServerEvent {
        match self {
            Self::Created => ServerEvent::Created { record },
            Self::Updated => ServerEvent::Updated { record },
            Self::Deleted => ServerEvent::Deleted { record },
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "lowercase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    Authenticated {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    Error {
        message: String,
    },
    Created {
        record: Record,
    },
    Updated {
        record: Record,
    },
    Deleted {
        record: Record,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Name carried in the `event` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticated { .. } => "authenticated",
            Self::Error { .. } => "error",
            Self::Created { .. } => MutationKind::Created.as_str(),
            Self::Updated { .. } => MutationKind::Updated.as_str(),
            Self::Deleted { .. } => MutationKind::Deleted.as_str(),
        }
    }

    pub fn record(&self) -> Option<&Record> {
        match self {
            Self::Created { record } | Self::Updated { record } | Self::Deleted { record } => {
                Some(record)
            }
            _ => None,
        }
    }

    /// Serializes once into a shareable text frame.
    pub fn encode(&self) -> SyncResult<Arc<str>> {
        serde_json::to_string(self)
            .map(Arc::from)
            .map_err(|e| SyncError::Protocol(e.to_string()))
    }

    pub fn decode(text: &str) -> SyncResult<Self> {
        serde_json::from_str(text).map_err(|e| SyncError::Protocol(format!("malformed event: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordId;
    use serde_json::{json, Value};
    use std::time::{Duration, UNIX_EPOCH};

    fn sample_record() -> Record {
        let at = UNIX_EPOCH + Duration::from_millis(1_700_000_000_000);
        Record {
            id: RecordId(9),
            user_id: UserId(3),
            text: "ship release".into(),
            completed: false,
            version: 4,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_decode_auth() {
        let msg = ClientMessage::decode(r#"{"type":"auth","token":"abc"}"#).unwrap();
        assert_eq!(msg, ClientMessage::auth("abc"));
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let msg = ClientMessage::decode(r#"{"type":"subscribe","topic":"x"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unknown);
    }

    #[test]
    fn test_malformed_frames_are_protocol_errors() {
        assert!(matches!(ClientMessage::decode("not json"), Err(SyncError::Protocol(_))));
        assert!(matches!(ClientMessage::decode(r#"{"token":"abc"}"#), Err(SyncError::Protocol(_))));
        assert!(matches!(ClientMessage::decode(r#"{"type":"auth"}"#), Err(SyncError::Protocol(_))));
    }

    #[test]
    fn test_authenticated_wire_shape() {
        let event = ServerEvent::Authenticated {
            user_id: UserId(7),
            connection_id: ConnectionId::new("7-1-abc"),
        };
        let value: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"event": "authenticated", "payload": {"userId": 7, "connectionId": "7-1-abc"}})
        );
    }

    #[test]
    fn test_error_wire_shape() {
        let value: Value =
            serde_json::from_str(&ServerEvent::error("nope").encode().unwrap()).unwrap();
        assert_eq!(value, json!({"event": "error", "payload": {"message": "nope"}}));
    }

    #[test]
    fn test_mutation_wire_shape() {
        let event = MutationKind::Updated.event(sample_record());
        let value: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(value["event"], "updated");
        assert_eq!(value["payload"]["record"]["id"], 9);
        assert_eq!(value["payload"]["record"]["version"], 4);
        assert_eq!(value["payload"]["record"]["userId"], 3);
    }

    #[test]
    fn test_event_kind_and_record_accessors() {
        let event = MutationKind::Deleted.event(sample_record());
        assert_eq!(event.kind(), "deleted");
        assert_eq!(event.record().map(|r| r.version), Some(4));
        assert!(ServerEvent::error("x").record().is_none());
    }

    #[test]
    fn test_decode_event_from_text() {
        let text = r#"{"event":"created","payload":{"record":{"id":1,"userId":2,"text":"abc","completed":true,"version":1,"createdAt":5,"updatedAt":6}}}"#;
        match ServerEvent::decode(text).unwrap() {
            ServerEvent::Created { record } => {
                assert_eq!(record.id, RecordId(1));
                assert!(record.completed);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
