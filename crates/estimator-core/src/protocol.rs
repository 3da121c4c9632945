// Realtime message envelope: `{"type": ..., "payload": {...}}` in both
// directions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::room::{Vote, VoteView};

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Messages pushed to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished {
        message: String,
        timestamp: i64,
        /// Seconds between server heartbeats.
        heartbeat_interval: u64,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        user_name: String,
        users: Vec<VoteView>,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft { user_name: String },
    VotesUpdate {
        votes: Vec<VoteView>,
        revealed: bool,
    },
    VoteRevealed {
        votes: Vec<VoteView>,
        revealed: bool,
    },
    VoteReset {
        votes: Vec<VoteView>,
        revealed: bool,
    },
    #[serde(rename_all = "camelCase")]
    UserRemoved { user_name: String, user_id: String },
    Heartbeat {
        timestamp: i64,
        server_time: String,
    },
    Pong {
        timestamp: i64,
        heartbeat_count: u64,
    },
    KeepaliveAck { timestamp: i64 },
    Error {
        message: String,
        code: u16,
        timestamp: i64,
    },
    ConnectionTimeout { message: String, timestamp: i64 },
}

impl ServerMessage {
    /// The envelope's `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::ConnectionEstablished { .. } => "connection_established",
            ServerMessage::UserJoined { .. } => "user_joined",
            ServerMessage::UserLeft { .. } => "user_left",
            ServerMessage::VotesUpdate { .. } => "votes_update",
            ServerMessage::VoteRevealed { .. } => "vote_revealed",
            ServerMessage::VoteReset { .. } => "vote_reset",
            ServerMessage::UserRemoved { .. } => "user_removed",
            ServerMessage::Heartbeat { .. } => "heartbeat",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::KeepaliveAck { .. } => "keepalive_ack",
            ServerMessage::Error { .. } => "error",
            ServerMessage::ConnectionTimeout { .. } => "connection_timeout",
        }
    }

    pub fn error(message: impl Into<String>, code: u16) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code,
            timestamp: now_timestamp(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Unix seconds, as carried in every timestamped payload.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown message type `{0}`")]
    UnknownType(String),
}

/// Commands a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Cast or clear a vote. Without `user_id` the sender's own record is used.
    Vote {
        user_id: Option<String>,
        vote: Option<Vote>,
    },
    Flip,
    Reset,
    RemoveUser {
        user_name: Option<String>,
        user_id: Option<String>,
    },
    Ping,
    Keepalive,
    /// Reply to a server heartbeat. Only refreshes liveness.
    Pong,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    /// Some clients put command fields next to `type` instead of in
    /// `payload`.
    #[serde(flatten)]
    inline: serde_json::Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoteFields {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    vote: Option<Vote>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveUserFields {
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        let fields = match raw.payload {
            Value::Object(map) if !map.is_empty() => Value::Object(map),
            _ => Value::Object(raw.inline),
        };

        let msg = match raw.kind.as_str() {
            "vote" => {
                let f: VoteFields = serde_json::from_value(fields)?;
                ClientMessage::Vote {
                    user_id: f.user_id,
                    vote: f.vote,
                }
            }
            "flip" => ClientMessage::Flip,
            "reset" => ClientMessage::Reset,
            "remove_user" => {
                let f: RemoveUserFields = serde_json::from_value(fields)?;
                ClientMessage::RemoveUser {
                    user_name: f.user_name,
                    user_id: f.user_id,
                }
            }
            "ping" => ClientMessage::Ping,
            "keepalive" => ClientMessage::Keepalive,
            "pong" => ClientMessage::Pong,
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(msg)
    }
}
