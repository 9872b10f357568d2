use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AttachmentInfo, RoomSummary};

/// Chat message as carried inside a structured `message` frame. The server
/// omits fields freely, so everything besides `content` is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentInfo>,
}

/// The closed set of frames the server sends with a `type` discriminant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum StructuredFrame {
    Message(MessagePayload),
    Typing {
        #[serde(default)]
        conversation_id: Option<String>,
        user_id: String,
        is_typing: bool,
    },
    ReadReceipt {
        #[serde(default)]
        conversation_id: Option<String>,
        message_ids: Vec<String>,
    },
    RoomList { rooms: Vec<RoomSummary> },
    Pong,
}

/// One inbound unit from the transport, decoded exactly once at the
/// boundary. Everything downstream matches on this instead of sniffing
/// strings.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Structured(StructuredFrame),
    Correlated {
        correlation_id: String,
        payload: String,
    },
    Raw(String),
}

impl Frame {
    /// Total decode: structured first, then `id|payload` correlation, then
    /// raw text. Malformed input is never an error.
    pub fn decode(text: &str) -> Frame {
        if let Ok(frame) = serde_json::from_str::<StructuredFrame>(text) {
            return Frame::Structured(frame);
        }

        if let Some((prefix, payload)) = text.split_once('|') {
            if is_correlation_token(prefix) {
                return Frame::Correlated {
                    correlation_id: prefix.to_string(),
                    payload: payload.to_string(),
                };
            }
        }

        Frame::Raw(text.to_string())
    }
}

/// Correlation prefixes are short opaque tokens the server echoes back
/// verbatim. Anything with whitespace or markup is message text, not an id.
fn is_correlation_token(prefix: &str) -> bool {
    !prefix.is_empty()
        && prefix.len() <= 64
        && prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Idle probe sent while the connection is open; the server answers with a
/// `pong` structured frame.
pub fn keepalive_probe() -> String {
    r#"{"type":"ping"}"#.to_string()
}

/// The server's text command surface. Each variant renders to the legacy
/// `/verb args` string sent over the socket or wrapped in a REST call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login {
        email: String,
        password: String,
    },
    Register {
        email: String,
        password: String,
        username: String,
    },
    CreateRoom {
        name: String,
        password: Option<String>,
    },
    JoinRoom {
        name: String,
        password: Option<String>,
    },
    Rooms,
    ListUsers,
    History,
    Color {
        hex: String,
    },
    Auth {
        token: String,
    },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Login { email, password } => write!(f, "/login {email} {password}"),
            Command::Register {
                email,
                password,
                username,
            } => write!(f, "/register {email} {password} {username}"),
            Command::CreateRoom { name, password } => match password {
                Some(password) => write!(f, "/cr {name} {password}"),
                None => write!(f, "/cr {name}"),
            },
            Command::JoinRoom { name, password } => match password {
                Some(password) => write!(f, "/cd {name} {password}"),
                None => write!(f, "/cd {name}"),
            },
            Command::Rooms => write!(f, "/rooms"),
            Command::ListUsers => write!(f, "/list"),
            Command::History => write!(f, "/history"),
            Command::Color { hex } => write!(f, "/color {hex}"),
            Command::Auth { token } => write!(f, "/auth {token}"),
        }
    }
}

/// Body of `POST /command` when the socket is unavailable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    pub client_type: String,
}

/// Response envelope for the REST command surface. The same endpoint
/// answers logins, room operations and history fetches, so the shape is a
/// union of everything the server might include.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_rooms: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_rooms: Option<Vec<RoomSummary>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rooms: Option<Vec<RoomSummary>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<serde_json::Value>>,
}
