use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// The authenticated user as reported by the server. Replaced wholesale on
/// login or refresh; the only field mutated in place is `joined_rooms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(alias = "user_id")]
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub joined_rooms: BTreeSet<String>,
}

fn default_color() -> String {
    "#FFFFFF".to_string()
}

impl User {
    /// Idempotent set add. Returns true if the room was not already joined.
    pub fn join_room(&mut self, name: impl Into<String>) -> bool {
        self.joined_rooms.insert(name.into())
    }
}

/// A room record as it appears on the wire. Rooms pushed over the socket
/// and rooms fetched over REST use the same loose shape; identity is the
/// server id when present, otherwise the name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(
        default,
        alias = "creator_name",
        skip_serializing_if = "Option::is_none"
    )]
    pub creator: Option<String>,
    #[serde(default, alias = "users_count")]
    pub participants: u32,
    #[serde(default, alias = "lastMessage", skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, alias = "unreadCount")]
    pub unread_count: u32,
    #[serde(default, alias = "has_password")]
    pub requires_password: bool,
}

impl RoomSummary {
    pub fn identity(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    File,
}

/// File attachment as handed over the IPC boundary: images arrive as
/// inline data URLs, other files as a filesystem path reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    #[serde(alias = "url", alias = "path")]
    pub payload_ref: String,
}
