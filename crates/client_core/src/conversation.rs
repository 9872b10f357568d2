use chrono::{DateTime, Duration, NaiveDate, Utc};
use shared::{
    domain::{AttachmentInfo, User},
    protocol::{Frame, MessagePayload, StructuredFrame},
};
use uuid::Uuid;

/// Consecutive messages further apart than this get a timestamp separator.
const TIMESTAMP_GAP: i64 = 10 * 60;

/// Uniform display record derived from heterogeneous inbound frames.
/// Transient: lives only as long as the open conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Server id when the frame carried one, otherwise locally generated.
    pub id: String,
    pub explicit_id: bool,
    pub content: String,
    pub sender_label: String,
    pub sender_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_own: bool,
    /// True when the content still carries legacy inline markup.
    pub is_markup: bool,
    pub attachment: Option<AttachmentInfo>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct DateGroup<'a> {
    pub date: NaiveDate,
    pub messages: Vec<&'a ChatMessage>,
}

/// Extracts `(sender, body)` from the legacy inline-markup format
/// `<span style='color: #RRGGBB'>sender</span> body`. Decoded exactly once
/// here; display code never sees the markup convention.
fn parse_legacy_markup(text: &str) -> Option<(String, String)> {
    const OPEN: &str = "<span style='color: #";
    const CLOSE: &str = "</span>";

    let start = text.find(OPEN)?;
    let rest = &text[start + OPEN.len()..];
    let tag_end = rest.find("'>")?;
    if !rest[..tag_end].chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let after_tag = &rest[tag_end + 2..];
    let close = after_tag.find(CLOSE)?;
    let sender = &after_tag[..close];
    if sender.is_empty() {
        return None;
    }
    let body = after_tag[close + CLOSE.len()..].trim();
    Some((sender.to_string(), body.to_string()))
}

/// Normalizes inbound frames into a deduplicated message sequence for one
/// open conversation. Pure: no I/O, fed from the session's frame fan-out.
#[derive(Default)]
pub struct ConversationView {
    current_user_id: Option<String>,
    current_username: Option<String>,
    messages: Vec<ChatMessage>,
}

impl ConversationView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_user(user: &User) -> Self {
        Self {
            current_user_id: Some(user.id.clone()),
            current_username: Some(user.username.clone()),
            messages: Vec::new(),
        }
    }

    pub fn set_current_user(&mut self, user: Option<&User>) {
        self.current_user_id = user.map(|u| u.id.clone());
        self.current_username = user.map(|u| u.username.clone());
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Feeds one frame; returns the accepted message, or None for
    /// duplicates and non-message frames.
    pub fn ingest(&mut self, frame: &Frame) -> Option<&ChatMessage> {
        self.ingest_at(frame, Utc::now())
    }

    /// Like `ingest` with an explicit receipt time, used when the frame
    /// carries no timestamp of its own.
    pub fn ingest_at(&mut self, frame: &Frame, received_at: DateTime<Utc>) -> Option<&ChatMessage> {
        let candidate = match frame {
            Frame::Structured(StructuredFrame::Message(payload)) => {
                self.from_payload(payload, received_at)
            }
            Frame::Structured(_) | Frame::Correlated { .. } => return None,
            Frame::Raw(text) => self.from_raw(text, received_at),
        };

        if self.is_duplicate(&candidate) {
            return None;
        }
        self.messages.push(candidate);
        self.messages.last()
    }

    fn from_payload(&self, payload: &MessagePayload, received_at: DateTime<Utc>) -> ChatMessage {
        let sender_label = payload
            .sender
            .clone()
            .unwrap_or_else(|| "Unknown".to_string());
        let is_own = self.is_own(payload.sender_id.as_deref(), Some(&sender_label));
        ChatMessage {
            id: payload
                .id
                .clone()
                .unwrap_or_else(|| format!("local-{}", Uuid::new_v4())),
            explicit_id: payload.id.is_some(),
            content: payload.content.clone(),
            sender_label,
            sender_id: payload.sender_id.clone(),
            timestamp: payload.timestamp.unwrap_or(received_at),
            is_own,
            is_markup: false,
            attachment: payload.attachment.clone(),
        }
    }

    fn from_raw(&self, text: &str, received_at: DateTime<Utc>) -> ChatMessage {
        match parse_legacy_markup(text) {
            Some((sender, body)) => {
                let is_own = self.is_own(None, Some(&sender));
                ChatMessage {
                    id: format!("local-{}", Uuid::new_v4()),
                    explicit_id: false,
                    content: body,
                    sender_label: sender,
                    sender_id: None,
                    timestamp: received_at,
                    is_own,
                    is_markup: true,
                    attachment: None,
                }
            }
            None => ChatMessage {
                id: format!("local-{}", Uuid::new_v4()),
                explicit_id: false,
                content: text.to_string(),
                sender_label: "Unknown".to_string(),
                sender_id: None,
                timestamp: received_at,
                is_own: false,
                is_markup: false,
                attachment: None,
            },
        }
    }

    /// Exact identity comparison: server-issued id first, display name as
    /// the fallback for legacy frames that only carry a name.
    fn is_own(&self, sender_id: Option<&str>, sender_label: Option<&str>) -> bool {
        if let (Some(sender_id), Some(own_id)) = (sender_id, self.current_user_id.as_deref()) {
            return sender_id == own_id;
        }
        matches!(
            (sender_label, self.current_username.as_deref()),
            (Some(label), Some(own)) if label == own
        )
    }

    /// Duplicate key: the server id when both sides carry one, otherwise
    /// content plus effective timestamp. Two distinct ids are never a
    /// duplicate, even with identical content.
    fn is_duplicate(&self, candidate: &ChatMessage) -> bool {
        self.messages.iter().any(|existing| {
            if existing.explicit_id && candidate.explicit_id {
                return existing.id == candidate.id;
            }
            existing.content == candidate.content && existing.timestamp == candidate.timestamp
        })
    }

    /// Calendar-date sections in order of first appearance; arrival order
    /// is preserved within each group.
    pub fn date_groups(&self) -> Vec<DateGroup<'_>> {
        let mut groups: Vec<DateGroup<'_>> = Vec::new();
        for message in &self.messages {
            let date = message.timestamp.date_naive();
            match groups.iter_mut().find(|group| group.date == date) {
                Some(group) => group.messages.push(message),
                None => groups.push(DateGroup {
                    date,
                    messages: vec![message],
                }),
            }
        }
        groups
    }

    /// Whether a timestamp separator belongs between two consecutive
    /// messages (gap over ten minutes).
    pub fn shows_timestamp_gap(prev: &ChatMessage, current: &ChatMessage) -> bool {
        current.timestamp - prev.timestamp > Duration::seconds(TIMESTAMP_GAP)
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
