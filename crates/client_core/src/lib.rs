//! Client runtime for the chat desktop app: one reconnecting connection
//! session, a merged room directory, a conversation view model, local
//! preferences and the notification gateway.

pub mod config;
pub mod conversation;
pub mod error;
pub mod notify;
pub mod prefs;
pub mod rooms;
pub mod session;

pub use config::{load_config, ClientConfig, ReconnectPolicy};
pub use conversation::{ChatMessage, ConversationView, DateGroup};
pub use error::ClientError;
pub use notify::{Notification, NotificationGateway, NotificationSink, NullSink};
pub use prefs::{PreferenceStore, KEY_AUTH_TOKEN, KEY_THEME};
pub use rooms::{Room, RoomDirectory};
pub use session::{CommandOutcome, ConnectionSession, ConnectionState, SessionEvent};
