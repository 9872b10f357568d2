use std::sync::Arc;

use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: Option<String>,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            icon: None,
        }
    }
}

/// Rendering is the host environment's job; the gateway only decides
/// whether a notification should be shown at all.
pub trait NotificationSink: Send + Sync {
    fn show(&self, note: &Notification);
}

/// Sink that swallows everything. Used in tests and headless runs.
pub struct NullSink;

impl NotificationSink for NullSink {
    fn show(&self, _note: &Notification) {}
}

/// Gates system notifications on a feature flag and window focus:
/// notifications only fire when enabled and the window is unfocused.
pub struct NotificationGateway {
    enabled: bool,
    sink: Arc<dyn NotificationSink>,
}

impl NotificationGateway {
    pub fn new(enabled: bool, sink: Arc<dyn NotificationSink>) -> Self {
        Self { enabled, sink }
    }

    /// Returns true when the notification was handed to the sink.
    pub fn deliver(&self, window_focused: bool, note: &Notification) -> bool {
        if !self.enabled {
            return false;
        }
        if window_focused {
            info!(title = %note.title, "notification suppressed, window focused");
            return false;
        }
        self.sink.show(note);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        shown: Mutex<Vec<Notification>>,
    }

    impl NotificationSink for RecordingSink {
        fn show(&self, note: &Notification) {
            self.shown.lock().expect("lock").push(note.clone());
        }
    }

    #[test]
    fn delivers_when_enabled_and_unfocused() {
        let sink = Arc::new(RecordingSink {
            shown: Mutex::new(Vec::new()),
        });
        let gateway = NotificationGateway::new(true, sink.clone());
        let note = Notification::new("alice", "hello");

        assert!(gateway.deliver(false, &note));
        assert_eq!(sink.shown.lock().expect("lock").len(), 1);
    }

    #[test]
    fn suppresses_when_focused() {
        let sink = Arc::new(RecordingSink {
            shown: Mutex::new(Vec::new()),
        });
        let gateway = NotificationGateway::new(true, sink.clone());

        assert!(!gateway.deliver(true, &Notification::new("alice", "hello")));
        assert!(sink.shown.lock().expect("lock").is_empty());
    }

    #[test]
    fn suppresses_when_disabled() {
        let sink = Arc::new(RecordingSink {
            shown: Mutex::new(Vec::new()),
        });
        let gateway = NotificationGateway::new(false, sink.clone());

        assert!(!gateway.deliver(false, &Notification::new("alice", "hello")));
        assert!(sink.shown.lock().expect("lock").is_empty());
    }
}
