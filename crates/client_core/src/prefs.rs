use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

pub const KEY_AUTH_TOKEN: &str = "auth_token";
pub const KEY_THEME: &str = "app_theme";

/// JSON key/value preference file. Reads tolerate a missing or corrupt
/// file; writes degrade to logged no-ops on I/O failure. Nothing in here
/// is allowed to take the client down.
pub struct PreferenceStore {
    path: PathBuf,
    inner: Mutex<HashMap<String, serde_json::Value>>,
}

impl PreferenceStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(values) => values,
                Err(err) => {
                    warn!(path = %path.display(), "preference file corrupt, starting empty: {err}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            inner: Mutex::new(values),
        }
    }

    /// Default location under the platform config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chat-client")
            .join("prefs.json")
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let guard = self.inner.lock().ok()?;
        let value = guard.get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, "stored preference has unexpected shape: {err}");
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(err) => {
                warn!(key, "preference not serializable, skipping: {err}");
                return;
            }
        };
        if let Ok(mut guard) = self.inner.lock() {
            guard.insert(key.to_string(), value);
            self.persist(&guard);
        }
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.remove(key);
            self.persist(&guard);
        }
    }

    fn persist(&self, values: &HashMap<String, serde_json::Value>) {
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!(path = %self.path.display(), "preference dir create failed: {err}");
                return;
            }
        }
        let raw = match serde_json::to_string_pretty(values) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("preference serialize failed: {err}");
                return;
            }
        };
        if let Err(err) = fs::write(&self.path, raw) {
            warn!(path = %self.path.display(), "preference write failed: {err}");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
