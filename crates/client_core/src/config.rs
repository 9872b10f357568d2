use std::{collections::HashMap, fs, time::Duration};

/// Exponential backoff with a hard cap and a terminal attempt limit. One
/// policy covers every reconnect in the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-indexed):
    /// `min(base * 2^attempt, cap)`. Jitter is applied at the sleep site,
    /// not here, so this stays testable.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.cap).min(self.cap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_url: String,
    pub ws_url: String,
    pub client_type: String,
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:3630".into(),
            ws_url: "ws://127.0.0.1:3630/ws".into(),
            client_type: "desktop".into(),
            request_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

pub fn load_config() -> ClientConfig {
    let mut config = ClientConfig::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("api_url") {
                config.api_url = v.clone();
            }
            if let Some(v) = file_cfg.get("ws_url") {
                config.ws_url = v.clone();
            }
            if let Some(v) = file_cfg.get("client_type") {
                config.client_type = v.clone();
            }
            if let Some(v) = file_cfg.get("reconnect_max_attempts") {
                if let Ok(parsed) = v.parse::<u32>() {
                    config.reconnect.max_attempts = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("CHAT_API_URL") {
        config.api_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_WS_URL") {
        config.ws_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_CLIENT_TYPE") {
        config.client_type = v;
    }
    if let Ok(v) = std::env::var("CHAT_RECONNECT_MAX_ATTEMPTS") {
        if let Ok(parsed) = v.parse::<u32>() {
            config.reconnect.max_attempts = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT_KEEPALIVE_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            config.keepalive_interval = Duration::from_secs(parsed);
        }
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_cap() {
        let policy = ReconnectPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
            jitter: false,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(20), Duration::from_secs(30));
    }

    #[test]
    fn delay_survives_large_attempt_counts() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(u32::MAX), policy.cap);
    }

    #[test]
    fn defaults_are_sane() {
        let config = ClientConfig::default();
        assert!(config.ws_url.starts_with("ws://"));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
    }
}
