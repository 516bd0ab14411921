//! Relay connector configuration.

use std::time::Duration;

use relaybridge_core::config::RelayConfig;

/// Default number of recently seen event ids kept for duplicate suppression.
pub const DEFAULT_SEEN_CAPACITY: usize = 1024;

/// Settings for the relay connection.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// WebSocket URL of the relay (e.g., "wss://relay.example.com").
    pub url: String,

    /// Fixed delay between connection attempts. Retries never give up.
    pub reconnect_delay: Duration,

    /// Upper bound on one connection attempt, TCP and WebSocket handshake
    /// included. Elapsing counts as a failed attempt.
    pub connect_timeout: Duration,

    /// How long `publish` waits for the relay's `OK`.
    pub publish_timeout: Duration,

    /// Recently seen event ids remembered across resubscriptions.
    pub seen_capacity: usize,
}

impl RelaySettings {
    /// Settings for `url` with default timings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
            seen_capacity: DEFAULT_SEEN_CAPACITY,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            url: config.url.clone(),
            reconnect_delay: config.reconnect_delay(),
            connect_timeout: config.connect_timeout(),
            publish_timeout: config.publish_timeout(),
            seen_capacity: DEFAULT_SEEN_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timings() {
        let settings = RelaySettings::new("wss://relay.example.com");
        assert_eq!(settings.url, "wss://relay.example.com");
        assert_eq!(settings.reconnect_delay, Duration::from_secs(5));
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.publish_timeout, Duration::from_secs(10));
    }

    #[test]
    fn from_config_copies_timings() {
        let config = RelayConfig {
            url: "ws://localhost:7777".into(),
            reconnect_delay_secs: 2,
            connect_timeout_secs: 4,
            publish_timeout_secs: 3,
            ..RelayConfig::default()
        };
        let settings = RelaySettings::from_config(&config);
        assert_eq!(settings.url, "ws://localhost:7777");
        assert_eq!(settings.reconnect_delay, Duration::from_secs(2));
        assert_eq!(settings.connect_timeout, Duration::from_secs(4));
        assert_eq!(settings.publish_timeout, Duration::from_secs(3));
        assert_eq!(settings.seen_capacity, DEFAULT_SEEN_CAPACITY);
    }
}
