use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing knobs for the presence engine and sync scheduler.
///
/// Durations deserialize in serde's `{ "secs": _, "nanos": _ }` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatConfig {
    /// How often our own presence payload is re-tracked while a view is
    /// active, to counter silent channel disconnects.
    pub heartbeat_interval: Duration,
    /// Idle time after the last input change before `typing:false` is tracked.
    pub typing_debounce: Duration,
    /// Cadence of the silent background full refetch.
    pub poll_interval: Duration,
    /// Cadence of the fallback poll used only while the channel is unhealthy.
    pub fallback_poll_interval: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            typing_debounce: Duration::from_millis(1200),
            poll_interval: Duration::from_millis(1200),
            fallback_poll_interval: Duration::from_millis(2500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_falls_back_to_defaults() {
        let config: ChatConfig =
            serde_json::from_str(r#"{"heartbeatInterval":{"secs":5,"nanos":0}}"#).unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(1200));
        assert_eq!(config.fallback_poll_interval, Duration::from_millis(2500));
    }
}

