use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_STORAGE_NAMESPACE: &str = "chat-sync";

/// Tunables for the realtime layer. Defaults are the production constants.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub feed_rejoin_interval_secs: u64,
    pub queue_max_retries: u32,
    pub queue_inter_message_delay_ms: u64,
    pub queue_retry_interval_secs: u64,
    pub presence_heartbeat_secs: u64,
    pub presence_stale_after_secs: u64,
    pub typing_ttl_ms: u64,
    pub notification_auto_dismiss_ms: u64,
    pub notification_body_max_chars: usize,
    pub storage_namespace: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: 1_000,
            reconnect_max_attempts: 5,
            feed_rejoin_interval_secs: 60,
            queue_max_retries: 3,
            queue_inter_message_delay_ms: 2_000,
            queue_retry_interval_secs: 30,
            presence_heartbeat_secs: 120,
            presence_stale_after_secs: 300,
            typing_ttl_ms: 3_000,
            notification_auto_dismiss_ms: 5_000,
            notification_body_max_chars: 100,
            storage_namespace: DEFAULT_STORAGE_NAMESPACE.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn feed_rejoin_interval(&self) -> Duration {
        Duration::from_secs(self.feed_rejoin_interval_secs)
    }

    pub fn queue_inter_message_delay(&self) -> Duration {
        Duration::from_millis(self.queue_inter_message_delay_ms)
    }

    pub fn queue_retry_interval(&self) -> Duration {
        Duration::from_secs(self.queue_retry_interval_secs)
    }

    pub fn presence_heartbeat(&self) -> Duration {
        Duration::from_secs(self.presence_heartbeat_secs)
    }

    pub fn presence_stale_after(&self) -> chrono::Duration {
        i64::try_from(self.presence_stale_after_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }

    pub fn notification_auto_dismiss(&self) -> Duration {
        Duration::from_millis(self.notification_auto_dismiss_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_remaining_defaults() {
        let parsed: SyncConfig =
            serde_json::from_str(r#"{"queue_max_retries": 7, "typing_ttl_ms": 1500}"#)
                .expect("config");
        assert_eq!(parsed.queue_max_retries, 7);
        assert_eq!(parsed.typing_ttl(), Duration::from_millis(1500));
        assert_eq!(parsed.reconnect_max_attempts, 5);
        assert_eq!(parsed.presence_stale_after(), chrono::Duration::minutes(5));
        assert_eq!(parsed.feed_rejoin_interval(), Duration::from_secs(60));
    }

    #[test]
    fn oversized_stale_window_saturates_instead_of_wrapping() {
        let config = SyncConfig {
            presence_stale_after_secs: u64::MAX,
            ..SyncConfig::default()
        };
        assert_eq!(config.presence_stale_after(), chrono::Duration::MAX);

        let config = SyncConfig {
            presence_stale_after_secs: i64::MAX as u64,
            ..SyncConfig::default()
        };
        assert!(config.presence_stale_after() > chrono::Duration::days(365));
    }
}
