use std::time::Duration;

use roster_transport::ChannelConfig;

/// Settings for replication senders and receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// This node's id, announced in every replication hello and used to
    /// detect connections that loop back to ourselves.
    pub self_id: String,
    /// Pause between a failed or closed replication channel and the next
    /// connect attempt.
    pub retry_delay: Duration,
    /// Heartbeat settings for replication channels.
    pub channel: ChannelConfig,
}

impl ReplicationConfig {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            ..Self::default()
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            self_id: "roster".to_string(),
            retry_delay: Duration::from_millis(1000),
            channel: ChannelConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ReplicationConfig;

    #[test]
    fn defaults_match_documented_values() {
        let config = ReplicationConfig::new("node-a");
        assert_eq!(config.self_id, "node-a");
        assert_eq!(config.retry_delay, Duration::from_millis(1000));
        assert_eq!(config.channel.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.channel.auto_timeout, None);
    }
}
