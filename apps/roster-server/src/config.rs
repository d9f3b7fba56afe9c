use config::{Config, ConfigError, Environment, File};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use roster_node::ReplicationConfig;
use roster_registry::RegistryConfig;
use roster_transport::ChannelConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub server_id: String,
    pub registration_bind: String,
    pub interest_bind: String,
    pub replication_bind: String,
    #[serde(deserialize_with = "deserialize_list")]
    pub peers: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub connection_auto_timeout: Duration,
    pub eviction_allowed_percentage_drop: u8,
    #[serde(with = "humantime_serde")]
    pub eviction_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub replication_retry_delay: Duration,
    pub log_level: String,
}

fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(split_list(value))
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(element) = seq.next_element()? {
                vec.push(element);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl ServerConfig {
    /// Defaults, then the optional file, then `ROSTER_*` environment
    /// variables.
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("server_id", "roster")?
            .set_default("registration_bind", "0.0.0.0:12102")?
            .set_default("interest_bind", "0.0.0.0:12103")?
            .set_default("replication_bind", "0.0.0.0:12104")?
            .set_default("peers", Vec::<String>::new())?
            .set_default("heartbeat_interval", "30s")?
            .set_default("connection_auto_timeout", "30m")?
            .set_default("eviction_allowed_percentage_drop", 20)?
            .set_default("eviction_timeout", "30s")?
            .set_default("replication_retry_delay", "1s")?
            .set_default("log_level", "info")?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(Environment::with_prefix("ROSTER").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    /// Rejects settings the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_id.trim().is_empty() {
            return Err(ConfigError::Message("server_id must not be empty".into()));
        }
        if self.eviction_allowed_percentage_drop > 100 {
            return Err(ConfigError::Message(format!(
                "eviction_allowed_percentage_drop must be at most 100, got {}",
                self.eviction_allowed_percentage_drop
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Message(
                "heartbeat_interval must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            eviction_allowed_percentage_drop: self.eviction_allowed_percentage_drop,
            eviction_timeout: self.eviction_timeout,
        }
    }

    /// Client channels are recycled after `connection_auto_timeout`.
    pub fn client_channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            heartbeat_interval: self.heartbeat_interval,
            auto_timeout: (!self.connection_auto_timeout.is_zero())
                .then_some(self.connection_auto_timeout),
            ..ChannelConfig::default()
        }
    }

    pub fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            self_id: self.server_id.clone(),
            retry_delay: self.replication_retry_delay,
            channel: ChannelConfig {
                heartbeat_interval: self.heartbeat_interval,
                ..ChannelConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env<F>(vars: &[(&str, &str)], test: F)
    where
        F: FnOnce(),
    {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut old = Vec::new();
        for (k, v) in vars {
            old.push((k.to_string(), env::var(k).ok()));
            env::set_var(k, v);
        }

        test();

        for (k, maybe_old) in old {
            match maybe_old {
                Some(val) => env::set_var(k, val),
                None => env::remove_var(k),
            }
        }
    }

    #[test]
    fn defaults_are_applied() {
        with_env(&[], || {
            let cfg = ServerConfig::new(None).expect("failed to build config");

            assert_eq!(cfg.server_id, "roster");
            assert_eq!(cfg.registration_bind, "0.0.0.0:12102");
            assert_eq!(cfg.interest_bind, "0.0.0.0:12103");
            assert_eq!(cfg.replication_bind, "0.0.0.0:12104");
            assert!(cfg.peers.is_empty());
            assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
            assert_eq!(cfg.connection_auto_timeout, Duration::from_secs(1800));
            assert_eq!(cfg.eviction_allowed_percentage_drop, 20);
            assert_eq!(cfg.eviction_timeout, Duration::from_secs(30));
            assert_eq!(cfg.replication_retry_delay, Duration::from_millis(1000));
            assert_eq!(cfg.log_level, "info");
            cfg.validate().expect("defaults should validate");
        });
    }

    #[test]
    fn env_vars_override_defaults() {
        with_env(
            &[
                ("ROSTER_SERVER_ID", "node-7"),
                ("ROSTER_HEARTBEAT_INTERVAL", "10s"),
                ("ROSTER_EVICTION_ALLOWED_PERCENTAGE_DROP", "35"),
                ("ROSTER_PEERS", "10.0.0.1:12104, 10.0.0.2:12104;10.0.0.3:12104"),
            ],
            || {
                let cfg = ServerConfig::new(None).expect("failed to build config");
                assert_eq!(cfg.server_id, "node-7");
                assert_eq!(cfg.heartbeat_interval, Duration::from_secs(10));
                assert_eq!(cfg.eviction_allowed_percentage_drop, 35);
                assert_eq!(
                    cfg.peers,
                    vec![
                        "10.0.0.1:12104".to_string(),
                        "10.0.0.2:12104".to_string(),
                        "10.0.0.3:12104".to_string()
                    ]
                );
                let replication = cfg.replication_config();
                assert_eq!(replication.self_id, "node-7");
                assert_eq!(replication.channel.heartbeat_interval, Duration::from_secs(10));
            },
        );
    }

    #[test]
    fn file_overrides_take_precedence_over_defaults_but_not_env() {
        use std::io::Write;

        let mut tmp = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            tmp,
            r#"
server_id = "file-node"
connection_auto_timeout = "5m"
eviction_timeout = "45s"
peers = ["file-peer1:12104","file-peer2:12104"]
"#
        )
        .expect("write to temp file");

        with_env(&[("ROSTER_EVICTION_TIMEOUT", "2m")], || {
            let cfg = ServerConfig::new(Some(PathBuf::from(tmp.path()))).expect("load config");
            assert_eq!(cfg.server_id, "file-node");
            assert_eq!(cfg.connection_auto_timeout, Duration::from_secs(300));
            assert_eq!(cfg.eviction_timeout, Duration::from_secs(120));
            assert_eq!(
                cfg.peers,
                vec!["file-peer1:12104".to_string(), "file-peer2:12104".to_string()]
            );
            assert_eq!(
                cfg.client_channel_config().auto_timeout,
                Some(Duration::from_secs(300))
            );
        });
    }

    #[test]
    fn invalid_values_are_rejected() {
        with_env(&[], || {
            let base = ServerConfig::new(None).expect("failed to build config");

            let mut cfg = base.clone();
            cfg.server_id = "  ".into();
            assert!(cfg.validate().is_err());

            let mut cfg = base.clone();
            cfg.eviction_allowed_percentage_drop = 101;
            assert!(cfg.validate().is_err());

            let mut cfg = base;
            cfg.heartbeat_interval = Duration::ZERO;
            assert!(cfg.validate().is_err());
        });
    }

    #[test]
    fn list_separator_handles_blanks() {
        assert_eq!(split_list("a, b ;c"), vec!["a", "b", "c"]);
        assert_eq!(split_list(",a,,b;"), vec!["a", "b"]);
        assert!(split_list("  ").is_empty());
    }
}
