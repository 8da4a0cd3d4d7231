//! Server configuration from `STALLBOOK_*` environment variables.
//!
//! Every variable is optional. A value that is missing or fails to parse
//! falls back to its default.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::limits::Policy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Shared secret the frontend presents at login.
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between background compactions.
    pub compact_threshold: u64,
    /// Prometheus endpoint port; disabled when unset.
    pub metrics_port: Option<u16>,
    pub policy: Policy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7878,
            data_dir: PathBuf::from("./data"),
            password: "stallbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            policy: Policy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let policy = Policy {
            max_advance_days: parse_or(&lookup, "STALLBOOK_MAX_ADVANCE_DAYS", defaults.policy.max_advance_days),
            max_stay_days: parse_or(&lookup, "STALLBOOK_MAX_STAY_DAYS", defaults.policy.max_stay_days),
            cool_down_days: parse_or(&lookup, "STALLBOOK_COOL_DOWN_DAYS", defaults.policy.cool_down_days),
            payment_deadline_minutes: parse_or(
                &lookup,
                "STALLBOOK_PAYMENT_DEADLINE_MINUTES",
                defaults.policy.payment_deadline_minutes,
            ),
            queue_grant_minutes: parse_or(&lookup, "STALLBOOK_QUEUE_GRANT_MINUTES", defaults.policy.queue_grant_minutes),
        };

        Self {
            bind: lookup("STALLBOOK_BIND").unwrap_or(defaults.bind),
            port: parse_or(&lookup, "STALLBOOK_PORT", defaults.port),
            data_dir: lookup("STALLBOOK_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("STALLBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_or(&lookup, "STALLBOOK_MAX_CONNECTIONS", defaults.max_connections),
            compact_threshold: parse_or(&lookup, "STALLBOOK_COMPACT_THRESHOLD", defaults.compact_threshold),
            metrics_port: lookup("STALLBOOK_METRICS_PORT").and_then(|v| v.trim().parse().ok()),
            policy,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("stallbook.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = from_pairs(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.wal_path(), PathBuf::from("./data/stallbook.wal"));
        assert_eq!(config.policy.max_advance_days, 14);
    }

    #[test]
    fn overrides_are_applied() {
        let config = from_pairs(&[
            ("STALLBOOK_PORT", "9000"),
            ("STALLBOOK_DATA_DIR", "/var/lib/stallbook"),
            ("STALLBOOK_METRICS_PORT", "9100"),
            ("STALLBOOK_MAX_STAY_DAYS", "21"),
            ("STALLBOOK_COOL_DOWN_DAYS", "3"),
        ]);
        assert_eq!(config.listen_addr(), "0.0.0.0:9000");
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/stallbook/stallbook.wal"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.policy.max_stay_days, 21);
        assert_eq!(config.policy.cool_down_days, 3);
        assert_eq!(config.policy.max_advance_days, 14);
    }

    #[test]
    fn unparseable_values_fall_back() {
        let config = from_pairs(&[("STALLBOOK_MAX_CONNECTIONS", "lots"), ("STALLBOOK_QUEUE_GRANT_MINUTES", "-5")]);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.policy.queue_grant_minutes, 30);
    }
}
