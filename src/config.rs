use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

const MINUTE_MS: Ms = 60_000;

/// Business rules applied by admission and the lifecycle state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingPolicy {
    /// Longest window a single booking may cover.
    pub max_duration_ms: Ms,
    /// New bookings start `pending` and need an administrator to confirm.
    pub require_approval: bool,
    /// Reject requests whose owner already holds an overlapping booking elsewhere.
    pub prevent_user_overlap: bool,
    /// How many upcoming bookings a room status report lists.
    pub upcoming_limit: usize,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            max_duration_ms: 240 * MINUTE_MS,
            require_approval: false,
            prevent_user_overlap: false,
            upcoming_limit: 3,
        }
    }
}

impl BookingPolicy {
    pub fn initial_status(&self) -> BookingStatus {
        if self.require_approval {
            BookingStatus::Pending
        } else {
            BookingStatus::Confirmed
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub policy: BookingPolicy,
    /// Upper bound on a single WAL append, including the group-commit wait.
    pub persist_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            policy: BookingPolicy::default(),
            persist_timeout: Duration::from_secs(5),
        }
    }
}

/// Process configuration, read from `ROOMBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub bootstrap_admin: Option<(Ulid, String)>,
    pub engine: EngineOptions,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so tests don't touch the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = EngineOptions::default();
        let policy = BookingPolicy {
            max_duration_ms: parsed::<Ms>(&lookup, "ROOMBOOK_MAX_BOOKING_MINUTES")
                .filter(|m| *m > 0)
                .map(|m| m * MINUTE_MS)
                .unwrap_or(defaults.policy.max_duration_ms),
            require_approval: flag(&lookup, "ROOMBOOK_REQUIRE_APPROVAL")
                .unwrap_or(defaults.policy.require_approval),
            prevent_user_overlap: flag(&lookup, "ROOMBOOK_PREVENT_USER_OVERLAP")
                .unwrap_or(defaults.policy.prevent_user_overlap),
            upcoming_limit: parsed(&lookup, "ROOMBOOK_UPCOMING_LIMIT")
                .unwrap_or(defaults.policy.upcoming_limit),
        };
        let engine = EngineOptions {
            policy,
            persist_timeout: parsed::<u64>(&lookup, "ROOMBOOK_PERSIST_TIMEOUT_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.persist_timeout),
        };

        let bootstrap_admin = parsed::<Ulid>(&lookup, "ROOMBOOK_ADMIN_ID").map(|id| {
            let name = lookup("ROOMBOOK_ADMIN_NAME").unwrap_or_else(|| "admin".into());
            (id, name)
        });

        Self {
            bind: lookup("ROOMBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "ROOMBOOK_PORT").unwrap_or(5433),
            data_dir: PathBuf::from(lookup("ROOMBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            max_connections: parsed(&lookup, "ROOMBOOK_MAX_CONNECTIONS").unwrap_or(256),
            metrics_port: parsed(&lookup, "ROOMBOOK_METRICS_PORT"),
            compact_threshold: parsed(&lookup, "ROOMBOOK_COMPACT_THRESHOLD").unwrap_or(1000),
            sweep_interval: parsed::<u64>(&lookup, "ROOMBOOK_SWEEP_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(300)),
            bootstrap_admin,
            engine,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roombook.wal")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring malformed {key}={raw:?}, using default");
            None
        }
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("ignoring malformed {key}={raw:?}, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_when_env_empty() {
        let cfg = config_from(&[]);
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.sweep_interval, Duration::from_secs(300));
        assert_eq!(cfg.metrics_port, None);
        assert!(cfg.bootstrap_admin.is_none());
        assert_eq!(cfg.engine.policy, BookingPolicy::default());
        assert_eq!(cfg.engine.policy.max_duration_ms, 4 * 3_600_000);
        assert_eq!(cfg.engine.policy.initial_status(), BookingStatus::Confirmed);
    }

    #[test]
    fn policy_overrides() {
        let cfg = config_from(&[
            ("ROOMBOOK_MAX_BOOKING_MINUTES", "90"),
            ("ROOMBOOK_REQUIRE_APPROVAL", "true"),
            ("ROOMBOOK_PREVENT_USER_OVERLAP", "on"),
            ("ROOMBOOK_UPCOMING_LIMIT", "5"),
            ("ROOMBOOK_SWEEP_INTERVAL_SECS", "60"),
            ("ROOMBOOK_PERSIST_TIMEOUT_MS", "250"),
        ]);
        assert_eq!(cfg.engine.policy.max_duration_ms, 90 * MINUTE_MS);
        assert!(cfg.engine.policy.require_approval);
        assert!(cfg.engine.policy.prevent_user_overlap);
        assert_eq!(cfg.engine.policy.upcoming_limit, 5);
        assert_eq!(cfg.engine.policy.initial_status(), BookingStatus::Pending);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(60));
        assert_eq!(cfg.engine.persist_timeout, Duration::from_millis(250));
    }

    #[test]
    fn malformed_values_fall_back() {
        let cfg = config_from(&[
            ("ROOMBOOK_PORT", "not-a-port"),
            ("ROOMBOOK_REQUIRE_APPROVAL", "maybe"),
            ("ROOMBOOK_MAX_BOOKING_MINUTES", "0"),
            ("ROOMBOOK_ADMIN_ID", "nope"),
        ]);
        assert_eq!(cfg.port, 5433);
        assert!(!cfg.engine.policy.require_approval);
        assert_eq!(cfg.engine.policy.max_duration_ms, 240 * MINUTE_MS);
        assert!(cfg.bootstrap_admin.is_none());
    }

    #[test]
    fn bootstrap_admin_parsed() {
        let id = Ulid::new();
        let cfg = config_from(&[("ROOMBOOK_ADMIN_ID", &id.to_string())]);
        assert_eq!(cfg.bootstrap_admin, Some((id, "admin".to_string())));
        assert!(cfg.wal_path().ends_with("roombook.wal"));
    }
}
