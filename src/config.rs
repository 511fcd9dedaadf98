//! Process configuration from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `WEBHOOK_LISTEN_ADDR` | `0.0.0.0:3000` |
//! | `WEBHOOK_SECRETS` (comma-separated) or `WEBHOOK_SECRET` | required |
//! | `WEBHOOK_BACKEND` (`memory` or `redis`) | `memory` |
//! | `WEBHOOK_REDIS_URL` | `redis://127.0.0.1:6379` |
//! | `WEBHOOK_STREAM` | `webhooks` |
//! | `WEBHOOK_GROUP` | `webhook-workers` |
//! | `WEBHOOK_CONSUMER` | `worker-<pid>` |
//! | `WEBHOOK_MAX_ATTEMPTS` | 5 |
//! | `WEBHOOK_BACKOFF_BASE_SECS` | 5 |
//! | `WEBHOOK_RECLAIM_IDLE_SECS` | 60 |
//! | `WEBHOOK_RECLAIM_BATCH` | 50 |
//! | `WEBHOOK_RECLAIM_INTERVAL_SECS` | 5 |
//! | `WEBHOOK_READ_COUNT` | 10 |
//! | `WEBHOOK_BLOCK_MS` | 5000 |
//! | `WEBHOOK_PROCESSING_RETRY_CEILING` | 5 |
//! | `WEBHOOK_DLQ_STREAM` | `webhooks:dlq` |
//! | `WEBHOOK_DEAD_STREAM` | `webhooks:dead` |
//! | `WEBHOOK_IP_ALLOWLIST` (comma-separated) | empty |
//! | `WEBHOOK_RATE_LIMIT_WINDOW_SECS` | 60 |
//! | `WEBHOOK_RATE_LIMIT_MAX` (0 disables) | 600 |
//! | `WEBHOOK_MAX_BODY_BYTES` | 1048576 |
//!
//! A variable that is set but unparseable is an error, never a silent default.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::queue::BackoffPolicy;
use crate::server::{IngressConfig, IpAllowlist, RateLimit};
use crate::worker::WorkerConfig;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Errors in the process configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no signing secret: set WEBHOOK_SECRETS or WEBHOOK_SECRET")]
    MissingSecret,

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("unknown backend {0:?} (expected `memory` or `redis`)")]
    UnknownBackend(String),
}

/// Which implementations back the event log and the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// In-process; state is lost on exit.
    Memory,
    Redis { url: String },
}

/// Everything the binary needs to start.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub backend: Backend,
    pub ingress: IngressConfig,
    pub worker: WorkerConfig,
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which returns a variable's
    /// value if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(lookup);

        let listen_addr = vars.parse_or("WEBHOOK_LISTEN_ADDR", || {
            SocketAddr::from(([0, 0, 0, 0], 3000))
        })?;

        let secrets = secrets(&vars)?;

        let backend = match vars.get("WEBHOOK_BACKEND").as_deref() {
            None | Some("memory") => Backend::Memory,
            Some("redis") => Backend::Redis {
                url: vars
                    .get("WEBHOOK_REDIS_URL")
                    .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            },
            Some(other) => return Err(ConfigError::UnknownBackend(other.to_string())),
        };

        let defaults = WorkerConfig::default();
        let stream = vars.string_or("WEBHOOK_STREAM", &defaults.stream);

        let worker = WorkerConfig {
            stream: stream.clone(),
            group: vars.string_or("WEBHOOK_GROUP", &defaults.group),
            consumer: vars.string_or("WEBHOOK_CONSUMER", &defaults.consumer),
            dlq_stream: vars.string_or("WEBHOOK_DLQ_STREAM", &defaults.dlq_stream),
            dead_stream: vars.string_or("WEBHOOK_DEAD_STREAM", &defaults.dead_stream),
            backoff: BackoffPolicy {
                base: vars.secs_or("WEBHOOK_BACKOFF_BASE_SECS", defaults.backoff.base)?,
                max_attempts: vars.parse_or("WEBHOOK_MAX_ATTEMPTS", || defaults.backoff.max_attempts)?,
            },
            read_count: vars.positive_or("WEBHOOK_READ_COUNT", defaults.read_count)?,
            block_timeout: Duration::from_millis(
                vars.positive_or(
                    "WEBHOOK_BLOCK_MS",
                    u64::try_from(defaults.block_timeout.as_millis()).unwrap_or(u64::MAX),
                )?,
            ),
            reclaim_idle: Duration::from_secs(
                vars.positive_or("WEBHOOK_RECLAIM_IDLE_SECS", defaults.reclaim_idle.as_secs())?,
            ),
            reclaim_batch: vars.positive_or("WEBHOOK_RECLAIM_BATCH", defaults.reclaim_batch)?,
            reclaim_interval: vars.secs_or("WEBHOOK_RECLAIM_INTERVAL_SECS", defaults.reclaim_interval)?,
            processing_retry_ceiling: vars.parse_or("WEBHOOK_PROCESSING_RETRY_CEILING", || {
                defaults.processing_retry_ceiling
            })?,
            ..defaults
        };

        let defaults = IngressConfig::new(Vec::new());
        let allowlist = match vars.get("WEBHOOK_IP_ALLOWLIST") {
            Some(list) => IpAllowlist::parse(&list).map_err(|_| ConfigError::Invalid {
                name: "WEBHOOK_IP_ALLOWLIST",
                value: list.clone(),
            })?,
            None => IpAllowlist::allow_all(),
        };
        let ingress = IngressConfig {
            secrets,
            stream,
            allowlist,
            rate_limit: RateLimit {
                window: vars.secs_or("WEBHOOK_RATE_LIMIT_WINDOW_SECS", defaults.rate_limit.window)?,
                max_requests: vars.parse_or("WEBHOOK_RATE_LIMIT_MAX", || defaults.rate_limit.max_requests)?,
            },
            max_body_bytes: vars.positive_or("WEBHOOK_MAX_BODY_BYTES", defaults.max_body_bytes)?,
            ..defaults
        };

        Ok(Config {
            listen_addr,
            backend,
            ingress,
            worker,
        })
    }
}

/// `WEBHOOK_SECRETS` wins over `WEBHOOK_SECRET`; blank items are ignored.
fn secrets<F: Fn(&str) -> Option<String>>(vars: &Vars<F>) -> Result<Vec<Vec<u8>>, ConfigError> {
    let mut secrets: Vec<Vec<u8>> = vars
        .get("WEBHOOK_SECRETS")
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.as_bytes().to_vec())
                .collect()
        })
        .unwrap_or_default();

    if secrets.is_empty()
        && let Some(single) = vars.get("WEBHOOK_SECRET")
        && !single.trim().is_empty()
    {
        secrets.push(single.trim().as_bytes().to_vec());
    }

    if secrets.is_empty() {
        return Err(ConfigError::MissingSecret);
    }
    Ok(secrets)
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    /// A set, non-blank variable.
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn string_or(&self, name: &str, default: &str) -> String {
        self.get(name)
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T: FromStr>(&self, name: &'static str, default: impl FnOnce() -> T) -> Result<T, ConfigError> {
        match self.get(name) {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { name, value: raw }),
            None => Ok(default()),
        }
    }

    fn positive_or<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default,
    {
        let value = self.parse_or(name, || default)?;
        if value <= T::default() {
            return Err(ConfigError::Invalid {
                name,
                value: self.get(name).unwrap_or_default(),
            });
        }
        Ok(value)
    }

    fn secs_or(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse_or(name, || default.as_secs()).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_with_single_secret() {
        let config = load(&[("WEBHOOK_SECRET", "s3cret")]).unwrap();

        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR.parse().unwrap());
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.ingress.secrets, vec![b"s3cret".to_vec()]);
        assert_eq!(config.ingress.stream, "webhooks");
        assert_eq!(config.ingress.max_body_bytes, 1_048_576);
        assert_eq!(config.ingress.rate_limit, RateLimit::default());
        assert!(config.ingress.allowlist.is_empty());
        assert_eq!(config.worker.stream, "webhooks");
        assert_eq!(config.worker.group, "webhook-workers");
        assert!(config.worker.consumer.starts_with("worker-"));
        assert_eq!(config.worker.backoff, BackoffPolicy::default());
        assert_eq!(config.worker.block_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn secret_list_wins_and_skips_blanks() {
        let config = load(&[
            ("WEBHOOK_SECRETS", "new, ,old"),
            ("WEBHOOK_SECRET", "ignored"),
        ])
        .unwrap();
        assert_eq!(config.ingress.secrets, vec![b"new".to_vec(), b"old".to_vec()]);
    }

    #[test]
    fn missing_secret_is_an_error() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingSecret)));
        assert!(matches!(
            load(&[("WEBHOOK_SECRETS", " , ")]),
            Err(ConfigError::MissingSecret)
        ));
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("WEBHOOK_SECRET", "s"),
            ("WEBHOOK_LISTEN_ADDR", "127.0.0.1:8080"),
            ("WEBHOOK_BACKEND", "redis"),
            ("WEBHOOK_REDIS_URL", "redis://cache:6379/2"),
            ("WEBHOOK_STREAM", "events"),
            ("WEBHOOK_CONSUMER", "worker-a"),
            ("WEBHOOK_MAX_ATTEMPTS", "3"),
            ("WEBHOOK_BACKOFF_BASE_SECS", "2"),
            ("WEBHOOK_RECLAIM_IDLE_SECS", "30"),
            ("WEBHOOK_PROCESSING_RETRY_CEILING", "7"),
            ("WEBHOOK_IP_ALLOWLIST", "10.0.0.1,10.0.0.2"),
            ("WEBHOOK_RATE_LIMIT_MAX", "0"),
        ])
        .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(
            config.backend,
            Backend::Redis {
                url: "redis://cache:6379/2".to_string()
            }
        );
        assert_eq!(config.worker.stream, "events");
        assert_eq!(config.ingress.stream, "events");
        assert_eq!(config.worker.consumer, "worker-a");
        assert_eq!(config.worker.backoff, BackoffPolicy::new(Duration::from_secs(2), 3));
        assert_eq!(config.worker.reclaim_idle, Duration::from_secs(30));
        assert_eq!(config.worker.processing_retry_ceiling, 7);
        assert!(config.ingress.allowlist.allows("10.0.0.2".parse().unwrap()));
        assert!(!config.ingress.allowlist.allows("10.0.0.3".parse().unwrap()));
        assert!(!config.ingress.rate_limit.is_enabled());
    }

    #[test]
    fn block_ms_takes_values_beyond_u32() {
        let config = load(&[("WEBHOOK_SECRET", "s"), ("WEBHOOK_BLOCK_MS", "5000000000")]).unwrap();
        assert_eq!(config.worker.block_timeout, Duration::from_millis(5_000_000_000));
    }

    #[test]
    fn invalid_values_are_errors() {
        let invalid = |name: &str, value: &str| load(&[("WEBHOOK_SECRET", "s"), (name, value)]);

        assert!(matches!(
            invalid("WEBHOOK_MAX_ATTEMPTS", "many"),
            Err(ConfigError::Invalid { name: "WEBHOOK_MAX_ATTEMPTS", .. })
        ));
        assert!(matches!(
            invalid("WEBHOOK_BLOCK_MS", "0"),
            Err(ConfigError::Invalid { name: "WEBHOOK_BLOCK_MS", .. })
        ));
        assert!(matches!(
            invalid("WEBHOOK_RECLAIM_IDLE_SECS", "0"),
            Err(ConfigError::Invalid { name: "WEBHOOK_RECLAIM_IDLE_SECS", .. })
        ));
        assert!(matches!(
            invalid("WEBHOOK_IP_ALLOWLIST", "10.0.0.1,bogus"),
            Err(ConfigError::Invalid { name: "WEBHOOK_IP_ALLOWLIST", .. })
        ));
        assert!(matches!(
            invalid("WEBHOOK_LISTEN_ADDR", "nowhere"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            invalid("WEBHOOK_BACKEND", "postgres"),
            Err(ConfigError::UnknownBackend(_))
        ));
    }
}
