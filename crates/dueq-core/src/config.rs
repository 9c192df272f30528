//! QueueConfig - 環境変数からの設定読み込み
//!
//! 全ての値にデフォルトがあり、`DUEQ_*` 環境変数で上書きします。
//! 接続先は `DATABASE_URL`、無ければ `DB_USER` / `DB_PASSWORD` / `DB_HOST` /
//! `DB_PORT` / `DB_NAME` から組み立てます。

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::domain::{LeasePolicy, QueueError, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Required by the Postgres store only.
    pub database_url: Option<String>,
    pub schema: String,

    /// Claim capacity per poll.
    pub batch_size: usize,
    /// Visibility timeout.
    pub lease_secs: u64,
    pub max_retry: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,

    pub poll_interval_min_secs: u64,
    pub poll_interval_max_secs: u64,
    pub sweep_interval_secs: u64,
    pub cleanup_interval_secs: u64,

    pub ttl_days: u32,
    /// Unset disables the max-age fallback for never-claimed items.
    pub max_pending_age_days: Option<u32>,

    pub workers: usize,
    pub pool_max_size: u32,
    pub wake_channel: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            schema: "public".to_string(),
            batch_size: 10,
            lease_secs: 300,
            max_retry: 5,
            backoff_base_secs: 60,
            backoff_max_secs: 3600,
            poll_interval_min_secs: 5,
            poll_interval_max_secs: 43_200,
            sweep_interval_secs: 60,
            cleanup_interval_secs: 3600,
            ttl_days: 30,
            max_pending_age_days: None,
            workers: 1,
            pool_max_size: 3,
            wake_channel: "reminder_pending".to_string(),
        }
    }
}

impl QueueConfig {
    /// Load from the process environment and validate.
    pub fn from_env() -> Result<Self, QueueError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`QueueConfig::from_env`] with an injectable lookup (tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, QueueError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.database_url = lookup("DATABASE_URL").or_else(|| database_url_from_parts(&lookup));
        if let Some(schema) = lookup("DUEQ_SCHEMA") {
            config.schema = schema;
        }
        if let Some(channel) = lookup("DUEQ_WAKE_CHANNEL") {
            config.wake_channel = channel;
        }

        override_parsed(&lookup, "DUEQ_BATCH", &mut config.batch_size)?;
        override_parsed(&lookup, "DUEQ_VISIBILITY_TIMEOUT_SECS", &mut config.lease_secs)?;
        override_parsed(&lookup, "DUEQ_MAX_RETRIES", &mut config.max_retry)?;
        override_parsed(&lookup, "DUEQ_BACKOFF_BASE_SECS", &mut config.backoff_base_secs)?;
        override_parsed(&lookup, "DUEQ_BACKOFF_MAX_SECS", &mut config.backoff_max_secs)?;
        override_parsed(&lookup, "DUEQ_POLL_INTERVAL_MIN_SECS", &mut config.poll_interval_min_secs)?;
        override_parsed(&lookup, "DUEQ_POLL_INTERVAL_MAX_SECS", &mut config.poll_interval_max_secs)?;
        override_parsed(&lookup, "DUEQ_SWEEP_INTERVAL_SECS", &mut config.sweep_interval_secs)?;
        override_parsed(&lookup, "DUEQ_CLEANUP_INTERVAL_SECS", &mut config.cleanup_interval_secs)?;
        override_parsed(&lookup, "DUEQ_TTL_DAYS", &mut config.ttl_days)?;
        override_parsed(&lookup, "DUEQ_WORKERS", &mut config.workers)?;
        override_parsed(&lookup, "DUEQ_POOL_MAX_SIZE", &mut config.pool_max_size)?;
        if let Some(raw) = lookup("DUEQ_MAX_PENDING_AGE_DAYS") {
            config.max_pending_age_days = Some(parse_var("DUEQ_MAX_PENDING_AGE_DAYS", &raw)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.batch_size == 0 {
            return Err(QueueError::Config("batch_size must be > 0".into()));
        }
        if self.lease_secs == 0 {
            return Err(QueueError::Config("lease_secs must be > 0".into()));
        }
        if self.max_retry == 0 {
            return Err(QueueError::Config("max_retry must be > 0".into()));
        }
        if self.workers == 0 {
            return Err(QueueError::Config("workers must be > 0".into()));
        }
        if self.pool_max_size == 0 {
            return Err(QueueError::Config("pool_max_size must be > 0".into()));
        }
        if self.poll_interval_min_secs == 0 {
            return Err(QueueError::Config("poll_interval_min_secs must be > 0".into()));
        }
        if self.poll_interval_min_secs > self.poll_interval_max_secs {
            return Err(QueueError::Config(format!(
                "poll_interval_min_secs ({}) exceeds poll_interval_max_secs ({})",
                self.poll_interval_min_secs, self.poll_interval_max_secs
            )));
        }
        if self.backoff_base_secs > self.backoff_max_secs {
            return Err(QueueError::Config(format!(
                "backoff_base_secs ({}) exceeds backoff_max_secs ({})",
                self.backoff_base_secs, self.backoff_max_secs
            )));
        }
        if self.sweep_interval_secs == 0 || self.cleanup_interval_secs == 0 {
            return Err(QueueError::Config("sweep/cleanup intervals must be > 0".into()));
        }
        let lease = self.lease_policy();
        if lease.soft_timeout() >= lease.duration {
            return Err(QueueError::Config(
                "soft execution timeout must be below the lease".into(),
            ));
        }
        if !is_identifier(&self.schema) {
            return Err(QueueError::Config(format!(
                "schema {:?} is not a plain SQL identifier",
                self.schema
            )));
        }
        if !is_identifier(&self.wake_channel) {
            return Err(QueueError::Config(format!(
                "wake_channel {:?} is not a plain SQL identifier",
                self.wake_channel
            )));
        }
        Ok(())
    }

    pub fn lease_policy(&self) -> LeasePolicy {
        LeasePolicy::new(Duration::from_secs(self.lease_secs))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retry: self.max_retry,
            base_delay: Duration::from_secs(self.backoff_base_secs),
            max_delay: Duration::from_secs(self.backoff_max_secs),
            multiplier: 2.0,
        }
    }

    pub fn poll_interval_min(&self) -> Duration {
        Duration::from_secs(self.poll_interval_min_secs)
    }

    pub fn poll_interval_max(&self) -> Duration {
        Duration::from_secs(self.poll_interval_max_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn ttl(&self) -> Duration {
        days(self.ttl_days)
    }

    pub fn max_pending_age(&self) -> Option<Duration> {
        self.max_pending_age_days.map(days)
    }
}

fn days(n: u32) -> Duration {
    Duration::from_secs(u64::from(n) * 86_400)
}

fn database_url_from_parts<F>(lookup: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let user = lookup("DB_USER")?;
    let host = lookup("DB_HOST")?;
    let name = lookup("DB_NAME")?;
    let port = lookup("DB_PORT").unwrap_or_else(|| "5432".to_string());
    let auth = match lookup("DB_PASSWORD") {
        Some(password) => format!("{user}:{password}"),
        None => user,
    };
    Some(format!("postgres://{auth}@{host}:{port}/{name}"))
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<(), QueueError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = parse_var(key, &raw)?;
    }
    Ok(())
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T, QueueError> {
    raw.trim()
        .parse()
        .map_err(|_| QueueError::Config(format!("{key}={raw:?} is not a valid number")))
}

/// `[A-Za-z_][A-Za-z0-9_]*`, short enough for Postgres.
pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    s.len() <= 63
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_worker_defaults() {
        let config = QueueConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.batch_size, 10);
        assert_eq!(config.lease_policy().duration, Duration::from_secs(300));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.poll_interval_max(), Duration::from_secs(43_200));
        assert_eq!(config.ttl(), Duration::from_secs(30 * 86_400));
        assert_eq!(config.max_pending_age(), None);
        assert_eq!(config.wake_channel, "reminder_pending");
        assert!(config.database_url.is_none());
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = QueueConfig::from_lookup(lookup_from(&[
            ("DUEQ_BATCH", "25"),
            ("DUEQ_MAX_RETRIES", "3"),
            ("DUEQ_MAX_PENDING_AGE_DAYS", "7"),
            ("DUEQ_SCHEMA", "reminders"),
        ]))
        .unwrap();

        assert_eq!(config.batch_size, 25);
        assert_eq!(config.max_retry, 3);
        assert_eq!(config.max_pending_age(), Some(Duration::from_secs(7 * 86_400)));
        assert_eq!(config.schema, "reminders");
    }

    #[test]
    fn database_url_is_built_from_parts() {
        let config = QueueConfig::from_lookup(lookup_from(&[
            ("DB_USER", "app"),
            ("DB_PASSWORD", "secret"),
            ("DB_HOST", "db"),
            ("DB_NAME", "todos"),
        ]))
        .unwrap();

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://app:secret@db:5432/todos")
        );
    }

    #[test]
    fn database_url_wins_over_parts() {
        let config = QueueConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://direct/db"),
            ("DB_USER", "app"),
            ("DB_HOST", "db"),
            ("DB_NAME", "todos"),
        ]))
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://direct/db"));
    }

    #[test]
    fn malformed_number_names_the_variable() {
        let err = QueueConfig::from_lookup(lookup_from(&[("DUEQ_BATCH", "ten")])).unwrap_err();

        assert!(matches!(err, QueueError::Config(msg) if msg.contains("DUEQ_BATCH")));
    }

    #[rstest]
    #[case::zero_batch(&[("DUEQ_BATCH", "0")])]
    #[case::zero_lease(&[("DUEQ_VISIBILITY_TIMEOUT_SECS", "0")])]
    #[case::zero_retries(&[("DUEQ_MAX_RETRIES", "0")])]
    #[case::poll_bounds_inverted(&[("DUEQ_POLL_INTERVAL_MIN_SECS", "60"), ("DUEQ_POLL_INTERVAL_MAX_SECS", "10")])]
    #[case::backoff_bounds_inverted(&[("DUEQ_BACKOFF_BASE_SECS", "7200")])]
    #[case::schema_injection(&[("DUEQ_SCHEMA", "public; DROP TABLE x")])]
    #[case::bad_channel(&[("DUEQ_WAKE_CHANNEL", "wake-me")])]
    fn invalid_settings_are_rejected(#[case] pairs: &[(&str, &str)]) {
        let err = QueueConfig::from_lookup(lookup_from(pairs)).unwrap_err();

        assert!(matches!(err, QueueError::Config(_)));
    }

    #[rstest]
    #[case("public", true)]
    #[case("_dueq_2", true)]
    #[case("2fast", false)]
    #[case("", false)]
    #[case("a.b", false)]
    fn identifier_check(#[case] input: &str, #[case] expected: bool) {
        assert_eq!(is_identifier(input), expected);
    }
}
