use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    pub jobs: JobSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            jobs: JobSettings::from_lookup(|key| env::var(key).ok())?,
        })
    }
}

/// Tunables for checkpointing, locking and recovery of research jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSettings {
    /// Checkpoint after this many completed work items.
    pub checkpoint_item_interval: u32,
    /// Checkpoint after this much time since the last checkpoint.
    pub checkpoint_time_interval: Duration,
    /// TTL of the per-job lock.
    pub lock_ttl: Duration,
    /// An IN_PROGRESS job with no checkpoint/update for this long is presumed orphaned.
    pub stale_threshold: Duration,
    /// Time budget for jobs created without an explicit one.
    pub default_time_budget: Duration,
    /// How long pause/timeout wait for the worker to finish its current unit of work.
    pub pause_wait_timeout: Duration,
    /// Run orphaned-job recovery when the process boots.
    pub recover_on_startup: bool,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            checkpoint_item_interval: 10,
            checkpoint_time_interval: Duration::from_secs(120),
            lock_ttl: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(60 * 60),
            default_time_budget: Duration::from_secs(3600),
            pause_wait_timeout: Duration::from_secs(30),
            recover_on_startup: true,
        }
    }
}

impl JobSettings {
    /// Build settings from a key lookup, falling back to defaults for unset keys.
    ///
    /// `Config::from_env` passes `std::env::var`; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let settings = Self {
            checkpoint_item_interval: parse_or(
                &lookup,
                "CHECKPOINT_ITEM_INTERVAL",
                defaults.checkpoint_item_interval,
            )?,
            checkpoint_time_interval: secs_or(
                &lookup,
                "CHECKPOINT_INTERVAL_SECS",
                defaults.checkpoint_time_interval,
            )?,
            lock_ttl: secs_or(&lookup, "JOB_LOCK_TTL_SECS", defaults.lock_ttl)?,
            stale_threshold: secs_or(
                &lookup,
                "STALE_JOB_THRESHOLD_SECS",
                defaults.stale_threshold,
            )?,
            default_time_budget: secs_or(
                &lookup,
                "JOB_TIME_BUDGET_SECS",
                defaults.default_time_budget,
            )?,
            pause_wait_timeout: secs_or(
                &lookup,
                "PAUSE_WAIT_TIMEOUT_SECS",
                defaults.pause_wait_timeout,
            )?,
            recover_on_startup: parse_or(
                &lookup,
                "RECOVER_JOBS_ON_STARTUP",
                defaults.recover_on_startup,
            )?,
        };

        // Pause and timeout hold the lock while they wait for the worker.
        if settings.pause_wait_timeout >= settings.lock_ttl {
            bail!(
                "PAUSE_WAIT_TIMEOUT_SECS ({}s) must be shorter than JOB_LOCK_TTL_SECS ({}s)",
                settings.pause_wait_timeout.as_secs(),
                settings.lock_ttl.as_secs()
            );
        }
        Ok(settings)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", key, raw)),
        None => Ok(default),
    }
}

fn secs_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let settings = JobSettings::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(settings, JobSettings::default());
        assert_eq!(settings.checkpoint_item_interval, 10);
        assert_eq!(settings.checkpoint_time_interval, Duration::from_secs(120));
        assert_eq!(settings.lock_ttl, Duration::from_secs(60));
        assert_eq!(settings.stale_threshold, Duration::from_secs(3600));
        assert_eq!(settings.default_time_budget, Duration::from_secs(3600));
        assert!(settings.recover_on_startup);
    }

    #[test]
    fn test_overrides() {
        let settings = JobSettings::from_lookup(lookup_from(&[
            ("CHECKPOINT_ITEM_INTERVAL", "25"),
            ("JOB_LOCK_TTL_SECS", "5"),
            ("PAUSE_WAIT_TIMEOUT_SECS", "2"),
            ("RECOVER_JOBS_ON_STARTUP", "false"),
        ]))
        .unwrap();

        assert_eq!(settings.checkpoint_item_interval, 25);
        assert_eq!(settings.lock_ttl, Duration::from_secs(5));
        assert!(!settings.recover_on_startup);
        assert_eq!(settings.stale_threshold, Duration::from_secs(3600));
    }

    #[test]
    fn test_invalid_value_names_the_key() {
        let err = JobSettings::from_lookup(lookup_from(&[("JOB_LOCK_TTL_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("JOB_LOCK_TTL_SECS"));
    }

    #[test]
    fn test_pause_wait_must_fit_inside_lock_ttl() {
        let err = JobSettings::from_lookup(lookup_from(&[
            ("JOB_LOCK_TTL_SECS", "30"),
            ("PAUSE_WAIT_TIMEOUT_SECS", "30"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("PAUSE_WAIT_TIMEOUT_SECS"));

        let settings = JobSettings::from_lookup(lookup_from(&[
            ("JOB_LOCK_TTL_SECS", "30"),
            ("PAUSE_WAIT_TIMEOUT_SECS", "29"),
        ]))
        .unwrap();
        assert_eq!(settings.pause_wait_timeout, Duration::from_secs(29));
    }
}
