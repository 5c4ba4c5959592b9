//! Environment-variable configuration shared by the Scheduler and
//! Worker daemon binaries (SPEC_FULL.md §6 CLI surface).

use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Configuration common to both daemons.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub lease_seconds: u64,
    pub worker_id: String,
}

impl CoreConfig {
    /// Loads configuration from the process environment. A missing or
    /// malformed value is a fatal startup error (exit code 1 per the
    /// CLI surface contract), never a silently-applied default for the
    /// required variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required("DATABASE_URL")?;
        let redis_url = env::var("REDIS_URL").ok();
        let lease_seconds = match env::var("LEASE_SECONDS") {
            Ok(v) => v.parse::<u64>().map_err(|_| ConfigError::Invalid {
                name: "LEASE_SECONDS",
                value: v,
            })?,
            Err(_) => 60,
        };
        let worker_id = env::var("WORKER_ID").unwrap_or_else(|_| default_worker_id());

        Ok(Self {
            database_url,
            redis_url,
            lease_seconds,
            worker_id,
        })
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn default_worker_id() -> String {
    let host = hostname_or_unknown();
    let pid = std::process::id();
    let random: u32 = rand::random();
    format!("{host}-{pid}-{random:08x}")
}

fn hostname_or_unknown() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

/// Worker-specific tuning knobs layered on top of [`CoreConfig`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_concurrency: usize,
    pub poll_interval: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_concurrency = match env::var("WORKER_MAX_CONCURRENCY") {
            Ok(v) => v.parse::<usize>().map_err(|_| ConfigError::Invalid {
                name: "WORKER_MAX_CONCURRENCY",
                value: v,
            })?,
            Err(_) => 10,
        };
        let poll_interval_ms = match env::var("WORKER_POLL_INTERVAL_MS") {
            Ok(v) => v.parse::<u64>().map_err(|_| ConfigError::Invalid {
                name: "WORKER_POLL_INTERVAL_MS",
                value: v,
            })?,
            Err(_) => 200,
        };
        Ok(Self {
            max_concurrency,
            poll_interval: Duration::from_millis(poll_interval_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that
    // mutate them so they don't race under the test harness's default
    // multi-threaded runner.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_database_url_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("DATABASE_URL");
        let err = CoreConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn lease_seconds_defaults_to_sixty() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::remove_var("LEASE_SECONDS");
        let config = CoreConfig::from_env().unwrap();
        assert_eq!(config.lease_seconds, 60);
        env::remove_var("DATABASE_URL");
    }

    #[test]
    fn invalid_lease_seconds_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::set_var("LEASE_SECONDS", "not-a-number");
        let err = CoreConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "LEASE_SECONDS", .. }));
        env::remove_var("DATABASE_URL");
        env::remove_var("LEASE_SECONDS");
    }
}
