//! Process-level configuration: environment variables in, a validated
//! [`jobforge_core::WorkerConfig`] out.

use std::env;
use std::time::Duration;

use jobforge_core::WorkerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be set")]
    Missing { var: &'static str },
    #[error("{var}={value:?} is not a valid {kind}")]
    Invalid {
        var: &'static str,
        value: String,
        kind: &'static str,
    },
    #[error(transparent)]
    Validation(#[from] jobforge_core::ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl std::str::FromStr for Environment {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            _ => Err(()),
        }
    }
}

pub struct AppConfig {
    pub worker: WorkerConfig,
    pub database_url: String,
    pub environment: Environment,
}

fn env_string(var: &'static str, default: Option<&str>) -> Result<String, ConfigError> {
    match env::var(var) {
        Ok(value) => Ok(value),
        Err(_) => default
            .map(|d| d.to_string())
            .ok_or(ConfigError::Missing { var }),
    }
}

fn env_u64(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(var) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
            var,
            value,
            kind: "integer",
        }),
        Err(_) => Ok(default),
    }
}

fn env_i64(var: &'static str, default: i64) -> Result<i64, ConfigError> {
    match env::var(var) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
            var,
            value,
            kind: "integer",
        }),
        Err(_) => Ok(default),
    }
}

/// Loads and validates the process configuration from the environment.
/// Called once at startup; any error here is fatal (exit code 2).
pub fn load_from_env() -> Result<AppConfig, ConfigError> {
    let worker_id = env_string("WORKER_ID", None).unwrap_or_else(|_| {
        format!("worker-{}", std::process::id())
    });
    let database_url = env_string("QUEUE_URL", None)?;

    let poll_interval = Duration::from_secs(env_u64("POLL_INTERVAL_S", 2)?);
    let heartbeat_interval = Duration::from_secs(env_u64("HEARTBEAT_INTERVAL_S", 30)?);
    let claim_limit = env_i64("CLAIM_LIMIT", 10)?;
    let max_concurrent = env_i64("MAX_CONCURRENT", claim_limit)?.max(1) as usize;
    let job_timeout = Duration::from_secs(env_u64("JOB_TIMEOUT_S", 30)?);
    let shutdown_grace = Duration::from_secs(env_u64("SHUTDOWN_GRACE_S", 30)?);
    let store_lease_ttl = Duration::from_secs(env_u64("STORE_LEASE_TTL_S", 90)?);

    let environment = env_string("ENVIRONMENT", Some("development"))?
        .parse()
        .map_err(|_| ConfigError::Invalid {
            var: "ENVIRONMENT",
            value: env::var("ENVIRONMENT").unwrap_or_default(),
            kind: "one of development|production|test",
        })?;

    let worker = WorkerConfig {
        worker_id,
        poll_interval,
        heartbeat_interval,
        claim_limit,
        max_concurrent,
        job_timeout,
        shutdown_grace,
        store_lease_ttl,
    };
    worker.validate()?;

    Ok(AppConfig {
        worker,
        database_url,
        environment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_known_values_only() {
        assert_eq!("production".parse::<Environment>(), Ok(Environment::Production));
        assert!("staging".parse::<Environment>().is_err());
    }
}
