//! Worker-engine configuration shared by the supervisor and executor.
//! Parsing environment variables into this struct is `jobforge-worker`'s
//! job; this module only owns validation.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("worker_id must be non-empty and contain only alphanumerics, '-', or '_'")]
    InvalidWorkerId,
    #[error("heartbeat_interval * 2 must be less than store_lease_ttl (got heartbeat_interval={heartbeat_interval:?}, store_lease_ttl={store_lease_ttl:?})")]
    HeartbeatCadenceTooSlow {
        heartbeat_interval: Duration,
        store_lease_ttl: Duration,
    },
    #[error("poll_interval, heartbeat_interval, and job_timeout must all be > 0")]
    NonPositiveDuration,
    #[error("claim_limit and max_concurrent must both be > 0")]
    NonPositiveLimit,
}

/// Engine-level configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub claim_limit: i64,
    pub max_concurrent: usize,
    pub job_timeout: Duration,
    pub shutdown_grace: Duration,
    /// The store's lease TTL, used only to validate the heartbeat cadence
    /// against it. The store owns the actual TTL enforcement.
    pub store_lease_ttl: Duration,
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_id.is_empty()
            || !self
                .worker_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::InvalidWorkerId);
        }
        if self.poll_interval.is_zero()
            || self.heartbeat_interval.is_zero()
            || self.job_timeout.is_zero()
        {
            return Err(ConfigError::NonPositiveDuration);
        }
        if self.claim_limit <= 0 || self.max_concurrent == 0 {
            return Err(ConfigError::NonPositiveLimit);
        }
        if self.heartbeat_interval.saturating_mul(2) >= self.store_lease_ttl {
            return Err(ConfigError::HeartbeatCadenceTooSlow {
                heartbeat_interval: self.heartbeat_interval,
                store_lease_ttl: self.store_lease_ttl,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> WorkerConfig {
        WorkerConfig {
            worker_id: "worker-1".to_string(),
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            claim_limit: 10,
            max_concurrent: 10,
            job_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            store_lease_ttl: Duration::from_secs(90),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_worker_id_with_bad_characters() {
        let mut cfg = base();
        cfg.worker_id = "worker 1!".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidWorkerId)));
    }

    #[test]
    fn rejects_heartbeat_cadence_too_close_to_lease_ttl() {
        let mut cfg = base();
        cfg.heartbeat_interval = Duration::from_secs(50);
        cfg.store_lease_ttl = Duration::from_secs(90);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::HeartbeatCadenceTooSlow { .. })
        ));
    }
}
