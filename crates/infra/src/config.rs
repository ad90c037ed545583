//! Queue configuration loading and representation.

use std::time::Duration;

use crate::jobs::ClaimOrder;

pub const ENV_CLAIM_ORDER: &str = "LEASEQ_CLAIM_ORDER";
pub const ENV_LEASE_TIMEOUT_SECS: &str = "LEASEQ_LEASE_TIMEOUT_SECS";
pub const ENV_IDLE_TIMEOUT_SECS: &str = "LEASEQ_IDLE_TIMEOUT_SECS";
pub const ENV_POLL_INTERVAL_MS: &str = "LEASEQ_POLL_INTERVAL_MS";
pub const ENV_RECLAIM_INTERVAL_SECS: &str = "LEASEQ_RECLAIM_INTERVAL_SECS";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Tunables shared by the lease manager, the reclaimer and the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Scan order used when claiming.
    pub claim_order: ClaimOrder,
    /// IN_PROGRESS rows untouched for longer than this are reclaimed.
    ///
    /// Must exceed the worst plausible processing time of a single job,
    /// otherwise a slow but live worker's job gets handed out twice.
    pub lease_timeout: Duration,
    /// Idle bound on the claim transaction's session.
    pub idle_session_timeout: Duration,
    /// Idle poll cadence of each worker.
    pub poll_interval: Duration,
    /// Cadence of the stale lease sweep.
    pub reclaim_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            claim_order: ClaimOrder::NewestFirst,
            lease_timeout: Duration::from_secs(5 * 60),
            idle_session_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            reclaim_interval: Duration::from_secs(60),
        }
    }
}

impl QueueConfig {
    pub fn with_claim_order(mut self, order: ClaimOrder) -> Self {
        self.claim_order = order;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_idle_session_timeout(mut self, timeout: Duration) -> Self {
        self.idle_session_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// Load from `LEASEQ_*` environment variables. Unset variables keep
    /// their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_CLAIM_ORDER) {
            config.claim_order = parse_claim_order(&value)?;
        }
        if let Some(value) = lookup(ENV_LEASE_TIMEOUT_SECS) {
            config.lease_timeout = Duration::from_secs(parse_positive(ENV_LEASE_TIMEOUT_SECS, &value)?);
        }
        if let Some(value) = lookup(ENV_IDLE_TIMEOUT_SECS) {
            config.idle_session_timeout =
                Duration::from_secs(parse_positive(ENV_IDLE_TIMEOUT_SECS, &value)?);
        }
        if let Some(value) = lookup(ENV_POLL_INTERVAL_MS) {
            config.poll_interval = Duration::from_millis(parse_positive(ENV_POLL_INTERVAL_MS, &value)?);
        }
        if let Some(value) = lookup(ENV_RECLAIM_INTERVAL_SECS) {
            config.reclaim_interval =
                Duration::from_secs(parse_positive(ENV_RECLAIM_INTERVAL_SECS, &value)?);
        }

        Ok(config)
    }
}

fn parse_claim_order(value: &str) -> Result<ClaimOrder, ConfigError> {
    match value.trim() {
        "newest_first" => Ok(ClaimOrder::NewestFirst),
        "oldest_first" => Ok(ClaimOrder::OldestFirst),
        other => Err(ConfigError::Invalid {
            var: ENV_CLAIM_ORDER,
            value: other.to_string(),
            reason: "expected newest_first or oldest_first".to_string(),
        }),
    }
}

fn parse_positive(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    };
    match value.trim().parse::<u64>() {
        Ok(0) => Err(invalid("must be greater than zero")),
        Ok(n) => Ok(n),
        Err(e) => Err(invalid(&e.to_string())),
    }
}
