//! Stale lease reclaimer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use super::store::{JobStore, JobStoreError};

/// Resets jobs stuck IN_PROGRESS past a timeout back to NEW.
///
/// Staleness is elapsed time since the last transition, so a worker whose job
/// runs longer than the timeout (and does not renew) gets its job handed out
/// a second time. Delivery is at-least-once.
#[derive(Debug, Clone)]
pub struct StaleLeaseReclaimer<S> {
    store: S,
}

impl<S: JobStore> StaleLeaseReclaimer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Reset every IN_PROGRESS job last updated more than `timeout` ago.
    /// Returns the number of jobs reset.
    pub async fn reclaim_stale(&self, timeout: Duration) -> Result<u64, JobStoreError> {
        self.reclaim_stale_at(timeout, Utc::now()).await
    }

    #[instrument(skip(self), fields(timeout_ms = timeout.as_millis() as u64), err)]
    pub async fn reclaim_stale_at(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let cutoff = stale_cutoff(timeout, now)?;
        let reset = self.store.reset_stale(cutoff, now).await?;

        let mut undecodable = 0u64;
        for raw in &reset {
            match raw.decode() {
                Ok(job) => info!(job = %job.key(), "reclaimed stale lease"),
                Err(e) => {
                    undecodable += 1;
                    warn!(
                        subject_id = %raw.subject_id,
                        kind = %raw.kind,
                        error = %e,
                        "reclaimed undecodable job row"
                    );
                }
            }
        }

        let count = reset.len() as u64;
        if count > 0 {
            info!(count, undecodable, "stale lease sweep finished");
        }
        Ok(count)
    }
}

fn stale_cutoff(timeout: Duration, now: DateTime<Utc>) -> Result<DateTime<Utc>, JobStoreError> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| now.checked_sub_signed(timeout))
        .ok_or_else(|| JobStoreError::Invalid(format!("lease timeout out of range: {timeout:?}")))
}
