//! Lease manager: the claim protocol, completion and lease renewal.

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use tracing::{debug, info, instrument};

use leaseq_core::{Job, JobKind, JobStatus};

use crate::config::QueueConfig;

use super::store::{ClaimOrder, JobStore, JobStoreError};

/// Outcome of [`LeaseManager::mark_done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// IN_PROGRESS -> DONE.
    Completed,
    /// Already DONE. No-op.
    AlreadyDone,
    /// The lease was reclaimed before completion was reported. The row is
    /// NEW again or IN_PROGRESS under a newer holder and is left untouched.
    LeaseLost,
}

/// Claims jobs for exclusive processing.
///
/// Holds no state between calls: all mutual exclusion comes from the row
/// locks taken by the store's claim transaction. A claimed job's `updated`
/// doubles as its lease stamp; completion and renewal only apply while the
/// row still carries it.
#[derive(Debug, Clone)]
pub struct LeaseManager<S> {
    store: S,
    order: ClaimOrder,
    idle_timeout: Duration,
}

impl<S: JobStore> LeaseManager<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, &QueueConfig::default())
    }

    pub fn with_config(store: S, config: &QueueConfig) -> Self {
        Self {
            store,
            order: config.claim_order,
            idle_timeout: config.idle_session_timeout,
        }
    }

    pub fn with_claim_order(mut self, order: ClaimOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn claim_order(&self) -> ClaimOrder {
        self.order
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Claim one NEW job of any kind. `None` means nothing to do this tick.
    pub async fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        self.claim_next_for(&JobKind::ALL, Utc::now()).await
    }

    pub async fn claim_next_at(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        self.claim_next_for(&JobKind::ALL, now).await
    }

    /// Claim one NEW job whose kind is in `kinds`.
    ///
    /// The returned job is IN_PROGRESS with `updated = now` and is held by
    /// this caller alone. Storage errors roll back and propagate; a lost race
    /// is `Ok(None)`.
    #[instrument(skip(self, kinds), fields(order = ?self.order), err)]
    pub async fn claim_next_for(
        &self,
        kinds: &[JobKind],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        if kinds.is_empty() {
            return Ok(None);
        }

        // Every early return below drops `tx`, which rolls it back.
        let mut tx = self.store.begin_claim(self.idle_timeout).await?;

        let Some(raw) = tx.select_next_new(self.order, kinds).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let mut job = raw.decode()?;
        job.mark_in_progress(lease_stamp(now))?;

        let affected = tx.update_job(&job, JobStatus::New).await?;
        if affected != 1 {
            debug!(job = %job.key(), affected, "lost claim race");
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;
        info!(job = %job.key(), "claimed job");
        Ok(Some(job))
    }

    /// Report a claimed job as finished.
    pub async fn mark_done(&self, job: &Job) -> Result<Completion, JobStoreError> {
        self.mark_done_at(job, Utc::now()).await
    }

    #[instrument(skip(self, job), fields(job = %job.key()), err)]
    pub async fn mark_done_at(
        &self,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<Completion, JobStoreError> {
        let done = Job {
            status: JobStatus::Done,
            updated: now,
            ..job.clone()
        };
        if self.store.update_lease(&done, job.updated).await? == 1 {
            info!("job done");
            return Ok(Completion::Completed);
        }

        let key = job.key();
        let Some(raw) = self.store.get(&key).await? else {
            return Err(JobStoreError::NotFound(key));
        };
        match raw.status.parse::<JobStatus>()? {
            JobStatus::Done => {
                debug!("job already done");
                Ok(Completion::AlreadyDone)
            }
            JobStatus::New | JobStatus::InProgress => {
                debug!(status = %raw.status, "lease lost before completion");
                Ok(Completion::LeaseLost)
            }
        }
    }

    /// Heartbeat: refresh `updated` on a held lease so the reclaimer leaves
    /// it alone.
    ///
    /// Returns the job carrying the new lease stamp, which later `renew` and
    /// `mark_done` calls must use. `None` when the lease is no longer held.
    pub async fn renew(&self, job: &Job) -> Result<Option<Job>, JobStoreError> {
        self.renew_at(job, Utc::now()).await
    }

    #[instrument(skip(self, job), fields(job = %job.key()), err)]
    pub async fn renew_at(&self, job: &Job, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut renewed = job.clone();
        renewed.renew(lease_stamp(now))?;
        if self.store.update_lease(&renewed, job.updated).await? == 1 {
            Ok(Some(renewed))
        } else {
            debug!("lease no longer held");
            Ok(None)
        }
    }
}

/// Postgres keeps microseconds; a stamp must read back exactly as written.
fn lease_stamp(now: DateTime<Utc>) -> DateTime<Utc> {
    now.trunc_subsecs(6)
}
