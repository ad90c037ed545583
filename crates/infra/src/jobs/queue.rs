//! `JobQueue`: one handle over a store for producers, workers and operators.

use chrono::{DateTime, Utc};
use tracing::warn;

use leaseq_core::{DecodeError, Job, JobKey, JobKind, JobStatus, RawJob};

use crate::config::QueueConfig;

use super::lease::{Completion, LeaseManager};
use super::producer::JobProducer;
use super::reclaimer::StaleLeaseReclaimer;
use super::store::{JobStats, JobStore, JobStoreError};

/// A stored row that failed to decode, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    pub raw: RawJob,
    pub error: DecodeError,
}

/// Result of a listing: decoded jobs plus rows that could not be decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub jobs: Vec<Job>,
    pub rejected: Vec<RejectedRow>,
}

/// Producer, lease manager and reclaimer sharing one store and one config.
#[derive(Debug, Clone)]
pub struct JobQueue<S: Clone> {
    store: S,
    config: QueueConfig,
    producer: JobProducer<S>,
    leases: LeaseManager<S>,
    reclaimer: StaleLeaseReclaimer<S>,
}

impl<S: JobStore + Clone> JobQueue<S> {
    pub fn new(store: S, config: QueueConfig) -> Self {
        Self {
            producer: JobProducer::new(store.clone()),
            leases: LeaseManager::with_config(store.clone(), &config),
            reclaimer: StaleLeaseReclaimer::new(store.clone()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn leases(&self) -> &LeaseManager<S> {
        &self.leases
    }

    pub fn reclaimer(&self) -> &StaleLeaseReclaimer<S> {
        &self.reclaimer
    }

    pub async fn enqueue(
        &self,
        subject_id: impl AsRef<str>,
        kinds: &[JobKind],
    ) -> Result<Vec<JobKey>, JobStoreError> {
        self.producer.enqueue(subject_id, kinds).await
    }

    pub async fn enqueue_if_absent(
        &self,
        subject_id: impl AsRef<str>,
        kinds: &[JobKind],
    ) -> Result<Vec<JobKey>, JobStoreError> {
        self.producer.enqueue_if_absent(subject_id, kinds).await
    }

    pub async fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        self.leases.claim_next().await
    }

    pub async fn mark_done(&self, job: &Job) -> Result<Completion, JobStoreError> {
        self.leases.mark_done(job).await
    }

    /// See [`LeaseManager::renew`]; use the returned job from then on.
    pub async fn renew(&self, job: &Job) -> Result<Option<Job>, JobStoreError> {
        self.leases.renew(job).await
    }

    /// Reclaim with the configured lease timeout.
    pub async fn reclaim_stale(&self) -> Result<u64, JobStoreError> {
        self.reclaimer.reclaim_stale(self.config.lease_timeout).await
    }

    pub async fn reclaim_stale_at(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        self.reclaimer
            .reclaim_stale_at(self.config.lease_timeout, now)
            .await
    }

    /// Fetch and decode one job. A row that does not decode is
    /// [`JobStoreError::Decode`].
    pub async fn get(&self, key: &JobKey) -> Result<Option<Job>, JobStoreError> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(raw.decode()?)),
            None => Ok(None),
        }
    }

    /// List newest first. Undecodable rows are returned separately and never
    /// fail the listing.
    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<ScanPage, JobStoreError> {
        let rows = self.store.list(status, limit).await?;
        Ok(decode_page(rows))
    }

    pub async fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.store.stats().await
    }
}

fn decode_page(rows: Vec<RawJob>) -> ScanPage {
    let mut page = ScanPage::default();
    for raw in rows {
        match raw.decode() {
            Ok(job) => page.jobs.push(job),
            Err(error) => {
                warn!(subject_id = %raw.subject_id, kind = %raw.kind, error = %error, "skipping undecodable job row");
                page.rejected.push(RejectedRow { raw, error });
            }
        }
    }
    page
}
