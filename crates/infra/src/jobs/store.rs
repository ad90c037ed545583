//! Job storage abstraction and the in-memory implementation.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use leaseq_core::{DecodeError, Job, JobKey, JobKind, JobStatus, RawJob, TransitionError};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    /// Connection, transport or pool failure. Not retried internally.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// Insert hit an existing (subject_id, kind) row.
    #[error("job already exists: {0}")]
    AlreadyExists(JobKey),
    /// Any other integrity constraint violation.
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("job not found: {0}")]
    NotFound(JobKey),
    /// Input rejected before reaching storage.
    #[error("invalid request: {0}")]
    Invalid(String),
    /// A single requested row failed to decode.
    #[error("undecodable job row: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// What a batch insert does when a key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnConflict {
    /// Fail the whole batch; nothing is inserted.
    #[default]
    Fail,
    /// Insert only absent keys and leave existing rows untouched.
    Skip,
}

/// Scan order used when picking the next NEW job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOrder {
    /// Most recently created first.
    #[default]
    NewestFirst,
    /// Oldest created first (FIFO).
    OldestFirst,
}

/// Row counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub new: u64,
    pub in_progress: u64,
    pub done: u64,
    /// Rows whose status column does not decode.
    pub undecodable: u64,
}

impl JobStats {
    pub fn total(&self) -> u64 {
        self.new + self.in_progress + self.done + self.undecodable
    }

    pub(crate) fn add(&mut self, status: &str, n: u64) {
        match status.parse::<JobStatus>() {
            Ok(JobStatus::New) => self.new += n,
            Ok(JobStatus::InProgress) => self.in_progress += n,
            Ok(JobStatus::Done) => self.done += n,
            Err(_) => self.undecodable += n,
        }
    }
}

/// Job store abstraction.
///
/// Reads return [`RawJob`] so that decoding (and its failures) stays per-row
/// in the caller.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a batch in one transaction. Returns the keys actually inserted.
    async fn insert_jobs(
        &self,
        jobs: &[Job],
        on_conflict: OnConflict,
    ) -> Result<Vec<JobKey>, JobStoreError>;

    /// Set `status`/`updated` on the row matching `job`'s identity whose
    /// current status is `expected`. Returns rows affected; 0 means the
    /// caller lost a race.
    async fn update_job(&self, job: &Job, expected: JobStatus) -> Result<u64, JobStoreError>;

    /// Set `status`/`updated` on the IN_PROGRESS row matching `job`'s
    /// identity only while its `updated` still equals `lease`, the stamp the
    /// holder was handed at claim or last renewal. 0 means the lease was
    /// reclaimed (and possibly re-claimed) or the job finished.
    async fn update_lease(&self, job: &Job, lease: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// Open a claim transaction whose session gives up after `idle_timeout`
    /// of inactivity.
    async fn begin_claim(&self, idle_timeout: Duration) -> Result<Box<dyn ClaimTx>, JobStoreError>;

    /// Reset every IN_PROGRESS row with `updated < cutoff` to NEW, stamping
    /// `now`, in one transaction. Returns the rows reset.
    async fn reset_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RawJob>, JobStoreError>;

    async fn get(&self, key: &JobKey) -> Result<Option<RawJob>, JobStoreError>;

    /// Newest-created first, optionally filtered by status.
    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<RawJob>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// An open claim transaction.
///
/// Dropping it without [`ClaimTx::commit`] rolls it back.
#[async_trait]
pub trait ClaimTx: Send {
    /// Lock and return one NEW row of one of `kinds`, skipping rows already
    /// locked by other transactions and rows with an empty subject.
    async fn select_next_new(
        &mut self,
        order: ClaimOrder,
        kinds: &[JobKind],
    ) -> Result<Option<RawJob>, JobStoreError>;

    /// Identity-matched update inside the transaction; see [`JobStore::update_job`].
    async fn update_job(&mut self, job: &Job, expected: JobStatus) -> Result<u64, JobStoreError>;

    async fn commit(self: Box<Self>) -> Result<(), JobStoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), JobStoreError>;
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn insert_jobs(
        &self,
        jobs: &[Job],
        on_conflict: OnConflict,
    ) -> Result<Vec<JobKey>, JobStoreError> {
        (**self).insert_jobs(jobs, on_conflict).await
    }

    async fn update_job(&self, job: &Job, expected: JobStatus) -> Result<u64, JobStoreError> {
        (**self).update_job(job, expected).await
    }

    async fn update_lease(&self, job: &Job, lease: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).update_lease(job, lease).await
    }

    async fn begin_claim(&self, idle_timeout: Duration) -> Result<Box<dyn ClaimTx>, JobStoreError> {
        (**self).begin_claim(idle_timeout).await
    }

    async fn reset_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RawJob>, JobStoreError> {
        (**self).reset_stale(cutoff, now).await
    }

    async fn get(&self, key: &JobKey) -> Result<Option<RawJob>, JobStoreError> {
        (**self).get(key).await
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<RawJob>, JobStoreError> {
        (**self).list(status, limit).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}

type RowKey = (String, String);

fn row_key(subject_id: &str, kind: &str) -> RowKey {
    (subject_id.to_string(), kind.to_string())
}

fn job_row_key(job: &Job) -> RowKey {
    row_key(job.subject_id.as_str(), job.kind.as_str())
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<RowKey, RawJob>,
    /// Rows locked by open claim transactions.
    locked: HashSet<RowKey>,
}

/// In-memory job store for tests/dev.
///
/// Emulates the two storage capabilities the queue relies on: claim
/// transactions hold row locks that concurrent `select_next_new` calls skip,
/// and their writes become visible only on commit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Write a row verbatim, bypassing validation and uniqueness checks.
    ///
    /// Simulates rows written by another producer version (unknown kinds or
    /// statuses).
    pub fn insert_raw(&self, raw: RawJob) -> Result<(), JobStoreError> {
        let mut state = lock(&self.state)?;
        state.rows.insert(row_key(&raw.subject_id, &raw.kind), raw);
        Ok(())
    }

    /// Number of rows currently locked by open claim transactions.
    pub fn locked_rows(&self) -> Result<usize, JobStoreError> {
        Ok(lock(&self.state)?.locked.len())
    }
}

fn lock(state: &Mutex<MemoryState>) -> Result<MutexGuard<'_, MemoryState>, JobStoreError> {
    state
        .lock()
        .map_err(|_| JobStoreError::Unavailable("in-memory job store lock poisoned".to_string()))
}

fn apply_update(state: &mut MemoryState, job: &Job, expected: JobStatus) -> u64 {
    match state.rows.get_mut(&job_row_key(job)) {
        Some(row) if row.status == expected.as_str() => {
            row.status = job.status.as_str().to_string();
            row.updated = job.updated;
            1
        }
        _ => 0,
    }
}

fn apply_lease_update(state: &mut MemoryState, job: &Job, lease: DateTime<Utc>) -> u64 {
    match state.rows.get_mut(&job_row_key(job)) {
        Some(row) if row.status == JobStatus::InProgress.as_str() && row.updated == lease => {
            row.status = job.status.as_str().to_string();
            row.updated = job.updated;
            1
        }
        _ => 0,
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_jobs(
        &self,
        jobs: &[Job],
        on_conflict: OnConflict,
    ) -> Result<Vec<JobKey>, JobStoreError> {
        let mut state = lock(&self.state)?;

        let mut batch_keys = HashSet::with_capacity(jobs.len());
        let mut accepted = Vec::with_capacity(jobs.len());
        for job in jobs {
            let key = job_row_key(job);
            let exists = state.rows.contains_key(&key) || batch_keys.contains(&key);
            if exists {
                match on_conflict {
                    OnConflict::Fail => return Err(JobStoreError::AlreadyExists(job.key())),
                    OnConflict::Skip => continue,
                }
            }
            batch_keys.insert(key);
            accepted.push(job);
        }

        let mut inserted = Vec::with_capacity(accepted.len());
        for job in accepted {
            state.rows.insert(job_row_key(job), RawJob::from(job));
            inserted.push(job.key());
        }
        Ok(inserted)
    }

    async fn update_job(&self, job: &Job, expected: JobStatus) -> Result<u64, JobStoreError> {
        let mut state = lock(&self.state)?;
        Ok(apply_update(&mut state, job, expected))
    }

    async fn update_lease(&self, job: &Job, lease: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut state = lock(&self.state)?;
        Ok(apply_lease_update(&mut state, job, lease))
    }

    async fn begin_claim(&self, _idle_timeout: Duration) -> Result<Box<dyn ClaimTx>, JobStoreError> {
        // No session to time out here; locks go away with the handle.
        Ok(Box::new(InMemoryClaimTx {
            state: self.state.clone(),
            held: Vec::new(),
            staged: Vec::new(),
            finished: false,
        }))
    }

    async fn reset_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RawJob>, JobStoreError> {
        let mut state = lock(&self.state)?;
        let mut reset = Vec::new();
        for row in state.rows.values_mut() {
            if row.status == JobStatus::InProgress.as_str() && row.updated < cutoff {
                row.status = JobStatus::New.as_str().to_string();
                row.updated = now;
                reset.push(row.clone());
            }
        }
        Ok(reset)
    }

    async fn get(&self, key: &JobKey) -> Result<Option<RawJob>, JobStoreError> {
        let state = lock(&self.state)?;
        Ok(state
            .rows
            .get(&row_key(key.subject_id.as_str(), key.kind.as_str()))
            .cloned())
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<RawJob>, JobStoreError> {
        let state = lock(&self.state)?;
        let mut rows: Vec<RawJob> = state
            .rows
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s.as_str()))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created.cmp(&a.created));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let state = lock(&self.state)?;
        let mut stats = JobStats::default();
        for row in state.rows.values() {
            stats.add(&row.status, 1);
        }
        Ok(stats)
    }
}

/// Claim transaction over [`InMemoryJobStore`].
struct InMemoryClaimTx {
    state: Arc<Mutex<MemoryState>>,
    held: Vec<RowKey>,
    staged: Vec<(Job, JobStatus)>,
    finished: bool,
}

impl InMemoryClaimTx {
    fn release(&mut self, state: &mut MemoryState) {
        for key in self.held.drain(..) {
            state.locked.remove(&key);
        }
        self.staged.clear();
        self.finished = true;
    }
}

#[async_trait]
impl ClaimTx for InMemoryClaimTx {
    async fn select_next_new(
        &mut self,
        order: ClaimOrder,
        kinds: &[JobKind],
    ) -> Result<Option<RawJob>, JobStoreError> {
        let mut state = lock(&self.state)?;

        let eligible = state.rows.iter().filter(|(key, row)| {
            row.status == JobStatus::New.as_str()
                && !row.subject_id.is_empty()
                && kinds.iter().any(|k| k.as_str() == row.kind)
                && !state.locked.contains(*key)
        });
        let picked = match order {
            ClaimOrder::NewestFirst => eligible.max_by(|a, b| a.1.created.cmp(&b.1.created)),
            ClaimOrder::OldestFirst => eligible.min_by(|a, b| a.1.created.cmp(&b.1.created)),
        }
        .map(|(key, row)| (key.clone(), row.clone()));

        let Some((key, row)) = picked else {
            return Ok(None);
        };
        state.locked.insert(key.clone());
        self.held.push(key);
        Ok(Some(row))
    }

    async fn update_job(&mut self, job: &Job, expected: JobStatus) -> Result<u64, JobStoreError> {
        let state = lock(&self.state)?;
        let key = job_row_key(job);

        let current = self
            .staged
            .iter()
            .rev()
            .find(|(staged, _)| job_row_key(staged) == key)
            .map(|(staged, _)| staged.status.as_str())
            .or_else(|| state.rows.get(&key).map(|row| row.status.as_str()));

        if current != Some(expected.as_str()) {
            return Ok(0);
        }
        drop(state);
        self.staged.push((job.clone(), expected));
        Ok(1)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), JobStoreError> {
        let state_handle = self.state.clone();
        let mut state = lock(&state_handle)?;
        let staged = std::mem::take(&mut self.staged);

        // Locked rows can still be rewritten outside a claim (`insert_raw`,
        // plain `update_job`); apply nothing if any staged row moved.
        let mut overlay: Vec<(RowKey, JobStatus)> = Vec::with_capacity(staged.len());
        let mut moved = None;
        for (job, expected) in &staged {
            let key = job_row_key(job);
            let current = overlay
                .iter()
                .rev()
                .find(|(k, _)| *k == key)
                .map(|(_, status)| status.as_str())
                .or_else(|| state.rows.get(&key).map(|row| row.status.as_str()));
            if current != Some(expected.as_str()) {
                moved = Some((job.key(), *expected));
                break;
            }
            overlay.push((key, job.status));
        }
        if let Some((key, expected)) = moved {
            self.release(&mut state);
            return Err(JobStoreError::Constraint(format!(
                "claimed row {key} left {expected} before commit"
            )));
        }

        for (job, expected) in &staged {
            apply_update(&mut state, job, *expected);
        }
        self.release(&mut state);
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), JobStoreError> {
        let state_handle = self.state.clone();
        let mut state = lock(&state_handle)?;
        self.release(&mut state);
        Ok(())
    }
}

impl Drop for InMemoryClaimTx {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let state_handle = self.state.clone();
        if let Ok(mut state) = state_handle.lock() {
            self.release(&mut state);
        };
    }
}
