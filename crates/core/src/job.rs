//! Job record, its closed vocabularies, and decoding from persisted rows.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, DecodeResult, TransitionError};
use crate::id::SubjectId;

/// Kind of deferred work. Closed set; storage values outside it fail to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    /// Notify interested parties that the subject changed.
    Notify,
    /// Publish the subject to downstream consumers.
    Publish,
    /// Push the subject to an external registry.
    RegistrySync,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Notify, JobKind::Publish, JobKind::RegistrySync];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Notify => "NOTIFY",
            JobKind::Publish => "PUBLISH",
            JobKind::RegistrySync => "REGISTRY_SYNC",
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOTIFY" => Ok(JobKind::Notify),
            "PUBLISH" => Ok(JobKind::Publish),
            "REGISTRY_SYNC" => Ok(JobKind::RegistrySync),
            other => Err(DecodeError::UnknownKind(other.to_string())),
        }
    }
}

/// Lease state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Eligible to be claimed.
    New,
    /// Leased by exactly one claimer.
    InProgress,
    /// Finished. Terminal.
    Done,
}

impl JobStatus {
    pub const ALL: [JobStatus; 3] = [JobStatus::New, JobStatus::InProgress, JobStatus::Done];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "NEW",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Done => "DONE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done)
    }

    /// Whether `self -> next` is an edge of the lease state machine.
    ///
    /// `IN_PROGRESS -> IN_PROGRESS` is a lease renewal.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::New, JobStatus::InProgress)
                | (JobStatus::InProgress, JobStatus::New)
                | (JobStatus::InProgress, JobStatus::Done)
                | (JobStatus::InProgress, JobStatus::InProgress)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(JobStatus::New),
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "DONE" => Ok(JobStatus::Done),
            other => Err(DecodeError::UnknownStatus(other.to_string())),
        }
    }
}

/// Identity of a job: one row per (subject, kind).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub subject_id: SubjectId,
    pub kind: JobKind,
}

impl JobKey {
    pub fn new(subject_id: SubjectId, kind: JobKind) -> Self {
        Self { subject_id, kind }
    }
}

impl core::fmt::Display for JobKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.subject_id, self.kind)
    }
}

/// A unit of deferred work tied to a business record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub subject_id: SubjectId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Insertion time. Only used to order claims.
    pub created: DateTime<Utc>,
    /// Time of the last transition. Sole staleness signal.
    pub updated: DateTime<Utc>,
}

impl Job {
    /// Create a fresh, claimable job.
    pub fn new(subject_id: SubjectId, kind: JobKind, now: DateTime<Utc>) -> Self {
        Self {
            subject_id,
            kind,
            status: JobStatus::New,
            created: now,
            updated: now,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.subject_id.clone(), self.kind)
    }

    /// Move to `next`, stamping `updated`.
    pub fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated = now;
        Ok(())
    }

    pub fn mark_in_progress(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::InProgress, now)
    }

    pub fn mark_done(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Done, now)
    }

    /// Hand an abandoned lease back to the queue.
    pub fn mark_reclaimed(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::New, now)
    }

    /// Heartbeat: keep the lease alive without changing state. Only an
    /// IN_PROGRESS job has a lease to renew.
    pub fn renew(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != JobStatus::InProgress {
            return Err(TransitionError {
                from: self.status,
                to: JobStatus::InProgress,
            });
        }
        self.updated = now;
        Ok(())
    }

    /// Whether an in-progress lease was last touched strictly before `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::InProgress && self.updated < cutoff
    }
}

/// A job row exactly as storage returned it, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawJob {
    pub subject_id: String,
    pub kind: String,
    pub status: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl RawJob {
    /// Decode into the closed model. Fails for this row only.
    pub fn decode(&self) -> DecodeResult<Job> {
        Ok(Job {
            subject_id: SubjectId::new(self.subject_id.as_str())?,
            kind: self.kind.parse()?,
            status: self.status.parse()?,
            created: self.created,
            updated: self.updated,
        })
    }
}

impl TryFrom<RawJob> for Job {
    type Error = DecodeError;

    fn try_from(raw: RawJob) -> Result<Self, Self::Error> {
        raw.decode()
    }
}

impl From<&Job> for RawJob {
    fn from(job: &Job) -> Self {
        Self {
            subject_id: job.subject_id.as_str().to_string(),
            kind: job.kind.as_str().to_string(),
            status: job.status.as_str().to_string(),
            created: job.created,
            updated: job.updated,
        }
    }
}
