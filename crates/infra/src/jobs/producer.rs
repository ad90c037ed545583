//! Job producer API.

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use leaseq_core::{Job, JobKey, JobKind, SubjectId};

use super::store::{JobStore, JobStoreError, OnConflict};

/// Inserts job descriptors after an upstream business event.
#[derive(Debug, Clone)]
pub struct JobProducer<S> {
    store: S,
}

impl<S: JobStore> JobProducer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Insert one NEW job per distinct kind for `subject_id`, atomically.
    ///
    /// Fails with [`JobStoreError::AlreadyExists`] if any (subject, kind)
    /// already has a row in any status; nothing is inserted in that case.
    pub async fn enqueue(
        &self,
        subject_id: impl AsRef<str>,
        kinds: &[JobKind],
    ) -> Result<Vec<JobKey>, JobStoreError> {
        self.enqueue_at(subject_id, kinds, Utc::now()).await
    }

    pub async fn enqueue_at(
        &self,
        subject_id: impl AsRef<str>,
        kinds: &[JobKind],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobKey>, JobStoreError> {
        self.insert(subject_id.as_ref(), kinds, now, OnConflict::Fail)
            .await
    }

    /// Like [`enqueue`](Self::enqueue), but kinds that already have a row are
    /// skipped. Existing rows are left as they are, whatever their status.
    /// Returns the keys actually inserted.
    pub async fn enqueue_if_absent(
        &self,
        subject_id: impl AsRef<str>,
        kinds: &[JobKind],
    ) -> Result<Vec<JobKey>, JobStoreError> {
        self.enqueue_if_absent_at(subject_id, kinds, Utc::now()).await
    }

    pub async fn enqueue_if_absent_at(
        &self,
        subject_id: impl AsRef<str>,
        kinds: &[JobKind],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobKey>, JobStoreError> {
        self.insert(subject_id.as_ref(), kinds, now, OnConflict::Skip)
            .await
    }

    #[instrument(skip(self, kinds, now), fields(kinds = ?kinds), err)]
    async fn insert(
        &self,
        subject_id: &str,
        kinds: &[JobKind],
        now: DateTime<Utc>,
        on_conflict: OnConflict,
    ) -> Result<Vec<JobKey>, JobStoreError> {
        let subject = SubjectId::new(subject_id)
            .map_err(|e| JobStoreError::Invalid(e.to_string()))?;

        let jobs = build_jobs(&subject, kinds, now);
        if jobs.is_empty() {
            return Ok(vec![]);
        }

        let inserted = self.store.insert_jobs(&jobs, on_conflict).await?;
        info!(count = inserted.len(), "enqueued jobs");
        Ok(inserted)
    }
}

/// One NEW job per distinct kind, in first-seen order.
fn build_jobs(subject: &SubjectId, kinds: &[JobKind], now: DateTime<Utc>) -> Vec<Job> {
    let mut jobs: Vec<Job> = Vec::with_capacity(kinds.len());
    for kind in kinds {
        if jobs.iter().any(|j| j.kind == *kind) {
            continue;
        }
        jobs.push(Job::new(subject.clone(), *kind, now));
    }
    jobs
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use leaseq_core::JobStatus;

    use super::*;
    use crate::jobs::lease::LeaseManager;
    use crate::jobs::store::InMemoryJobStore;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn enqueue_creates_one_new_row_per_kind() {
        let store = InMemoryJobStore::arc();
        let producer = JobProducer::new(store.clone());

        let keys = producer
            .enqueue_at(
                "order-7",
                &[JobKind::Notify, JobKind::Publish, JobKind::Notify],
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);

        for key in &keys {
            let job = store.get(key).await.unwrap().unwrap().decode().unwrap();
            assert_eq!(job.status, JobStatus::New);
            assert_eq!(job.created, t0());
            assert_eq!(job.updated, t0());
        }
        assert_eq!(store.stats().await.unwrap().new, 2);
    }

    #[tokio::test]
    async fn re_enqueue_is_a_constraint_violation_in_every_status() {
        let store = InMemoryJobStore::arc();
        let producer = JobProducer::new(store.clone());
        let manager = LeaseManager::new(store.clone());

        producer.enqueue_at("S1", &[JobKind::Notify], t0()).await.unwrap();
        let err = producer.enqueue("S1", &[JobKind::Notify]).await.unwrap_err();
        assert!(matches!(err, JobStoreError::AlreadyExists(_)));

        let claimed = manager.claim_next_at(t0()).await.unwrap().unwrap();
        let err = producer.enqueue("S1", &[JobKind::Notify]).await.unwrap_err();
        assert!(matches!(err, JobStoreError::AlreadyExists(_)));

        manager.mark_done(&claimed).await.unwrap();
        let err = producer
            .enqueue("S1", &[JobKind::Publish, JobKind::Notify])
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::AlreadyExists(ref k) if k.kind == JobKind::Notify));
        assert_eq!(store.stats().await.unwrap().total(), 1, "batch must not be partially inserted");
    }

    #[tokio::test]
    async fn enqueue_if_absent_never_re_arms() {
        let store = InMemoryJobStore::arc();
        let producer = JobProducer::new(store.clone());
        let manager = LeaseManager::new(store.clone());

        producer.enqueue_at("S1", &[JobKind::Notify], t0()).await.unwrap();
        let claimed = manager.claim_next_at(t0()).await.unwrap().unwrap();
        manager.mark_done(&claimed).await.unwrap();

        let later = t0() + ChronoDuration::hours(1);
        let inserted = producer
            .enqueue_if_absent_at("S1", &[JobKind::Notify, JobKind::RegistrySync], later)
            .await
            .unwrap();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].kind, JobKind::RegistrySync);

        let notify = store.get(&claimed.key()).await.unwrap().unwrap();
        assert_eq!(notify.status, "DONE");

        let again = producer
            .enqueue_if_absent_at("S1", &[JobKind::Notify, JobKind::RegistrySync], later)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn empty_kinds_is_a_no_op() {
        let store = InMemoryJobStore::arc();
        let producer = JobProducer::new(store.clone());
        assert!(producer.enqueue("S1", &[]).await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn empty_subject_is_rejected() {
        let producer = JobProducer::new(InMemoryJobStore::arc());
        let err = producer.enqueue("", &[JobKind::Notify]).await.unwrap_err();
        assert!(matches!(err, JobStoreError::Invalid(_)));
    }

    #[test]
    fn build_jobs_dedups_in_first_seen_order() {
        let subject = SubjectId::new("S1").unwrap();
        let jobs = build_jobs(
            &subject,
            &[JobKind::Publish, JobKind::Notify, JobKind::Publish],
            t0(),
        );
        let kinds: Vec<_> = jobs.iter().map(|j| j.kind).collect();
        assert_eq!(kinds, vec![JobKind::Publish, JobKind::Notify]);
    }
}
