//! Property tests: random operation sequences checked against a model of the
//! job table, and concurrent claim distribution.

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use proptest::prelude::*;

    use leaseq_core::{Job, JobKind, JobStatus};

    use crate::jobs::{
        Completion, InMemoryJobStore, JobProducer, JobStore, JobStoreError, LeaseManager,
        StaleLeaseReclaimer,
    };

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue {
            subject: u8,
            kinds: Vec<JobKind>,
            if_absent: bool,
        },
        Claim,
        Done(usize),
        Renew(usize),
        Reclaim(u8),
        Tick(u8),
    }

    fn kind_strategy() -> impl Strategy<Value = JobKind> {
        prop_oneof![
            Just(JobKind::Notify),
            Just(JobKind::Publish),
            Just(JobKind::RegistrySync),
        ]
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u8..4, prop::collection::vec(kind_strategy(), 0..4), any::<bool>())
                .prop_map(|(subject, kinds, if_absent)| Op::Enqueue { subject, kinds, if_absent }),
            4 => Just(Op::Claim),
            2 => any::<usize>().prop_map(Op::Done),
            1 => any::<usize>().prop_map(Op::Renew),
            2 => (0u8..6).prop_map(Op::Reclaim),
            2 => (1u8..4).prop_map(Op::Tick),
        ]
    }

    type Model = BTreeMap<(String, JobKind), (JobStatus, DateTime<Utc>)>;

    /// Apply `ops` to a fresh store and to the model; return the first
    /// divergence.
    async fn run_against_model(ops: Vec<Op>) -> Result<(), String> {
        let store = InMemoryJobStore::arc();
        let producer = JobProducer::new(store.clone());
        let leases = LeaseManager::new(store.clone());
        let reclaimer = StaleLeaseReclaimer::new(store.clone());

        let mut model = Model::new();
        let mut held: Vec<Job> = Vec::new();
        let mut now = t0();

        for op in ops {
            match op {
                Op::Enqueue { subject, kinds, if_absent } => {
                    let subject = format!("S{subject}");
                    let mut distinct: Vec<JobKind> = Vec::new();
                    for kind in kinds {
                        if !distinct.contains(&kind) {
                            distinct.push(kind);
                        }
                    }
                    let missing: Vec<JobKind> = distinct
                        .iter()
                        .copied()
                        .filter(|k| !model.contains_key(&(subject.clone(), *k)))
                        .collect();

                    if if_absent {
                        let inserted = producer
                            .enqueue_if_absent_at(&subject, &distinct, now)
                            .await
                            .map_err(|e| e.to_string())?;
                        if inserted.len() != missing.len() {
                            return Err(format!("enqueue_if_absent inserted {inserted:?}, expected {missing:?}"));
                        }
                        for kind in missing {
                            model.insert((subject.clone(), kind), (JobStatus::New, now));
                        }
                    } else {
                        let result = producer.enqueue_at(&subject, &distinct, now).await;
                        match (result, missing.len() == distinct.len()) {
                            (Ok(keys), true) => {
                                if keys.len() != distinct.len() {
                                    return Err(format!("enqueue returned {keys:?}"));
                                }
                                for kind in distinct {
                                    model.insert((subject.clone(), kind), (JobStatus::New, now));
                                }
                            }
                            (Err(JobStoreError::AlreadyExists(_)), false) => {}
                            (other, _) => {
                                return Err(format!("enqueue {subject} {distinct:?}: unexpected {other:?}"));
                            }
                        }
                    }
                }
                Op::Claim => {
                    let claimed = leases.claim_next_at(now).await.map_err(|e| e.to_string())?;
                    let any_new = model.values().any(|(s, _)| *s == JobStatus::New);
                    match claimed {
                        Some(job) => {
                            let entry = model
                                .get_mut(&(job.subject_id.to_string(), job.kind))
                                .ok_or("claimed a job the model does not know")?;
                            if entry.0 != JobStatus::New {
                                return Err(format!("claimed {} in status {}", job.key(), entry.0));
                            }
                            *entry = (JobStatus::InProgress, now);
                            held.push(job);
                        }
                        None if any_new => return Err("NEW job left unclaimed".into()),
                        None => {}
                    }
                }
                Op::Done(i) => {
                    if held.is_empty() {
                        continue;
                    }
                    let job = held[i % held.len()].clone();
                    let completion = leases.mark_done_at(&job, now).await.map_err(|e| e.to_string())?;
                    let entry = model
                        .get_mut(&(job.subject_id.to_string(), job.kind))
                        .ok_or("held job missing from model")?;
                    let expected = match entry.0 {
                        JobStatus::InProgress if entry.1 == job.updated => {
                            *entry = (JobStatus::Done, now);
                            Completion::Completed
                        }
                        JobStatus::Done => Completion::AlreadyDone,
                        JobStatus::InProgress | JobStatus::New => Completion::LeaseLost,
                    };
                    if completion != expected {
                        return Err(format!("mark_done {}: got {completion:?}, expected {expected:?}", job.key()));
                    }
                }
                Op::Renew(i) => {
                    if held.is_empty() {
                        continue;
                    }
                    let slot = i % held.len();
                    let job = held[slot].clone();
                    let renewed = leases.renew_at(&job, now).await.map_err(|e| e.to_string())?;
                    let entry = model
                        .get_mut(&(job.subject_id.to_string(), job.kind))
                        .ok_or("held job missing from model")?;
                    let expected = entry.0 == JobStatus::InProgress && entry.1 == job.updated;
                    match renewed {
                        Some(renewed) if expected => {
                            entry.1 = now;
                            if renewed.updated != now {
                                return Err(format!("renew {} stamped {}", job.key(), renewed.updated));
                            }
                            held[slot] = renewed;
                        }
                        None if !expected => {}
                        other => {
                            return Err(format!("renew {}: got {other:?}, expected held={expected}", job.key()));
                        }
                    }
                }
                Op::Reclaim(secs) => {
                    let timeout = Duration::from_secs(u64::from(secs));
                    let cutoff = now - ChronoDuration::seconds(i64::from(secs));
                    let count = reclaimer
                        .reclaim_stale_at(timeout, now)
                        .await
                        .map_err(|e| e.to_string())?;
                    let mut expected = 0u64;
                    for entry in model.values_mut() {
                        if entry.0 == JobStatus::InProgress && entry.1 < cutoff {
                            *entry = (JobStatus::New, now);
                            expected += 1;
                        }
                    }
                    if count != expected {
                        return Err(format!("reclaimed {count}, expected {expected}"));
                    }
                }
                Op::Tick(secs) => now += ChronoDuration::seconds(i64::from(secs)),
            }

            check_store_matches(&store, &model).await?;
        }
        Ok(())
    }

    async fn check_store_matches(store: &InMemoryJobStore, model: &Model) -> Result<(), String> {
        let rows = store.list(None, usize::MAX).await.map_err(|e| e.to_string())?;
        if rows.len() != model.len() {
            return Err(format!("store has {} rows, model {}", rows.len(), model.len()));
        }
        for raw in rows {
            let job = raw.decode().map_err(|e| e.to_string())?;
            let Some((status, updated)) = model.get(&(job.subject_id.to_string(), job.kind)) else {
                return Err(format!("unexpected row {}", job.key()));
            };
            if job.status != *status || job.updated != *updated {
                return Err(format!(
                    "{}: store ({}, {}) vs model ({}, {})",
                    job.key(),
                    job.status,
                    job.updated,
                    status,
                    updated
                ));
            }
        }
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: any sequence of enqueue/claim/done/renew/reclaim keeps the
        /// table identical to the state machine model, every claim hands out
        /// a job that was NEW, and only the current lease holder can complete
        /// or renew.
        #[test]
        fn operations_follow_the_state_machine(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let outcome = rt.block_on(run_against_model(ops));
            prop_assert!(outcome.is_ok(), "{}", outcome.unwrap_err());
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            ..ProptestConfig::default()
        })]

        /// Property: N concurrent claimers and M NEW jobs hand out exactly
        /// min(M, N) distinct jobs.
        #[test]
        fn concurrent_claims_never_share_a_job(jobs in 0usize..12, callers in 1usize..16) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .build()
                .unwrap();

            let (claimed, in_progress) = rt.block_on(async {
                let store = InMemoryJobStore::arc();
                let producer = JobProducer::new(store.clone());
                for i in 0..jobs {
                    producer.enqueue(format!("S{i}"), &[JobKind::Notify]).await.unwrap();
                }

                let mut handles = Vec::new();
                for _ in 0..callers {
                    let leases = LeaseManager::new(Arc::clone(&store));
                    handles.push(tokio::spawn(async move { leases.claim_next().await.unwrap() }));
                }

                let mut claimed = Vec::new();
                for handle in handles {
                    if let Some(job) = handle.await.unwrap() {
                        claimed.push(job.key());
                    }
                }
                let in_progress = store.stats().await.unwrap().in_progress;
                (claimed, in_progress)
            });

            let distinct: HashSet<_> = claimed.iter().cloned().collect();
            prop_assert_eq!(claimed.len(), jobs.min(callers));
            prop_assert_eq!(distinct.len(), claimed.len());
            prop_assert_eq!(in_progress as usize, claimed.len());
        }
    }
}
