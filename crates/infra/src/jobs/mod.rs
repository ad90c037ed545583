//! Lease-based job queue on a relational table.
//!
//! ## Design
//!
//! - One row per (subject, kind); status NEW -> IN_PROGRESS -> DONE
//! - Claims use skip-locked row selection, so concurrent workers converge on
//!   disjoint rows instead of queueing behind each other
//! - A lease is just IN_PROGRESS plus `updated`; abandoned leases are reset
//!   to NEW by the reclaimer once older than the lease timeout
//! - Delivery is at-least-once
//!
//! ## Components
//!
//! - `JobStore`: persistence (Postgres or in-memory)
//! - `LeaseManager`: claim protocol, completion, renewal
//! - `StaleLeaseReclaimer`: timeout-based recovery
//! - `JobProducer`: enqueueing after a business event
//! - `JobRunner`: reference worker loop
//! - `JobQueue`: all of the above over one store

pub mod lease;
pub mod postgres;
pub mod producer;
pub mod queue;
pub mod reclaimer;
pub mod runner;
pub mod store;

pub use lease::{Completion, LeaseManager};
pub use postgres::PostgresJobStore;
pub use producer::JobProducer;
pub use queue::{JobQueue, RejectedRow, ScanPage};
pub use reclaimer::StaleLeaseReclaimer;
pub use runner::{HandlerError, JobHandler, JobRunner, JobRunnerConfig, JobRunnerHandle, RunnerStats};
pub use store::{ClaimOrder, ClaimTx, InMemoryJobStore, JobStats, JobStore, JobStoreError, OnConflict};
