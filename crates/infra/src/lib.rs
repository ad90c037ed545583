//! Infrastructure layer: job storage, the lease protocol and the worker loop.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, QueueConfig};
pub use jobs::{
    ClaimOrder, Completion, InMemoryJobStore, JobProducer, JobQueue, JobRunner, JobRunnerConfig,
    JobStore, JobStoreError, LeaseManager, PostgresJobStore, StaleLeaseReclaimer,
};

mod property_tests;
