//! `leaseq-core`: job model for the lease-based queue.
//!
//! This crate contains **pure** model types (no storage concerns): the job
//! record, its closed status/kind vocabularies and the decoding of raw
//! storage rows into them.

pub mod error;
pub mod id;
pub mod job;

pub use error::{DecodeError, DecodeResult, TransitionError};
pub use id::{RunnerId, SubjectId};
pub use job::{Job, JobKey, JobKind, JobStatus, RawJob};
