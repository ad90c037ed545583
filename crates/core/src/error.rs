//! Job model error types.

use thiserror::Error;

use crate::job::JobStatus;

/// Result type for decoding persisted job rows.
pub type DecodeResult<T> = Result<T, DecodeError>;

/// A persisted value could not be decoded into the closed job model.
///
/// Decode failures are scoped to a single row. Callers sweeping over many rows
/// must log and skip the offending row rather than abort the sweep.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The `status` column held a value outside the known set.
    #[error("unknown job status: {0:?}")]
    UnknownStatus(String),

    /// The `kind` column held a value outside the known set.
    #[error("unknown job kind: {0:?}")]
    UnknownKind(String),

    /// The subject identifier was empty.
    #[error("subject id must not be empty")]
    EmptySubject,
}

/// A job was asked to move along an edge its state machine does not have.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("illegal job transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}
