//! Error taxonomy.
//!
//! Query-level failures are [`EngineError`]s and abort only the request that
//! raised them. Ingestion-level failures are [`IngestionError`] values that
//! are collected into the [`IndexReport`](crate::ingest::IndexReport) while
//! the pass continues.

use serde::Serialize;
use thiserror::Error;

/// Result alias for engine queries.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Unknown model or identifier in a query.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Malformed query parameter (negative depth, unknown direction, ...).
    #[error("invalid {param}: {reason}")]
    Validation { param: String, reason: String },

    /// Records file unreadable or undecodable.
    #[error("input error: {0}")]
    Input(String),

    /// Persisted store unavailable.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Persisted store readable but its content cannot be decoded.
    #[error("store is corrupt: {0}")]
    Corrupt(String),

    /// A background task failed to complete.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(param: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            param: param.into(),
            reason: reason.into(),
        }
    }

    /// Machine-readable error code used at the tool boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::Validation { .. } => "validation",
            EngineError::Input(_) => "input",
            EngineError::Store(_) | EngineError::Corrupt(_) => "store",
            EngineError::Internal(_) => "internal",
        }
    }
}

/// Classification of a per-record ingestion failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionErrorKind {
    /// The record could not be decoded or is missing required fields.
    Malformed,
    /// Another record with the same identifier was already staged.
    Duplicate,
    /// The record references an identifier that does not exist.
    Unresolved,
    /// The edge set contains a directed cycle.
    Cycle,
}

/// A single ingestion failure, reported rather than raised.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("{kind:?} {record}: {message}")]
pub struct IngestionError {
    pub kind: IngestionErrorKind,
    /// Identifier (or positional label) of the offending record.
    pub record: String,
    pub message: String,
}

impl IngestionError {
    pub fn new(
        kind: IngestionErrorKind,
        record: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            record: record.into(),
            message: message.into(),
        }
    }
}
