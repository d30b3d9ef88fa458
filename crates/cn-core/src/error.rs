use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// Classification every failure is reduced to before it crosses a component
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Flakes and quota waits. Retried up to a bound.
    Transient,
    /// Safety rule violation. Never retried.
    Guardrail,
    /// Tool crash, dependency cycle, timeout. Needs a human.
    Permanent,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureKind::Transient => "transient",
            FailureKind::Guardrail => "guardrail",
            FailureKind::Permanent => "permanent",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// CoreError
// ---------------------------------------------------------------------------

/// Errors returned by scheduling state transitions.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The request is invalid in the current state. Nothing was mutated.
    #[error("precondition failed: {0}")]
    Precondition(String),
    /// The entity changed underneath the caller. Safe to retry.
    #[error("conflict on {entity} {id}: {detail}")]
    Conflict {
        entity: &'static str,
        id: String,
        detail: String,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl CoreError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        CoreError::Precondition(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(entity: &'static str, id: impl ToString, detail: impl Into<String>) -> Self {
        CoreError::Conflict {
            entity,
            id: id.to_string(),
            detail: detail.into(),
        }
    }

    /// Whether the caller should re-read state and try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Conflict { .. } => true,
            CoreError::Store(e) => e.is_conflict(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
