// error.rs — Error types for the authority.
//
// Every rejected mutation reports a distinct `kind()` so operators can tell
// "someone changed this under you" from "bad input" from "you searched
// something else in the meantime".

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use aw_audit::AuditError;
use aw_rules::RuleError;

/// Errors from the canonical rule store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The caller read an older revision of the object than the one stored.
    #[error("{object} is at revision {actual}, write was against {expected}")]
    Conflict {
        object: String,
        expected: u64,
        actual: u64,
    },

    /// The rule, template or assignment failed validation.
    #[error("malformed: {0}")]
    Malformed(#[from] RuleError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    /// A template cannot be removed while assignments still reference it.
    #[error("template {template_id} is referenced by {assignments} assignment(s)")]
    TemplateInUse { template_id: Uuid, assignments: usize },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Conflict { .. } => "conflict",
            StoreError::Malformed(_) => "malformed",
            StoreError::NotFound { .. } => "not_found",
            StoreError::TemplateInUse { .. } => "template_in_use",
            StoreError::Io { .. } | StoreError::SerializationError(_) => "internal",
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors loading `authority.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Why a selection can no longer be committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    /// No search session with that id exists.
    UnknownSession,
    /// The operator has searched again since.
    Superseded,
    /// The selection outlived the configured TTL.
    Expired,
    /// The catalog now returns a different candidate list for the query.
    CandidatesChanged,
    /// The client's copy of the candidate list differs from the session's.
    DigestMismatch,
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            StaleReason::UnknownSession => "unknown search session",
            StaleReason::Superseded => "superseded by a newer search",
            StaleReason::Expired => "selection expired",
            StaleReason::CandidatesChanged => "candidate list changed since the search",
            StaleReason::DigestMismatch => "candidate digest does not match",
        };
        f.write_str(text)
    }
}

/// Errors from the search-and-block workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("stale selection: {reason}; search again")]
    StaleSelection { reason: StaleReason },

    #[error("ordinal {ordinal} is out of range (1..={candidates})")]
    InvalidOrdinal { ordinal: usize, candidates: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkflowError {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::StaleSelection { .. } => "stale_selection",
            WorkflowError::InvalidOrdinal { .. } => "invalid_ordinal",
            WorkflowError::Store(e) => e.kind(),
        }
    }
}

/// Errors from agent distribution.
#[derive(Debug, Error)]
pub enum DistributionError {
    /// A heartbeat arrived from an endpoint that never registered.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl DistributionError {
    pub fn kind(&self) -> &'static str {
        match self {
            DistributionError::UnknownEndpoint(_) => "unknown_endpoint",
            DistributionError::Audit(_) => "internal",
        }
    }
}

/// Failures bringing the authority up.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Distribution(#[from] DistributionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_specific() {
        let conflict = StoreError::Conflict {
            object: "rule x".into(),
            expected: 1,
            actual: 2,
        };
        assert_eq!(conflict.kind(), "conflict");
        assert_eq!(
            WorkflowError::from(conflict).kind(),
            "conflict",
            "store errors keep their kind through the workflow"
        );
        assert_eq!(
            StoreError::Malformed(RuleError::EmptyTemplateName).kind(),
            "malformed"
        );
        let stale = WorkflowError::StaleSelection {
            reason: StaleReason::Superseded,
        };
        assert_eq!(stale.kind(), "stale_selection");
        assert!(stale.to_string().contains("superseded"));
    }
}
