// error.rs — Error types for the endpoint agent.

use std::path::PathBuf;

use aw_audit::AuditError;
use aw_rules::RuleError;
use thiserror::Error;

/// Errors that can occur in the endpoint agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The platform firewall facility could not be used. Fatal at startup:
    /// the agent refuses to run in a silent pass-through mode.
    #[error("enforcement primitive '{primitive}' unavailable: {reason}")]
    EnforcementUnavailable { primitive: String, reason: String },

    /// A primitive operation (install, remove, terminate) failed after startup.
    #[error("enforcement primitive '{primitive}' failed: {reason}")]
    PrimitiveFailed { primitive: String, reason: String },

    /// A rule domain could not be resolved to addresses.
    #[error("could not resolve '{host}': {reason}")]
    Resolution { host: String, reason: String },

    /// Some open flows could not be torn down during a sweep. They stay
    /// tracked as open so the next sweep retries them.
    #[error("sweep left {failed} flow(s) unenforced: {reason}")]
    SweepIncomplete { failed: usize, reason: String },

    /// The authority could not be reached or rejected a request. Retried
    /// with backoff; enforcement continues on the cached rule set.
    #[error("delivery to authority failed: {0}")]
    Delivery(String),

    /// A file I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to serialize or deserialize persisted state.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The agent configuration file could not be parsed.
    #[error("invalid configuration at {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl AgentError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AgentError::Io {
            path: path.into(),
            source,
        }
    }
}
