// error.rs — Error types for the audit trail.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    /// The log file (or its directory) could not be opened or created.
    #[error("cannot open audit log {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("audit write failed: {0}")]
    WriteFailed(#[from] std::io::Error),

    /// A line that is not a valid record, or a record that would not encode.
    #[error("malformed audit record: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Line `line` does not link to the one before it: a record was
    /// inserted, removed or edited.
    #[error("integrity check failed at line {line}: previous_hash should be {expected}, found {actual}")]
    IntegrityViolation {
        line: usize,
        expected: String,
        actual: String,
    },

    /// An executable could not be read for its content hash.
    #[error("cannot hash {path}: {source}")]
    HashFileFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("audit log lock poisoned")]
    Poisoned,
}
