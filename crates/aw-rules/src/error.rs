// error.rs — Error types for the rule model.

use thiserror::Error;
use uuid::Uuid;

use crate::ruleset::RuleSetVersion;

/// Errors raised while validating rules or applying deltas.
#[derive(Debug, Error)]
pub enum RuleError {
    /// A match clause is structurally invalid.
    #[error("invalid match clause '{clause}': {reason}")]
    InvalidClause { clause: String, reason: String },

    /// The rule's priority is outside the accepted range.
    #[error("priority {priority} is outside {min}..={max}")]
    PriorityOutOfRange { priority: i32, min: i32, max: i32 },

    /// A template needs a non-empty name.
    #[error("policy template name must not be empty")]
    EmptyTemplateName,

    /// A delta was computed from a different version than the one held.
    #[error("delta starts at version {found} but the rule set is at {expected}")]
    VersionGap {
        expected: RuleSetVersion,
        found: RuleSetVersion,
    },

    /// A delta does not move the version forward.
    #[error("delta from {from} to {to} is not monotonic")]
    NonMonotonicDelta {
        from: RuleSetVersion,
        to: RuleSetVersion,
    },

    /// An assignment references a template that does not exist.
    #[error("unknown policy template: {0}")]
    UnknownTemplate(Uuid),
}
