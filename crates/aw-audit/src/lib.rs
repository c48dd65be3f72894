//! # aw-audit
//!
//! Append-only audit trail for AppWall enforcement decisions.
//!
//! Every decision the enforcer makes, allow included, is recorded as one
//! [`AuditRecord`]. Records are written to a JSONL file where each line
//! carries the SHA-256 of the previous line, so insertions, deletions and
//! edits are detectable with [`AuditLog::verify_chain`].
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use aw_audit::{AuditLog, AuditRecord, Enforcement, FlowMetadata};
//! use aw_rules::{Action, Protocol};
//!
//! let mut log = AuditLog::open("/tmp/audit.jsonl").unwrap();
//! let flow = FlowMetadata::new("93.184.216.34".parse().unwrap(), 443, Protocol::Tcp);
//! let mut record = AuditRecord::decision("endpoint-1", Action::Allow, Enforcement::Permitted, flow);
//! log.append(&mut record).unwrap();
//! ```

pub mod error;
pub mod hasher;
pub mod log;
pub mod record;
pub mod service;

pub use error::AuditError;
pub use log::{AuditLog, AuditQuery, AuditSink, MemorySink, SharedAuditLog};
pub use record::{
    AuditBatch, AuditDecision, AuditRecord, Enforcement, FlowMetadata, InstanceRef,
    AUDIT_SCHEMA_VERSION,
};
pub use service::classify_port;
