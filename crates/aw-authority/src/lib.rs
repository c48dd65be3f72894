//! # aw-authority
//!
//! The central AppWall authority.
//!
//! The [`RuleStore`] holds the canonical, versioned rule set. Every
//! successful mutation bumps the version once and is broadcast as a
//! [`RuleDelta`](aw_rules::RuleDelta) to subscribed agents through the
//! [`Distributor`]. Operators author rules through the two-phase
//! [`SearchAndBlock`] workflow or directly over the HTTP API in [`api`].
//!
//! ## Key invariants
//!
//! - **No lost updates**: a write against an outdated revision is rejected
//!   with a conflict; the version does not move.
//! - **Validated at the door**: malformed rules never enter the store and
//!   are never distributed.
//! - **Exact selection**: a block commits against the very candidate list the
//!   operator was shown, or fails as a stale selection.

pub mod api;
pub mod catalog;
pub mod config;
pub mod distribution;
pub mod error;
pub mod store;
pub mod workflow;

pub use api::{router, AppState};
pub use catalog::{ApplicationCatalog, CatalogEntry};
pub use config::AuthorityConfig;
pub use distribution::{AgentRecord, DeltaPublisher, Distributor};
pub use error::{
    ConfigError, DistributionError, StaleReason, StartupError, StoreError, WorkflowError,
};
pub use store::{RuleStore, RuleUpdate, StoreState, TemplateUpdate};
pub use workflow::{BlockSelection, Candidate, SearchAndBlock, SearchResult, SearchSession};
