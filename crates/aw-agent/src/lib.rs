//! # aw-agent
//!
//! AppWall endpoint agent.
//!
//! Every outbound flow is attributed to the application that opened it
//! ([`FlowAttributor`]), evaluated against the current snapshot of the
//! [`RuleCache`], and enforced by the [`Enforcer`] through a
//! [`FirewallPrimitive`]. The [`SyncClient`] keeps the cache in step with the
//! authority and re-evaluates open flows after each applied delta.
//!
//! ## Key invariants
//!
//! - **No pass-through**: if the firewall primitive cannot be installed the
//!   agent refuses to start.
//! - **One record per decision**: every decision, allow included, yields
//!   exactly one audit record. Abandoned flows yield a single discard record.
//! - **No torn reads**: the cache swaps whole snapshots; evaluators never
//!   see a half-applied delta.
//! - **Address-level domain rules**: exact domains in the rule set are
//!   resolved ([`DomainIndex`]) so flows seen only by address still match.
//! - **Last known good**: losing the authority never changes what is
//!   enforced; the last applied rule set stays in force across restarts.

pub mod agent;
pub mod attributor;
pub mod cache;
pub mod client;
pub mod config;
pub mod enforcer;
pub mod error;
pub mod flow;
pub mod monitor;
pub mod primitive;
pub mod resolver;
pub mod stats;
pub mod sync;

pub use agent::{Agent, AgentStatus};
pub use attributor::{
    Attribution, FlowAttributor, InspectError, ProcInspector, ProcessInfo, ProcessInspector,
};
pub use cache::{ApplyOutcome, RuleCache};
pub use client::{AuthorityClient, HttpAuthorityClient, PushStream};
pub use config::{AgentConfig, KnownApplication, PrimitiveKind};
pub use enforcer::{Decision, Enforcer, OpenFlow, SweepReport};
pub use error::AgentError;
pub use flow::{FlowId, FlowKey, ObservedFlow};
pub use monitor::{MonitorEvents, SocketMonitor};
pub use primitive::{FirewallPrimitive, IptablesPrimitive, MemoryPrimitive, PrimitiveRule};
pub use resolver::{DomainIndex, DomainResolver, StaticResolver, SystemResolver};
pub use stats::AgentCounters;
pub use sync::{AuditOutbox, SyncClient, SyncSettings};
