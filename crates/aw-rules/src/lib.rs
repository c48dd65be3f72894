//! # aw-rules
//!
//! Rule model and policy evaluation for AppWall.
//!
//! Firewall rules bind an application (by identity or by one installed
//! instance) to a match clause and an action. The [`PolicyEvaluator`] takes an
//! attributed flow and an immutable [`RuleSet`] snapshot and returns an
//! [`EvaluationTrace`] carrying the decision and the matched rule.
//!
//! ## Key invariants
//!
//! - **Override first**: override entries of a [`PolicyAssignment`] beat
//!   template rules of any priority.
//! - **Unattributed flows** only ever see the configured default action.
//! - **Deterministic**: the same (instance, flow, rule-set version) always
//!   yields the same decision; ties are broken by an explicit, configured
//!   ordering, never by time of evaluation.
//! - **Monotonic versions**: a [`RuleDelta`] only applies on top of the exact
//!   version it was computed from.

pub mod error;
pub mod evaluator;
pub mod model;
pub mod protocol;
pub mod ruleset;

pub use error::RuleError;
pub use evaluator::{
    EvaluationStep, EvaluationTrace, EvaluatorConfig, PolicyEvaluator, Subject, TieBreak, Tier,
    UnattributedReason,
};
pub use model::{
    domain_matches, Action, ApplicationIdentity, ApplicationInstance, FirewallRule, FlowMatch,
    InstanceId, MatchClause, PolicyAssignment, PolicyTemplate, PortRange, Protocol, RuleId,
    RuleSelector, RuleState, PRIORITY_MAX, PRIORITY_MIN,
};
pub use protocol::{
    AgentStats, Heartbeat, HeartbeatAck, PullRequest, PullResponse, PushNotice, Registration,
    RegistrationAck,
};
pub use ruleset::{RuleChange, RuleDelta, RuleSet, RuleSetVersion};
