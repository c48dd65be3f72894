// protocol.rs — Agent ↔ Authority message types.
//
// These are transport-agnostic serde types. The reference transport is JSON
// over HTTP, but nothing here depends on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ruleset::{RuleDelta, RuleSet, RuleSetVersion};

/// Sent once per connection by an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registration {
    /// Stable endpoint identity (survives restarts).
    pub endpoint_id: String,
    pub hostname: String,
    /// What the agent can enforce (e.g., "iptables", "terminate", "sweep").
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Version held in the agent's local cache.
    pub applied_version: RuleSetVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationAck {
    pub endpoint_id: String,
    pub current_version: RuleSetVersion,
    pub registered_at: DateTime<Utc>,
}

/// "Give me everything newer than `since_version`."
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullRequest {
    pub endpoint_id: String,
    pub since_version: RuleSetVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PullResponse {
    /// Nothing newer exists.
    UpToDate { version: RuleSetVersion },
    /// Ordered deltas, oldest first, contiguous from `since_version`.
    Deltas { deltas: Vec<RuleDelta> },
    /// The requested version is older than the retained change log.
    Snapshot { ruleset: RuleSet },
}

/// Pushed by the authority after every successful mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushNotice {
    pub delta: RuleDelta,
}

/// Flow counters an agent reports with every heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentStats {
    pub total_flows: u64,
    pub denied_flows: u64,
    pub unattributed_flows: u64,
    pub open_flows: u64,
    pub swept_flows: u64,
    pub active_rules: u64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

/// Liveness plus the version the agent is currently enforcing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Heartbeat {
    pub endpoint_id: String,
    pub applied_version: RuleSetVersion,
    #[serde(default)]
    pub stats: AgentStats,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatAck {
    pub current_version: RuleSetVersion,
    /// True when the agent should pull before its next heartbeat.
    pub behind: bool,
}
