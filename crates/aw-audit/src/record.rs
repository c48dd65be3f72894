// record.rs — Audit record data model.
//
// One AuditRecord per enforcement decision. Records are immutable once
// created; the only field the log touches is `previous_hash`, set exactly
// once at append time to link the record into the chain.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aw_rules::{
    Action, ApplicationInstance, EvaluationTrace, InstanceId, MatchClause, Protocol, RuleId,
    RuleSetVersion, Tier,
};

use crate::service::classify_port;

/// Version of the record schema consumed by downstream collaborators.
pub const AUDIT_SCHEMA_VERSION: u32 = 1;

/// What was decided.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    Allow,
    Deny,
    /// The flow was abandoned before a decision could be enforced.
    Discarded,
}

impl From<Action> for AuditDecision {
    fn from(action: Action) -> Self {
        match action {
            Action::Allow => AuditDecision::Allow,
            Action::Deny => AuditDecision::Deny,
        }
    }
}

/// What the enforcer actually did on the network path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    /// The flow was let through.
    Permitted,
    /// The connection was torn down and further packets dropped.
    Terminated,
    /// Future packets are silently dropped (connectionless flows).
    Dropped,
    /// Nothing was enforced; the owning process disappeared.
    Discarded,
    /// Denied, but the firewall primitive could not apply the decision.
    Failed,
}

/// Reference to the application instance the flow was attributed to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRef {
    pub instance_id: InstanceId,
    pub application: String,
    #[serde(default)]
    pub content_hash: Option<String>,
    pub path: String,
}

impl From<&ApplicationInstance> for InstanceRef {
    fn from(instance: &ApplicationInstance) -> Self {
        Self {
            instance_id: instance.instance_id,
            application: instance.identity.name.clone(),
            content_hash: instance.identity.content_hash.clone(),
            path: instance.path.display().to_string(),
        }
    }
}

/// Flow metadata recorded alongside the decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowMetadata {
    #[serde(default)]
    pub domain: Option<String>,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub local_port: Option<u16>,
    #[serde(default)]
    pub pid: Option<u32>,
    /// Service label derived from the remote port (e.g., "HTTPS", "SMTP").
    pub service: String,
    #[serde(default)]
    pub bytes_sent: Option<u64>,
    #[serde(default)]
    pub bytes_received: Option<u64>,
}

impl FlowMetadata {
    pub fn new(remote_ip: IpAddr, remote_port: u16, protocol: Protocol) -> Self {
        Self {
            domain: None,
            remote_ip,
            remote_port,
            protocol,
            local_port: None,
            pid: None,
            service: classify_port(remote_port).to_string(),
            bytes_sent: None,
            bytes_received: None,
        }
    }
}

/// A single audit record, one line in the JSONL audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub record_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub endpoint_id: String,
    /// None when the flow was unattributed.
    #[serde(default)]
    pub instance: Option<InstanceRef>,
    /// The clause of the rule that decided, when one did.
    #[serde(default)]
    pub clause: Option<MatchClause>,
    /// None means "no rule matched → default action".
    #[serde(default)]
    pub matched_rule: Option<RuleId>,
    #[serde(default)]
    pub tier: Option<Tier>,
    pub decision: AuditDecision,
    pub enforcement: Enforcement,
    #[serde(default)]
    pub reason: Option<String>,
    pub flow: FlowMetadata,
    #[serde(default)]
    pub ruleset_version: RuleSetVersion,
    /// True when the record was produced by a re-evaluation sweep.
    #[serde(default)]
    pub sweep: bool,
    /// Hash of the previous line in the log; None for the first record.
    #[serde(default)]
    pub previous_hash: Option<String>,
}

fn default_schema_version() -> u32 {
    AUDIT_SCHEMA_VERSION
}

impl AuditRecord {
    /// A fresh record for a decision, with the current timestamp.
    pub fn decision(
        endpoint_id: impl Into<String>,
        action: Action,
        enforcement: Enforcement,
        flow: FlowMetadata,
    ) -> Self {
        Self {
            schema_version: AUDIT_SCHEMA_VERSION,
            record_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            endpoint_id: endpoint_id.into(),
            instance: None,
            clause: None,
            matched_rule: None,
            tier: None,
            decision: action.into(),
            enforcement,
            reason: None,
            flow,
            ruleset_version: RuleSetVersion::ZERO,
            sweep: false,
            previous_hash: None,
        }
    }

    /// The single record emitted for an abandoned flow.
    pub fn discarded(endpoint_id: impl Into<String>, flow: FlowMetadata) -> Self {
        let mut record = Self::decision(endpoint_id, Action::Deny, Enforcement::Discarded, flow);
        record.decision = AuditDecision::Discarded;
        record.reason = Some("unattributable, discarded".to_string());
        record
    }

    pub fn with_instance(mut self, instance: &ApplicationInstance) -> Self {
        self.instance = Some(InstanceRef::from(instance));
        self
    }

    /// Copy the matched rule, tier, version and terminal outcome from a trace.
    pub fn with_trace(mut self, trace: &EvaluationTrace) -> Self {
        self.matched_rule = trace.matched_rule;
        self.clause = trace.matched_clause.clone();
        self.tier = trace.tier;
        self.ruleset_version = trace.version;
        self.reason = trace
            .steps
            .iter()
            .rev()
            .find(|s| s.terminal)
            .map(|s| s.outcome.clone());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn from_sweep(mut self) -> Self {
        self.sweep = true;
        self
    }

    pub fn instance_id(&self) -> Option<InstanceId> {
        self.instance.as_ref().map(|i| i.instance_id)
    }
}

/// A batch of records exported by value from an agent to the authority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditBatch {
    pub endpoint_id: String,
    pub records: Vec<AuditRecord>,
}
