// flow.rs — Flows as the agent observes them.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aw_audit::FlowMetadata;
use aw_rules::{FlowMatch, Protocol};

pub type FlowId = Uuid;

/// The 5-tuple that identifies a socket on this endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.protocol, self.local_ip, self.local_port, self.remote_ip, self.remote_port
        )
    }
}

/// A newly observed outbound flow awaiting a decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservedFlow {
    pub flow_id: FlowId,
    pub key: FlowKey,
    /// Destination host name when known (SNI, DNS answer).
    #[serde(default)]
    pub domain: Option<String>,
    /// Process id reported by the capture layer, if it has one.
    #[serde(default)]
    pub pid_hint: Option<u32>,
    pub observed_at: DateTime<Utc>,
}

impl ObservedFlow {
    pub fn new(key: FlowKey) -> Self {
        Self {
            flow_id: Uuid::new_v4(),
            key,
            domain: None,
            pid_hint: None,
            observed_at: Utc::now(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into().to_ascii_lowercase());
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid_hint = Some(pid);
        self
    }

    /// Attributes the evaluator matches against.
    pub fn to_match(&self) -> FlowMatch {
        FlowMatch {
            domain: self.domain.clone(),
            resolved_names: Vec::new(),
            remote_ip: self.key.remote_ip,
            protocol: self.key.protocol,
            remote_port: self.key.remote_port,
        }
    }

    /// Metadata carried on the audit record.
    pub fn metadata(&self, pid: Option<u32>) -> FlowMetadata {
        let mut meta = FlowMetadata::new(self.key.remote_ip, self.key.remote_port, self.key.protocol);
        meta.domain = self.domain.clone();
        meta.local_port = Some(self.key.local_port);
        meta.pid = pid.or(self.pid_hint);
        meta
    }
}
