// agent.rs — The per-flow pipeline: attribute → evaluate → enforce.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aw_rules::{AgentStats, RuleSet, RuleSetVersion};

use crate::attributor::{Attribution, FlowAttributor};
use crate::cache::RuleCache;
use crate::enforcer::{Decision, Enforcer};
use crate::error::AgentError;
use crate::flow::{FlowId, ObservedFlow};

/// Snapshot written to `status.json` for `aw-agent status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentStatus {
    pub endpoint_id: String,
    pub applied_version: RuleSetVersion,
    pub primitive: String,
    pub authority_url: Option<String>,
    pub stats: AgentStats,
    pub written_at: DateTime<Utc>,
}

impl AgentStatus {
    pub fn write(&self, path: &Path) -> Result<(), AgentError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AgentError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| AgentError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| AgentError::io(path, e))
    }

    pub fn read(path: &Path) -> Result<Self, AgentError> {
        let content = std::fs::read_to_string(path).map_err(|e| AgentError::io(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }
}

pub struct Agent {
    attributor: Arc<FlowAttributor>,
    enforcer: Arc<Enforcer>,
    cache: Arc<RuleCache>,
}

impl Agent {
    pub fn new(
        attributor: Arc<FlowAttributor>,
        enforcer: Arc<Enforcer>,
        cache: Arc<RuleCache>,
    ) -> Self {
        Self {
            attributor,
            enforcer,
            cache,
        }
    }

    /// Decide and enforce one new flow.
    ///
    /// Attribution completes (or times out) before the snapshot is loaded, so
    /// the decision always reflects the newest committed rule set.
    pub async fn on_flow(&self, flow: ObservedFlow) -> Result<Decision, AgentError> {
        let attribution = self.attributor.attribute(&flow).await;
        let ruleset = self.cache.load();
        self.decide(flow, attribution, ruleset).await
    }

    /// Enforce against `ruleset`, then re-check a permitted flow if a newer
    /// snapshot was committed meanwhile. A sweep for that snapshot may have
    /// run before the flow was tracked as open.
    pub(crate) async fn decide(
        &self,
        flow: ObservedFlow,
        attribution: Attribution,
        ruleset: Arc<RuleSet>,
    ) -> Result<Decision, AgentError> {
        self.enforcer.domains().ensure(&ruleset).await;
        let decision = self.enforcer.handle(flow, attribution, &ruleset)?;
        if !self.enforcer.is_open(decision.flow_id) {
            return Ok(decision);
        }

        let latest = self.cache.load();
        if latest.version == ruleset.version {
            return Ok(decision);
        }
        tracing::debug!(
            flow = %decision.flow_id,
            decided = %ruleset.version,
            latest = %latest.version,
            "rule set moved during decision; re-checking"
        );
        self.enforcer.domains().ensure(&latest).await;
        Ok(self
            .enforcer
            .recheck(decision.flow_id, &latest)?
            .unwrap_or(decision))
    }

    pub fn on_closed(&self, flow_id: FlowId) -> Result<(), AgentError> {
        self.enforcer.flow_closed(flow_id)
    }

    pub fn stats(&self) -> AgentStats {
        self.enforcer.stats(&self.cache.load())
    }

    pub fn applied_version(&self) -> RuleSetVersion {
        self.cache.version()
    }
}
