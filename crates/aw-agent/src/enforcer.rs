// enforcer.rs — Applies decisions to the network path.
//
// Every decision produces exactly one audit record, allow included. Allowed
// flows are tracked as open so a later rule push can re-evaluate them;
// denied flows get a per-flow drop rule and their connection torn down. A
// deny the primitive could not apply is still recorded, as `Failed`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use aw_audit::{AuditRecord, AuditSink, Enforcement};
use aw_rules::{
    Action, AgentStats, EvaluationTrace, FlowMatch, PolicyEvaluator, Protocol, RuleSet,
};

use crate::attributor::Attribution;
use crate::error::AgentError;
use crate::flow::{FlowId, ObservedFlow};
use crate::primitive::{FirewallPrimitive, PrimitiveRule};
use crate::resolver::DomainIndex;
use crate::stats::AgentCounters;

/// A permitted flow that is still open.
#[derive(Debug, Clone)]
pub struct OpenFlow {
    pub flow: ObservedFlow,
    pub attribution: Attribution,
    pub trace: EvaluationTrace,
    pub opened_at: DateTime<Utc>,
}

/// What the enforcer did with one flow.
#[derive(Debug, Clone)]
pub struct Decision {
    pub flow_id: FlowId,
    pub enforcement: Enforcement,
    /// None when the flow was abandoned before evaluation mattered.
    pub trace: Option<EvaluationTrace>,
}

impl Decision {
    pub fn action(&self) -> Option<Action> {
        self.trace.as_ref().map(|t| t.decision)
    }
}

/// Result of re-evaluating open flows against a new snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub torn_down: Vec<FlowId>,
    /// Newly denied flows the primitive could not block; still open.
    pub failed: Vec<FlowId>,
}

pub struct Enforcer {
    primitive: Arc<dyn FirewallPrimitive>,
    sink: Arc<dyn AuditSink>,
    evaluator: PolicyEvaluator,
    endpoint_id: String,
    open: DashMap<FlowId, OpenFlow>,
    blocked: DashMap<FlowId, PrimitiveRule>,
    counters: Arc<AgentCounters>,
    domains: Arc<DomainIndex>,
}

impl Enforcer {
    /// Check the primitive is usable and build the enforcer.
    ///
    /// Fails with `EnforcementUnavailable` when the primitive cannot install
    /// rules; there is no pass-through fallback.
    pub fn new(
        primitive: Arc<dyn FirewallPrimitive>,
        sink: Arc<dyn AuditSink>,
        evaluator: PolicyEvaluator,
        endpoint_id: impl Into<String>,
    ) -> Result<Self, AgentError> {
        primitive.check_available()?;
        tracing::info!(primitive = primitive.name(), "enforcement primitive ready");
        Ok(Self {
            primitive,
            sink,
            evaluator,
            endpoint_id: endpoint_id.into(),
            open: DashMap::new(),
            blocked: DashMap::new(),
            counters: Arc::new(AgentCounters::new()),
            domains: Arc::new(DomainIndex::disabled()),
        })
    }

    pub fn with_counters(mut self, counters: Arc<AgentCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Match domain clauses against resolved destination addresses.
    pub fn with_domains(mut self, domains: Arc<DomainIndex>) -> Self {
        self.domains = domains;
        self
    }

    pub fn evaluator(&self) -> &PolicyEvaluator {
        &self.evaluator
    }

    pub fn domains(&self) -> &Arc<DomainIndex> {
        &self.domains
    }

    /// The evaluator's view of `flow`, including rule domains its
    /// destination address resolved from.
    pub fn flow_match(&self, flow: &ObservedFlow) -> FlowMatch {
        let mut flow_match = flow.to_match();
        flow_match.resolved_names = self.domains.names_for(flow.key.remote_ip);
        flow_match
    }

    /// Evaluate a flow against `ruleset` and enforce the outcome.
    pub fn handle(
        &self,
        flow: ObservedFlow,
        attribution: Attribution,
        ruleset: &RuleSet,
    ) -> Result<Decision, AgentError> {
        if attribution.is_abandoned() {
            return self.discard(flow);
        }
        let trace = self
            .evaluator
            .evaluate(attribution.subject(), &self.flow_match(&flow), ruleset);
        self.enforce(flow, attribution, trace)
    }

    /// Enforce an already computed decision.
    pub fn enforce(
        &self,
        flow: ObservedFlow,
        attribution: Attribution,
        trace: EvaluationTrace,
    ) -> Result<Decision, AgentError> {
        if attribution.is_abandoned() {
            return self.discard(flow);
        }
        self.counters.record_flow(
            trace.decision == Action::Deny,
            attribution.instance().is_none(),
        );

        match trace.decision {
            Action::Allow => {
                let record = self.record(&flow, &attribution, &trace, Enforcement::Permitted);
                self.open.insert(
                    flow.flow_id,
                    OpenFlow {
                        flow: flow.clone(),
                        attribution,
                        trace: trace.clone(),
                        opened_at: Utc::now(),
                    },
                );
                self.sink.emit(record)?;
                tracing::debug!(flow = %flow.key, "flow permitted");
                Ok(Decision {
                    flow_id: flow.flow_id,
                    enforcement: Enforcement::Permitted,
                    trace: Some(trace),
                })
            }
            Action::Deny => {
                let blocked = self.block(&flow);
                let enforcement = blocked.as_ref().copied().unwrap_or(Enforcement::Failed);
                let record = self.record(&flow, &attribution, &trace, enforcement);
                if blocked.is_err() {
                    // Still live; the next sweep tries again.
                    self.open.insert(
                        flow.flow_id,
                        OpenFlow {
                            flow: flow.clone(),
                            attribution,
                            trace: trace.clone(),
                            opened_at: Utc::now(),
                        },
                    );
                }
                self.sink.emit(record)?;
                blocked?;
                tracing::info!(
                    flow = %flow.key,
                    rule = ?trace.matched_rule,
                    "flow denied"
                );
                Ok(Decision {
                    flow_id: flow.flow_id,
                    enforcement,
                    trace: Some(trace),
                })
            }
        }
    }

    /// Re-evaluate every open flow against `ruleset`; tear down the ones
    /// that are now denied. Flows still allowed are left untouched.
    ///
    /// A flow the primitive fails to block is audited as `Failed`, put back
    /// among the open flows, and the sweep moves on to the next one.
    pub fn sweep(&self, ruleset: &RuleSet) -> Result<SweepReport, AgentError> {
        let open: Vec<OpenFlow> = self.open.iter().map(|e| e.value().clone()).collect();
        let mut report = SweepReport {
            checked: open.len(),
            ..SweepReport::default()
        };
        let mut errors = Vec::new();

        for entry in open {
            let flow_id = entry.flow.flow_id;
            match self.reevaluate(entry, ruleset) {
                Ok(Some(_)) => report.torn_down.push(flow_id),
                Ok(None) => {}
                Err(e) => {
                    report.failed.push(flow_id);
                    errors.push(e.to_string());
                }
            }
        }

        if errors.is_empty() {
            Ok(report)
        } else {
            tracing::warn!(
                version = %ruleset.version,
                torn_down = report.torn_down.len(),
                failed = report.failed.len(),
                "sweep incomplete"
            );
            Err(AgentError::SweepIncomplete {
                failed: report.failed.len(),
                reason: errors.join("; "),
            })
        }
    }

    /// Re-evaluate one open flow. Returns the teardown decision when the
    /// flow is now denied, None when it stays open or is already gone.
    pub fn recheck(
        &self,
        flow_id: FlowId,
        ruleset: &RuleSet,
    ) -> Result<Option<Decision>, AgentError> {
        let Some(entry) = self.open.get(&flow_id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        self.reevaluate(entry, ruleset)
    }

    fn reevaluate(
        &self,
        entry: OpenFlow,
        ruleset: &RuleSet,
    ) -> Result<Option<Decision>, AgentError> {
        let trace = self.evaluator.evaluate(
            entry.attribution.subject(),
            &self.flow_match(&entry.flow),
            ruleset,
        );
        if trace.decision != Action::Deny {
            return Ok(None);
        }
        // A concurrent close or sweep may already have taken it.
        let Some((_, entry)) = self.open.remove(&entry.flow.flow_id) else {
            return Ok(None);
        };

        let blocked = self.block(&entry.flow);
        let enforcement = blocked.as_ref().copied().unwrap_or(Enforcement::Failed);
        let record = self
            .record(&entry.flow, &entry.attribution, &trace, enforcement)
            .from_sweep();
        let flow_id = entry.flow.flow_id;
        let key = entry.flow.key;
        if let Err(e) = blocked {
            self.open.insert(flow_id, entry);
            self.sink.emit(record)?;
            return Err(e);
        }
        self.sink.emit(record)?;
        self.counters.record_swept();
        tracing::info!(
            flow = %key,
            version = %ruleset.version,
            rule = ?trace.matched_rule,
            "open flow torn down by sweep"
        );
        Ok(Some(Decision {
            flow_id,
            enforcement,
            trace: Some(trace),
        }))
    }

    /// The flow ended; forget it and drop any per-flow rule.
    pub fn flow_closed(&self, flow_id: FlowId) -> Result<(), AgentError> {
        self.open.remove(&flow_id);
        if let Some((_, rule)) = self.blocked.remove(&flow_id) {
            self.primitive.remove(&rule)?;
        }
        Ok(())
    }

    pub fn open_flows(&self) -> usize {
        self.open.len()
    }

    pub fn is_open(&self, flow_id: FlowId) -> bool {
        self.open.contains_key(&flow_id)
    }

    pub fn stats(&self, ruleset: &RuleSet) -> AgentStats {
        self.counters
            .snapshot(self.open.len(), ruleset.active_rule_count())
    }

    fn discard(&self, flow: ObservedFlow) -> Result<Decision, AgentError> {
        let record = AuditRecord::discarded(self.endpoint_id.clone(), flow.metadata(None));
        self.sink.emit(record)?;
        tracing::debug!(flow = %flow.key, "owner exited; flow discarded");
        Ok(Decision {
            flow_id: flow.flow_id,
            enforcement: Enforcement::Discarded,
            trace: None,
        })
    }

    fn block(&self, flow: &ObservedFlow) -> Result<Enforcement, AgentError> {
        if !self.blocked.contains_key(&flow.flow_id) {
            let rule = PrimitiveRule::new(flow.flow_id.to_string(), flow.key);
            self.primitive.install(&rule).map_err(|e| {
                tracing::error!(flow = %flow.key, error = %e, "could not install drop rule");
                e
            })?;
            // Tracked before teardown so a close removes it either way.
            self.blocked.insert(flow.flow_id, rule);
        }
        if flow.key.protocol == Protocol::Tcp {
            self.primitive.terminate(&flow.key)?;
            Ok(Enforcement::Terminated)
        } else {
            Ok(Enforcement::Dropped)
        }
    }

    fn record(
        &self,
        flow: &ObservedFlow,
        attribution: &Attribution,
        trace: &EvaluationTrace,
        enforcement: Enforcement,
    ) -> AuditRecord {
        let mut record = AuditRecord::decision(
            self.endpoint_id.clone(),
            trace.decision,
            enforcement,
            flow.metadata(None),
        )
        .with_trace(trace);
        if let Some(instance) = attribution.instance() {
            record = record.with_instance(instance);
        }
        record
    }
}
