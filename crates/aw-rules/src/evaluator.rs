// evaluator.rs — Policy evaluation.
//
// Every flow decision passes through `PolicyEvaluator::evaluate()`:
//
// 1. Is the flow attributed? → No → unattributed default action
// 2. Override tier: assignment overrides bound to the instance
// 3. Application tier: assigned template rules + identity/instance rules
// 4. Global tier: globally-scoped standalone rules
// 5. Nothing matched → system default action
//
// Inside a tier rules are ordered by priority (descending), ties broken by
// the configured TieBreak. The first structural match wins. The function
// is pure: no clock, no randomness, no interior state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{
    Action, ApplicationInstance, FirewallRule, FlowMatch, MatchClause, RuleId, RuleSelector,
};
use crate::ruleset::{RuleSet, RuleSetVersion};

/// Why a flow could not be tied to an application.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnattributedReason {
    /// OS metadata did not arrive within the attribution timeout.
    Timeout,
    /// No process owns the socket (already closed, kernel socket).
    NoOwner,
    /// The agent lacks the privileges or OS support to look.
    InsufficientVisibility,
    /// The owning process exited while the flow was being evaluated.
    ProcessExited,
}

impl fmt::Display for UnattributedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnattributedReason::Timeout => "attribution timed out",
            UnattributedReason::NoOwner => "no owning process",
            UnattributedReason::InsufficientVisibility => "insufficient OS visibility",
            UnattributedReason::ProcessExited => "owning process exited",
        };
        f.write_str(s)
    }
}

/// Who the flow belongs to, as far as the evaluator is concerned.
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    Attributed(&'a ApplicationInstance),
    Unattributed(UnattributedReason),
}

/// Ordering among rules of equal priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The most recently created rule wins (higher `created_seq`).
    #[default]
    NewestFirst,
    /// The lexicographically smallest rule id wins.
    RuleId,
}

/// Evaluation tier a rule was drawn from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Override,
    Application,
    Global,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Override => "override",
            Tier::Application => "application",
            Tier::Global => "global",
        }
    }
}

/// Evaluator posture.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvaluatorConfig {
    /// Applied when no rule matches an attributed flow.
    pub default_action: Action,
    /// Applied to every unattributed flow. Falls back to `default_action`.
    #[serde(default)]
    pub unattributed_action: Option<Action>,
    #[serde(default)]
    pub tie_break: TieBreak,
}

impl EvaluatorConfig {
    pub fn allow_by_default() -> Self {
        Self {
            default_action: Action::Allow,
            unattributed_action: None,
            tie_break: TieBreak::NewestFirst,
        }
    }

    pub fn deny_by_default() -> Self {
        Self {
            default_action: Action::Deny,
            unattributed_action: None,
            tie_break: TieBreak::NewestFirst,
        }
    }

    pub fn unattributed(&self) -> Action {
        self.unattributed_action.unwrap_or(self.default_action)
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self::allow_by_default()
    }
}

/// A step in the evaluation chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvaluationStep {
    /// Which check was performed (e.g., "attribution", "override").
    pub check: String,
    pub outcome: String,
    /// Whether this step was the terminal decision point.
    pub terminal: bool,
}

/// The decision plus everything the evaluator looked at to reach it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvaluationTrace {
    pub decision: Action,
    /// The rule that decided, or None when a default action applied.
    pub matched_rule: Option<RuleId>,
    /// Clause of the matched rule.
    #[serde(default)]
    pub matched_clause: Option<MatchClause>,
    pub tier: Option<Tier>,
    pub steps: Vec<EvaluationStep>,
    /// Every rule inspected, in evaluation order.
    pub rules_checked: Vec<String>,
    /// Snapshot version the decision was made against.
    pub version: RuleSetVersion,
}

impl EvaluationTrace {
    pub fn used_default(&self) -> bool {
        self.matched_rule.is_none()
    }
}

/// Evaluates flows against rule-set snapshots.
#[derive(Debug, Clone, Default)]
pub struct PolicyEvaluator {
    config: EvaluatorConfig,
}

impl PolicyEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Decision only.
    pub fn decide(&self, subject: Subject<'_>, flow: &FlowMatch, ruleset: &RuleSet) -> Action {
        self.evaluate(subject, flow, ruleset).decision
    }

    /// Evaluate a flow and return the decision with a full trace.
    pub fn evaluate(
        &self,
        subject: Subject<'_>,
        flow: &FlowMatch,
        ruleset: &RuleSet,
    ) -> EvaluationTrace {
        let mut steps = Vec::new();
        let mut rules_checked = Vec::new();

        let instance = match subject {
            Subject::Unattributed(reason) => {
                let decision = self.config.unattributed();
                steps.push(EvaluationStep {
                    check: "attribution".to_string(),
                    outcome: format!("unattributed: {}; default {} applies", reason, decision),
                    terminal: true,
                });
                return EvaluationTrace {
                    decision,
                    matched_rule: None,
                    matched_clause: None,
                    tier: None,
                    steps,
                    rules_checked,
                    version: ruleset.version,
                };
            }
            Subject::Attributed(instance) => instance,
        };
        steps.push(EvaluationStep {
            check: "attribution".to_string(),
            outcome: format!("attributed to {} ({})", instance.identity, instance.instance_id),
            terminal: false,
        });

        for tier in [Tier::Override, Tier::Application, Tier::Global] {
            let mut candidates = gather(tier, instance, ruleset);
            self.order(&mut candidates);

            for rule in &candidates {
                rules_checked.push(format!(
                    "{}:{} {} {} p{}",
                    tier.as_str(),
                    rule.rule_id,
                    rule.action,
                    rule.clause,
                    rule.priority
                ));
                if rule.clause.matches(flow) {
                    steps.push(EvaluationStep {
                        check: tier.as_str().to_string(),
                        outcome: format!("{}: rule {} matched {}", rule.action, rule.rule_id, rule.clause),
                        terminal: true,
                    });
                    return EvaluationTrace {
                        decision: rule.action,
                        matched_rule: Some(rule.rule_id),
                        matched_clause: Some(rule.clause.clone()),
                        tier: Some(tier),
                        steps,
                        rules_checked,
                        version: ruleset.version,
                    };
                }
            }
            steps.push(EvaluationStep {
                check: tier.as_str().to_string(),
                outcome: format!("{} rule(s), none matched", candidates.len()),
                terminal: false,
            });
        }

        let decision = self.config.default_action;
        steps.push(EvaluationStep {
            check: "default".to_string(),
            outcome: format!("no rule matched; default {} applies", decision),
            terminal: true,
        });
        EvaluationTrace {
            decision,
            matched_rule: None,
            matched_clause: None,
            tier: None,
            steps,
            rules_checked,
            version: ruleset.version,
        }
    }

    fn order(&self, rules: &mut [&FirewallRule]) {
        let tie_break = self.config.tie_break;
        rules.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then_with(|| match tie_break {
                TieBreak::NewestFirst => b
                    .created_seq
                    .cmp(&a.created_seq)
                    .then_with(|| b.created_at.cmp(&a.created_at))
                    .then_with(|| a.rule_id.cmp(&b.rule_id)),
                TieBreak::RuleId => a.rule_id.cmp(&b.rule_id),
            })
        });
    }
}

/// Collect the active rules of one tier that apply to `instance`.
fn gather<'a>(
    tier: Tier,
    instance: &ApplicationInstance,
    ruleset: &'a RuleSet,
) -> Vec<&'a FirewallRule> {
    let rules: Vec<&FirewallRule> = match tier {
        Tier::Override => ruleset
            .assignments_for(instance.instance_id)
            .flat_map(|a| a.overrides.iter())
            .collect(),
        Tier::Application => {
            let templated = ruleset
                .assignments_for(instance.instance_id)
                .filter_map(|a| ruleset.templates.get(&a.template_id))
                .flat_map(|t| t.rules.iter());
            let scoped = ruleset
                .rules
                .values()
                .filter(|r| r.selector.selects(instance));
            templated.chain(scoped).collect()
        }
        Tier::Global => ruleset
            .rules
            .values()
            .filter(|r| r.selector == RuleSelector::Global)
            .collect(),
    };
    rules.into_iter().filter(|r| r.is_active()).collect()
}
