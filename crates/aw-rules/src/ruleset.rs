// ruleset.rs — Versioned, immutable rule-set snapshots and deltas.
//
// A RuleSet is never mutated in place once published. Applying a delta
// produces a brand new snapshot; callers swap the whole thing atomically.
// Maps are BTreeMaps so iteration order (and therefore evaluation and
// serialization) is deterministic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RuleError;
use crate::model::{
    FirewallRule, InstanceId, MatchClause, PolicyAssignment, PolicyTemplate, RuleId,
};

/// Monotonically increasing version stamped on every rule-store mutation.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct RuleSetVersion(pub u64);

impl RuleSetVersion {
    pub const ZERO: RuleSetVersion = RuleSetVersion(0);

    pub fn next(self) -> Self {
        RuleSetVersion(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RuleSetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One incremental change carried by a delta.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RuleChange {
    UpsertRule { rule: FirewallRule },
    RemoveRule { rule_id: RuleId },
    UpsertTemplate { template: PolicyTemplate },
    RemoveTemplate { template_id: Uuid },
    UpsertAssignment { assignment: PolicyAssignment },
    RemoveAssignment { assignment_id: Uuid },
}

/// The changes that move a rule set from one version to the next.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleDelta {
    pub from_version: RuleSetVersion,
    pub to_version: RuleSetVersion,
    pub changes: Vec<RuleChange>,
    pub issued_at: DateTime<Utc>,
}

impl RuleDelta {
    pub fn new(from_version: RuleSetVersion, changes: Vec<RuleChange>) -> Self {
        Self {
            from_version,
            to_version: from_version.next(),
            changes,
            issued_at: Utc::now(),
        }
    }
}

/// An immutable snapshot of every rule, template and assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleSet {
    pub version: RuleSetVersion,
    /// Standalone rules (identity-, instance- or globally-scoped).
    #[serde(default)]
    pub rules: BTreeMap<RuleId, FirewallRule>,
    #[serde(default)]
    pub templates: BTreeMap<Uuid, PolicyTemplate>,
    #[serde(default)]
    pub assignments: BTreeMap<Uuid, PolicyAssignment>,
}

impl RuleSet {
    /// An empty rule set at version 0.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Produce the snapshot that results from applying `delta`.
    ///
    /// The delta must start exactly at this snapshot's version and move it
    /// forward; `self` is left untouched either way.
    pub fn apply(&self, delta: &RuleDelta) -> Result<RuleSet, RuleError> {
        if delta.to_version <= delta.from_version {
            return Err(RuleError::NonMonotonicDelta {
                from: delta.from_version,
                to: delta.to_version,
            });
        }
        if delta.from_version != self.version {
            return Err(RuleError::VersionGap {
                expected: self.version,
                found: delta.from_version,
            });
        }

        let mut next = self.clone();
        for change in &delta.changes {
            next.apply_change(change);
        }
        next.version = delta.to_version;
        Ok(next)
    }

    fn apply_change(&mut self, change: &RuleChange) {
        match change {
            RuleChange::UpsertRule { rule } => {
                self.rules.insert(rule.rule_id, rule.clone());
            }
            RuleChange::RemoveRule { rule_id } => {
                self.rules.remove(rule_id);
            }
            RuleChange::UpsertTemplate { template } => {
                self.templates.insert(template.template_id, template.clone());
            }
            RuleChange::RemoveTemplate { template_id } => {
                self.templates.remove(template_id);
            }
            RuleChange::UpsertAssignment { assignment } => {
                self.assignments
                    .insert(assignment.assignment_id, assignment.clone());
            }
            RuleChange::RemoveAssignment { assignment_id } => {
                self.assignments.remove(assignment_id);
            }
        }
    }

    /// Assignments bound to `instance_id`, in assignment-id order.
    pub fn assignments_for(
        &self,
        instance_id: InstanceId,
    ) -> impl Iterator<Item = &PolicyAssignment> + '_ {
        self.assignments
            .values()
            .filter(move |a| a.instance_id == instance_id)
    }

    /// Number of active rules across standalone rules, templates and overrides.
    pub fn active_rule_count(&self) -> usize {
        self.all_rules().count()
    }

    /// Every active rule, wherever it lives.
    pub fn all_rules(&self) -> impl Iterator<Item = &FirewallRule> + '_ {
        self.rules
            .values()
            .chain(self.templates.values().flat_map(|t| t.rules.iter()))
            .chain(self.assignments.values().flat_map(|a| a.overrides.iter()))
            .filter(|r| r.is_active())
    }

    /// Exact host names named by active domain clauses, folded to lowercase.
    /// Wildcard patterns are left out: there is no single name to look up.
    pub fn domain_names(&self) -> BTreeSet<String> {
        self.all_rules()
            .filter_map(|r| match &r.clause {
                MatchClause::Domain { pattern } if !pattern.starts_with("*.") => {
                    Some(pattern.trim().trim_end_matches('.').to_ascii_lowercase())
                }
                _ => None,
            })
            .collect()
    }

    /// Look up a standalone rule.
    pub fn rule(&self, rule_id: RuleId) -> Option<&FirewallRule> {
        self.rules.get(&rule_id)
    }
}
