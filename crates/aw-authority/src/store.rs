// store.rs — The canonical, versioned rule store.
//
// State lives behind `RwLock<Arc<StoreState>>`: readers clone the Arc and
// see one fully committed snapshot, writers serialize on `writer`, build the
// next state off to the side, persist it, and only then swap it in. A failed
// write therefore never changes the visible version.
//
// Every mutation names the revision it was read against. Revisions are the
// rule-set version at which the object last changed.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aw_rules::{
    Action, FirewallRule, MatchClause, PolicyAssignment, PolicyTemplate, PullResponse, RuleChange,
    RuleDelta, RuleError, RuleId, RuleSet, RuleSetVersion, RuleState,
};

use crate::distribution::DeltaPublisher;
use crate::error::StoreError;

/// One committed state: the rule set plus the retained change log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    pub ruleset: RuleSet,
    /// Oldest first; contiguous and ending at `ruleset.version`.
    #[serde(default)]
    pub changes: VecDeque<RuleDelta>,
}

/// Partial update of a standalone rule. Absent fields are left as they are.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleUpdate {
    #[serde(default)]
    pub clause: Option<MatchClause>,
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub state: Option<RuleState>,
    #[serde(default)]
    pub description: Option<String>,
}

impl RuleUpdate {
    fn apply_to(self, rule: &mut FirewallRule) {
        if let Some(clause) = self.clause {
            rule.clause = clause;
        }
        if let Some(action) = self.action {
            rule.action = action;
        }
        if let Some(priority) = self.priority {
            rule.priority = priority;
        }
        if let Some(state) = self.state {
            rule.state = state;
        }
        if let Some(description) = self.description {
            rule.description = Some(description);
        }
    }
}

/// Partial update of a template. `rules`, when present, replaces the list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rules: Option<Vec<FirewallRule>>,
}

pub struct RuleStore {
    state: RwLock<Arc<StoreState>>,
    writer: Mutex<()>,
    path: Option<PathBuf>,
    retention: usize,
    publisher: Option<DeltaPublisher>,
}

impl RuleStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(Arc::new(StoreState::default())),
            writer: Mutex::new(()),
            path: None,
            retention: 1024,
            publisher: None,
        }
    }

    /// Load `store.json`, or start empty when it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
            serde_json::from_str(&content)?
        } else {
            StoreState::default()
        };
        tracing::info!(
            path = %path.display(),
            version = %state.ruleset.version,
            rules = state.ruleset.rules.len(),
            "rule store opened"
        );
        Ok(Self {
            state: RwLock::new(Arc::new(state)),
            writer: Mutex::new(()),
            path: Some(path),
            retention: 1024,
            publisher: None,
        })
    }

    /// Number of deltas kept for incremental pulls.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    /// Broadcast every committed delta through `publisher`.
    pub fn with_publisher(mut self, publisher: DeltaPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// The current committed state. Never blocks on writers.
    pub fn read(&self) -> Arc<StoreState> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn version(&self) -> RuleSetVersion {
        self.read().ruleset.version
    }

    pub fn snapshot(&self) -> RuleSet {
        self.read().ruleset.clone()
    }

    // ── Rules ──────────────────────────────────────────────────

    pub fn create_rule(&self, mut rule: FirewallRule) -> Result<FirewallRule, StoreError> {
        rule.validate()?;
        self.commit(move |set, version| {
            if let Some(existing) = set.rules.get(&rule.rule_id) {
                return Err(conflict("rule", rule.rule_id, 0, existing.revision));
            }
            stamp_rules(std::slice::from_mut(&mut rule), &[], version);
            Ok((vec![RuleChange::UpsertRule { rule: rule.clone() }], rule))
        })
    }

    pub fn update_rule(
        &self,
        rule_id: RuleId,
        expected_revision: u64,
        update: RuleUpdate,
    ) -> Result<FirewallRule, StoreError> {
        self.commit(move |set, version| {
            let existing = set
                .rules
                .get(&rule_id)
                .ok_or(StoreError::NotFound { kind: "rule", id: rule_id })?;
            check_revision("rule", rule_id, expected_revision, existing.revision)?;
            let mut rule = existing.clone();
            update.apply_to(&mut rule);
            rule.validate()?;
            rule.revision = version.get();
            rule.modified_at = Utc::now();
            Ok((vec![RuleChange::UpsertRule { rule: rule.clone() }], rule))
        })
    }

    pub fn disable_rule(
        &self,
        rule_id: RuleId,
        expected_revision: u64,
    ) -> Result<FirewallRule, StoreError> {
        self.update_rule(
            rule_id,
            expected_revision,
            RuleUpdate {
                state: Some(RuleState::Disabled),
                ..RuleUpdate::default()
            },
        )
    }

    /// Delete a rule outright (unblock). Returns the removed rule.
    pub fn remove_rule(
        &self,
        rule_id: RuleId,
        expected_revision: u64,
    ) -> Result<FirewallRule, StoreError> {
        self.commit(move |set, _| {
            let existing = set
                .rules
                .get(&rule_id)
                .ok_or(StoreError::NotFound { kind: "rule", id: rule_id })?;
            check_revision("rule", rule_id, expected_revision, existing.revision)?;
            Ok((vec![RuleChange::RemoveRule { rule_id }], existing.clone()))
        })
    }

    pub fn get_rule(&self, rule_id: RuleId) -> Result<FirewallRule, StoreError> {
        self.read()
            .ruleset
            .rules
            .get(&rule_id)
            .cloned()
            .ok_or(StoreError::NotFound { kind: "rule", id: rule_id })
    }

    /// Standalone rules, oldest first.
    pub fn list_rules(&self) -> Vec<FirewallRule> {
        let mut rules: Vec<FirewallRule> = self.read().ruleset.rules.values().cloned().collect();
        rules.sort_by(|a, b| {
            a.created_seq
                .cmp(&b.created_seq)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        rules
    }

    // ── Templates ──────────────────────────────────────────────

    pub fn create_template(
        &self,
        mut template: PolicyTemplate,
    ) -> Result<PolicyTemplate, StoreError> {
        template.validate()?;
        self.commit(move |set, version| {
            if let Some(existing) = set.templates.get(&template.template_id) {
                return Err(conflict(
                    "template",
                    template.template_id,
                    0,
                    existing.revision,
                ));
            }
            let now = Utc::now();
            stamp_rules(&mut template.rules, &[], version);
            template.revision = version.get();
            template.created_at = now;
            template.modified_at = now;
            Ok((
                vec![RuleChange::UpsertTemplate {
                    template: template.clone(),
                }],
                template,
            ))
        })
    }

    pub fn update_template(
        &self,
        template_id: Uuid,
        expected_revision: u64,
        update: TemplateUpdate,
    ) -> Result<PolicyTemplate, StoreError> {
        self.commit(move |set, version| {
            let existing = set.templates.get(&template_id).ok_or(StoreError::NotFound {
                kind: "template",
                id: template_id,
            })?;
            check_revision("template", template_id, expected_revision, existing.revision)?;
            let mut template = existing.clone();
            if let Some(name) = update.name {
                template.name = name;
            }
            if let Some(description) = update.description {
                template.description = Some(description);
            }
            if let Some(mut rules) = update.rules {
                stamp_rules(&mut rules, &existing.rules, version);
                template.rules = rules;
            }
            template.validate()?;
            template.revision = version.get();
            template.modified_at = Utc::now();
            Ok((
                vec![RuleChange::UpsertTemplate {
                    template: template.clone(),
                }],
                template,
            ))
        })
    }

    pub fn remove_template(
        &self,
        template_id: Uuid,
        expected_revision: u64,
    ) -> Result<PolicyTemplate, StoreError> {
        self.commit(move |set, _| {
            let existing = set.templates.get(&template_id).ok_or(StoreError::NotFound {
                kind: "template",
                id: template_id,
            })?;
            check_revision("template", template_id, expected_revision, existing.revision)?;
            let assignments = set
                .assignments
                .values()
                .filter(|a| a.template_id == template_id)
                .count();
            if assignments > 0 {
                return Err(StoreError::TemplateInUse {
                    template_id,
                    assignments,
                });
            }
            Ok((
                vec![RuleChange::RemoveTemplate { template_id }],
                existing.clone(),
            ))
        })
    }

    pub fn get_template(&self, template_id: Uuid) -> Result<PolicyTemplate, StoreError> {
        self.read()
            .ruleset
            .templates
            .get(&template_id)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "template",
                id: template_id,
            })
    }

    pub fn list_templates(&self) -> Vec<PolicyTemplate> {
        let mut templates: Vec<PolicyTemplate> =
            self.read().ruleset.templates.values().cloned().collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name).then(a.template_id.cmp(&b.template_id)));
        templates
    }

    // ── Assignments ────────────────────────────────────────────

    pub fn create_assignment(
        &self,
        mut assignment: PolicyAssignment,
    ) -> Result<PolicyAssignment, StoreError> {
        assignment.validate()?;
        self.commit(move |set, version| {
            if let Some(existing) = set.assignments.get(&assignment.assignment_id) {
                return Err(conflict(
                    "assignment",
                    assignment.assignment_id,
                    0,
                    existing.revision,
                ));
            }
            if !set.templates.contains_key(&assignment.template_id) {
                return Err(RuleError::UnknownTemplate(assignment.template_id).into());
            }
            let now = Utc::now();
            stamp_rules(&mut assignment.overrides, &[], version);
            assignment.revision = version.get();
            assignment.created_at = now;
            assignment.modified_at = now;
            Ok((
                vec![RuleChange::UpsertAssignment {
                    assignment: assignment.clone(),
                }],
                assignment,
            ))
        })
    }

    /// Replace the override set of an assignment.
    pub fn update_assignment(
        &self,
        assignment_id: Uuid,
        expected_revision: u64,
        mut overrides: Vec<FirewallRule>,
    ) -> Result<PolicyAssignment, StoreError> {
        overrides.iter().try_for_each(FirewallRule::validate)?;
        self.commit(move |set, version| {
            let existing = set.assignments.get(&assignment_id).ok_or(StoreError::NotFound {
                kind: "assignment",
                id: assignment_id,
            })?;
            check_revision(
                "assignment",
                assignment_id,
                expected_revision,
                existing.revision,
            )?;
            stamp_rules(&mut overrides, &existing.overrides, version);
            let mut assignment = existing.clone();
            assignment.overrides = overrides;
            assignment.revision = version.get();
            assignment.modified_at = Utc::now();
            Ok((
                vec![RuleChange::UpsertAssignment {
                    assignment: assignment.clone(),
                }],
                assignment,
            ))
        })
    }

    pub fn remove_assignment(
        &self,
        assignment_id: Uuid,
        expected_revision: u64,
    ) -> Result<PolicyAssignment, StoreError> {
        self.commit(move |set, _| {
            let existing = set.assignments.get(&assignment_id).ok_or(StoreError::NotFound {
                kind: "assignment",
                id: assignment_id,
            })?;
            check_revision(
                "assignment",
                assignment_id,
                expected_revision,
                existing.revision,
            )?;
            Ok((
                vec![RuleChange::RemoveAssignment { assignment_id }],
                existing.clone(),
            ))
        })
    }

    pub fn get_assignment(&self, assignment_id: Uuid) -> Result<PolicyAssignment, StoreError> {
        self.read()
            .ruleset
            .assignments
            .get(&assignment_id)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "assignment",
                id: assignment_id,
            })
    }

    pub fn list_assignments(&self) -> Vec<PolicyAssignment> {
        self.read().ruleset.assignments.values().cloned().collect()
    }

    // ── Distribution ───────────────────────────────────────────

    /// Everything an agent at `since` needs to reach the current version.
    ///
    /// Deltas when the change log still covers `since`, otherwise (or when
    /// the agent claims a version this store never issued) a full snapshot.
    pub fn changes_since(&self, since: RuleSetVersion) -> PullResponse {
        let state = self.read();
        let current = state.ruleset.version;
        if since == current {
            return PullResponse::UpToDate { version: current };
        }
        let covered = state
            .changes
            .front()
            .is_some_and(|first| first.from_version <= since);
        if since < current && covered {
            let deltas = state
                .changes
                .iter()
                .filter(|d| d.to_version > since)
                .cloned()
                .collect();
            PullResponse::Deltas { deltas }
        } else {
            PullResponse::Snapshot {
                ruleset: state.ruleset.clone(),
            }
        }
    }

    /// Run one mutation: build the changes against the current state, apply
    /// them as a single delta, persist, swap and publish.
    fn commit<T>(
        &self,
        build: impl FnOnce(&RuleSet, RuleSetVersion) -> Result<(Vec<RuleChange>, T), StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.read();
        let next_version = current.ruleset.version.next();
        let (changes, value) = build(&current.ruleset, next_version)?;

        let delta = RuleDelta::new(current.ruleset.version, changes);
        let ruleset = current.ruleset.apply(&delta)?;
        let mut log = current.changes.clone();
        log.push_back(delta.clone());
        while log.len() > self.retention {
            log.pop_front();
        }
        let next = Arc::new(StoreState {
            ruleset,
            changes: log,
        });

        if let Some(path) = &self.path {
            persist(path, &next)?;
        }
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;

        tracing::info!(
            version = %delta.to_version,
            changes = delta.changes.len(),
            "rule set committed"
        );
        if let Some(publisher) = &self.publisher {
            publisher.publish(&delta);
        }
        Ok(value)
    }
}

fn persist(path: &Path, state: &StoreState) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| StoreError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

fn conflict(kind: &str, id: Uuid, expected: u64, actual: u64) -> StoreError {
    StoreError::Conflict {
        object: format!("{} {}", kind, id),
        expected,
        actual,
    }
}

fn check_revision(kind: &str, id: Uuid, expected: u64, actual: u64) -> Result<(), StoreError> {
    if expected == actual {
        Ok(())
    } else {
        Err(conflict(kind, id, expected, actual))
    }
}

/// Stamp revision and modification time on every rule in `rules`. Rules not
/// present in `previous` are new and also get their creation sequence.
fn stamp_rules(rules: &mut [FirewallRule], previous: &[FirewallRule], version: RuleSetVersion) {
    let now = Utc::now();
    for rule in rules {
        match previous.iter().find(|p| p.rule_id == rule.rule_id) {
            Some(prev) => {
                rule.created_seq = prev.created_seq;
                rule.created_at = prev.created_at;
            }
            None => {
                rule.created_seq = version.get();
                rule.created_at = now;
            }
        }
        rule.revision = version.get();
        rule.modified_at = now;
    }
}
