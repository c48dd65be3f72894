// workflow.rs — Two-phase search-and-block.
//
// Phase one binds an operator to the exact, ordered candidate list a search
// returned. Phase two resolves an ordinal against that list, never against
// a fresh search, and refuses if the list is no longer what the operator
// saw. Each operator holds at most one live session; searching again
// replaces it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aw_audit::hasher::hash_json;
use aw_rules::{Action, ApplicationIdentity, FirewallRule, MatchClause, RuleId, RuleSelector};

use crate::catalog::ApplicationCatalog;
use crate::error::{StaleReason, WorkflowError};
use crate::store::RuleStore;

/// The SEARCHED state of one operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchSession {
    pub session_id: Uuid,
    pub operator: String,
    pub query: String,
    pub candidates: Vec<ApplicationIdentity>,
    /// SHA-256 over the canonical JSON of `candidates`.
    pub digest: String,
    pub searched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Candidate {
    /// 1-based.
    pub ordinal: usize,
    pub identity: ApplicationIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchResult {
    pub session_id: Uuid,
    pub query: String,
    pub candidates: Vec<Candidate>,
    pub digest: String,
    pub expires_at: DateTime<Utc>,
}

/// Phase two: which candidate, and what to do with it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockSelection {
    pub session_id: Uuid,
    pub ordinal: usize,
    pub clause: MatchClause,
    #[serde(default = "default_action")]
    pub action: Action,
    #[serde(default)]
    pub priority: i32,
    /// The digest the client was shown; checked when present.
    #[serde(default)]
    pub expected_digest: Option<String>,
}

fn default_action() -> Action {
    Action::Deny
}

pub struct SearchAndBlock {
    catalog: Arc<ApplicationCatalog>,
    store: Arc<RuleStore>,
    sessions: DashMap<String, SearchSession>,
    ttl: chrono::Duration,
}

impl SearchAndBlock {
    pub fn new(catalog: Arc<ApplicationCatalog>, store: Arc<RuleStore>, ttl: Duration) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            catalog,
            store,
            sessions: DashMap::new(),
            ttl: chrono::Duration::milliseconds(ttl_ms),
        }
    }

    pub fn search(&self, operator: &str, query: &str) -> SearchResult {
        let candidates = self.catalog.search(query);
        let digest = digest(&candidates);
        let searched_at = Utc::now();
        let session = SearchSession {
            session_id: Uuid::new_v4(),
            operator: operator.to_string(),
            query: query.to_string(),
            candidates,
            digest,
            searched_at,
            expires_at: searched_at + self.ttl,
        };
        tracing::info!(
            operator,
            query,
            candidates = session.candidates.len(),
            session = %session.session_id,
            "search session opened"
        );
        let result = SearchResult {
            session_id: session.session_id,
            query: session.query.clone(),
            candidates: session
                .candidates
                .iter()
                .enumerate()
                .map(|(i, identity)| Candidate {
                    ordinal: i + 1,
                    identity: identity.clone(),
                })
                .collect(),
            digest: session.digest.clone(),
            expires_at: session.expires_at,
        };
        self.sessions.insert(operator.to_string(), session);
        result
    }

    /// Create a rule for the candidate at `selection.ordinal`.
    ///
    /// The session is consumed on success and on any stale outcome. An
    /// out-of-range ordinal or a rejected rule leaves it in place so the
    /// operator can correct the input without searching again.
    pub fn commit(
        &self,
        operator: &str,
        selection: BlockSelection,
    ) -> Result<FirewallRule, WorkflowError> {
        let session = match self
            .sessions
            .remove_if(operator, |_, s| s.session_id == selection.session_id)
        {
            Some((_, session)) => session,
            None => {
                let reason = if self.sessions.contains_key(operator) {
                    StaleReason::Superseded
                } else {
                    StaleReason::UnknownSession
                };
                return Err(stale(operator, reason));
            }
        };

        if Utc::now() >= session.expires_at {
            return Err(stale(operator, StaleReason::Expired));
        }
        if selection
            .expected_digest
            .as_ref()
            .is_some_and(|d| *d != session.digest)
        {
            return Err(stale(operator, StaleReason::DigestMismatch));
        }
        if digest(&self.catalog.search(&session.query)) != session.digest {
            return Err(stale(operator, StaleReason::CandidatesChanged));
        }

        let Some(identity) = selection
            .ordinal
            .checked_sub(1)
            .and_then(|i| session.candidates.get(i))
            .cloned()
        else {
            let candidates = session.candidates.len();
            self.restore(session);
            return Err(WorkflowError::InvalidOrdinal {
                ordinal: selection.ordinal,
                candidates,
            });
        };

        let rule = FirewallRule::new(
            RuleSelector::Identity {
                identity: identity.clone(),
            },
            selection.clause,
            selection.action,
            selection.priority,
        )
        .with_description(format!("{} via search '{}'", operator, session.query));

        match self.store.create_rule(rule) {
            Ok(rule) => {
                tracing::info!(
                    operator,
                    application = %identity,
                    clause = %rule.clause,
                    action = %rule.action,
                    rule = %rule.rule_id,
                    "selection committed"
                );
                Ok(rule)
            }
            Err(e) => {
                self.restore(session);
                Err(e.into())
            }
        }
    }

    /// Remove a rule by id.
    pub fn unblock(
        &self,
        rule_id: RuleId,
        expected_revision: u64,
    ) -> Result<FirewallRule, WorkflowError> {
        let rule = self.store.remove_rule(rule_id, expected_revision)?;
        tracing::info!(rule = %rule_id, "rule removed");
        Ok(rule)
    }

    /// The live session of `operator`, if any.
    pub fn session(&self, operator: &str) -> Option<SearchSession> {
        self.sessions.get(operator).map(|s| s.value().clone())
    }

    /// Put a session back unless the operator has searched again meanwhile.
    fn restore(&self, session: SearchSession) {
        self.sessions
            .entry(session.operator.clone())
            .or_insert(session);
    }
}

fn stale(operator: &str, reason: StaleReason) -> WorkflowError {
    tracing::warn!(operator, %reason, "selection rejected");
    WorkflowError::StaleSelection { reason }
}

// Identities are plain strings; encoding them cannot fail.
fn digest(candidates: &[ApplicationIdentity]) -> String {
    hash_json(&candidates).unwrap_or_default()
}
