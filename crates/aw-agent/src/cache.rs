// cache.rs — Local rule cache.
//
// The agent's read-only mirror of the authority's rule set. Readers load the
// current `Arc<RuleSet>` without locking; writers build a complete new
// snapshot, persist it, and swap it in. An evaluator therefore always sees
// one whole version, never a half-applied delta.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use aw_rules::{RuleDelta, RuleSet, RuleSetVersion};

use crate::error::AgentError;

/// What happened to an offered delta or snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The cache moved to this version.
    Applied(RuleSetVersion),
    /// Already at or past the offered version; nothing changed.
    Ignored {
        current: RuleSetVersion,
        offered: RuleSetVersion,
    },
    /// The delta starts from a version the cache does not hold. Nothing
    /// changed; the caller should pull.
    Gap {
        current: RuleSetVersion,
        from: RuleSetVersion,
    },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(_))
    }
}

pub struct RuleCache {
    current: ArcSwap<RuleSet>,
    writer: Mutex<()>,
    path: Option<PathBuf>,
}

impl RuleCache {
    /// A cache that is not persisted.
    pub fn in_memory() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSet::empty()),
            writer: Mutex::new(()),
            path: None,
        }
    }

    /// Open a persisted cache, loading the last applied rule set if present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref().to_path_buf();
        let ruleset = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| AgentError::io(&path, e))?;
            let ruleset: RuleSet = serde_json::from_str(&content)?;
            tracing::info!(
                path = %path.display(),
                version = %ruleset.version,
                rules = ruleset.rules.len(),
                "loaded cached rule set"
            );
            ruleset
        } else {
            RuleSet::empty()
        };
        Ok(Self {
            current: ArcSwap::from_pointee(ruleset),
            writer: Mutex::new(()),
            path: Some(path),
        })
    }

    /// The current snapshot. Never blocks.
    pub fn load(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    pub fn version(&self) -> RuleSetVersion {
        self.current.load().version
    }

    pub fn apply_delta(&self, delta: &RuleDelta) -> Result<ApplyOutcome, AgentError> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.current.load_full();

        if delta.to_version <= current.version {
            tracing::debug!(
                current = %current.version,
                offered = %delta.to_version,
                "ignoring delta at or below applied version"
            );
            return Ok(ApplyOutcome::Ignored {
                current: current.version,
                offered: delta.to_version,
            });
        }
        if delta.from_version != current.version {
            tracing::warn!(
                current = %current.version,
                from = %delta.from_version,
                to = %delta.to_version,
                "delta does not follow applied version"
            );
            return Ok(ApplyOutcome::Gap {
                current: current.version,
                from: delta.from_version,
            });
        }

        let next = current.apply(delta)?;
        self.persist(&next)?;
        let version = next.version;
        self.current.store(Arc::new(next));
        tracing::info!(version = %version, changes = delta.changes.len(), "applied rule delta");
        Ok(ApplyOutcome::Applied(version))
    }

    /// Replace the whole rule set with a newer snapshot.
    pub fn replace(&self, ruleset: RuleSet) -> Result<ApplyOutcome, AgentError> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.current.load().version;
        if ruleset.version <= current {
            return Ok(ApplyOutcome::Ignored {
                current,
                offered: ruleset.version,
            });
        }
        self.persist(&ruleset)?;
        let version = ruleset.version;
        self.current.store(Arc::new(ruleset));
        tracing::info!(version = %version, "replaced rule set from snapshot");
        Ok(ApplyOutcome::Applied(version))
    }

    fn persist(&self, ruleset: &RuleSet) -> Result<(), AgentError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AgentError::io(parent, e))?;
        }
        let json = serde_json::to_vec_pretty(ruleset)?;
        let tmp = path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp).map_err(|e| AgentError::io(&tmp, e))?;
        file.write_all(&json).map_err(|e| AgentError::io(&tmp, e))?;
        file.sync_all().map_err(|e| AgentError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| AgentError::io(path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aw_rules::{Action, FirewallRule, MatchClause, RuleChange, RuleSelector};
    use tempfile::tempdir;

    fn delta(from: u64) -> RuleDelta {
        let rule = FirewallRule::new(
            RuleSelector::Global,
            MatchClause::domain("ads.example.com"),
            Action::Deny,
            0,
        );
        RuleDelta::new(RuleSetVersion(from), vec![RuleChange::UpsertRule { rule }])
    }

    #[test]
    fn applies_in_order() {
        let cache = RuleCache::in_memory();
        assert_eq!(
            cache.apply_delta(&delta(0)).unwrap(),
            ApplyOutcome::Applied(RuleSetVersion(1))
        );
        assert_eq!(
            cache.apply_delta(&delta(1)).unwrap(),
            ApplyOutcome::Applied(RuleSetVersion(2))
        );
        assert_eq!(cache.load().rules.len(), 2);
    }

    #[test]
    fn duplicate_delta_is_a_no_op() {
        let cache = RuleCache::in_memory();
        let d = delta(0);
        cache.apply_delta(&d).unwrap();
        let before = cache.load();
        assert!(matches!(
            cache.apply_delta(&d).unwrap(),
            ApplyOutcome::Ignored { .. }
        ));
        assert_eq!(*cache.load(), *before);
    }

    #[test]
    fn out_of_order_delta_is_rejected_without_change() {
        let cache = RuleCache::in_memory();
        cache.apply_delta(&delta(0)).unwrap();
        let outcome = cache.apply_delta(&delta(3)).unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Gap {
                current: RuleSetVersion(1),
                from: RuleSetVersion(3)
            }
        );
        assert_eq!(cache.version(), RuleSetVersion(1));
        assert_eq!(cache.load().rules.len(), 1);
    }

    #[test]
    fn readers_keep_their_snapshot_across_updates() {
        let cache = RuleCache::in_memory();
        let held = cache.load();
        cache.apply_delta(&delta(0)).unwrap();
        assert_eq!(held.version, RuleSetVersion::ZERO);
        assert!(held.rules.is_empty());
        assert_eq!(cache.version(), RuleSetVersion(1));
    }

    #[test]
    fn survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("ruleset.json");
        {
            let cache = RuleCache::open(&path).unwrap();
            cache.apply_delta(&delta(0)).unwrap();
            cache.apply_delta(&delta(1)).unwrap();
        }
        let reopened = RuleCache::open(&path).unwrap();
        assert_eq!(reopened.version(), RuleSetVersion(2));
        assert_eq!(reopened.load().rules.len(), 2);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn older_snapshot_is_ignored() {
        let cache = RuleCache::in_memory();
        cache.apply_delta(&delta(0)).unwrap();
        cache.apply_delta(&delta(1)).unwrap();
        let stale = RuleSet::empty().apply(&delta(0)).unwrap();
        assert!(matches!(
            cache.replace(stale).unwrap(),
            ApplyOutcome::Ignored { .. }
        ));
        assert_eq!(cache.version(), RuleSetVersion(2));
    }
}
