// catalog.rs — Applications operators can search for.
//
// Seeded from `authority.toml` and grown from what agents report. Keyed by
// `ApplicationIdentity::key()`, so two builds with different content hashes,
// or two unhashed applications from different publishers, stay distinct
// entries even when they share a name.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aw_rules::ApplicationIdentity;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub identity: ApplicationIdentity,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ApplicationCatalog {
    entries: RwLock<BTreeMap<String, CatalogEntry>>,
}

impl ApplicationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(identities: impl IntoIterator<Item = ApplicationIdentity>) -> Self {
        let catalog = Self::new();
        for identity in identities {
            catalog.observe(identity);
        }
        catalog
    }

    /// Add `identity` if it is not known yet. Returns true when it was new.
    pub fn observe(&self, identity: ApplicationIdentity) -> bool {
        let key = identity.key();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&key) || adds_nothing(&identity, entries.values()) {
            return false;
        }
        tracing::info!(application = %identity, "application added to catalog");
        entries.insert(
            key,
            CatalogEntry {
                identity,
                first_seen: Utc::now(),
            },
        );
        true
    }

    /// Case-insensitive substring match on the name, ordered by name and
    /// then key so the same catalog always yields the same list.
    pub fn search(&self, query: &str) -> Vec<ApplicationIdentity> {
        let needle = query.trim().to_lowercase();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<(String, &String, &ApplicationIdentity)> = entries
            .iter()
            .filter(|(_, e)| e.identity.name.to_lowercase().contains(&needle))
            .map(|(key, e)| (e.identity.name.to_lowercase(), key, &e.identity))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        found.into_iter().map(|(_, _, id)| id.clone()).collect()
    }

    pub fn list(&self) -> Vec<CatalogEntry> {
        let mut all: Vec<CatalogEntry> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| {
            a.identity
                .name
                .to_lowercase()
                .cmp(&b.identity.name.to_lowercase())
                .then_with(|| a.identity.key().cmp(&b.identity.key()))
        });
        all
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A bare name already covered by a known unhashed entry of that name.
fn adds_nothing<'a>(
    identity: &ApplicationIdentity,
    mut known: impl Iterator<Item = &'a CatalogEntry>,
) -> bool {
    identity.content_hash.is_none()
        && identity.publisher.is_none()
        && known.any(|e| {
            e.identity.content_hash.is_none() && e.identity.name.eq_ignore_ascii_case(&identity.name)
        })
}
