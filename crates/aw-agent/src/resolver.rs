// resolver.rs — Domain clauses resolved to destination addresses.
//
// Flows observed from the socket table carry only an address. The exact
// host names named by domain clauses are looked up and indexed by address,
// so a flow to one of those addresses matches the rule as if the host name
// had been seen on the wire. Wildcard patterns still match only flows whose
// host name is known.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;

use aw_rules::{RuleSet, RuleSetVersion};

use crate::error::AgentError;

/// Name-to-address lookup.
#[async_trait]
pub trait DomainResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, AgentError>;
}

/// The host's own resolver, through `getaddrinfo`.
#[derive(Debug, Clone)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl DomainResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, AgentError> {
        let failed = |reason: String| AgentError::Resolution {
            host: host.to_string(),
            reason,
        };
        let addrs = tokio::time::timeout(self.timeout, tokio::net::lookup_host((host, 0)))
            .await
            .map_err(|_| failed("lookup timed out".to_string()))?
            .map_err(|e| failed(e.to_string()))?;
        let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        ips.sort();
        ips.dedup();
        Ok(ips)
    }
}

/// Fixed answers. Unknown names fail to resolve.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    answers: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, host: &str, ips: &[IpAddr]) -> Self {
        self.answers.insert(host.to_ascii_lowercase(), ips.to_vec());
        self
    }
}

#[async_trait]
impl DomainResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, AgentError> {
        self.answers
            .get(host)
            .cloned()
            .ok_or_else(|| AgentError::Resolution {
                host: host.to_string(),
                reason: "no such host".to_string(),
            })
    }
}

#[derive(Debug, Default)]
struct AddressMap {
    version: Option<RuleSetVersion>,
    resolved_at: Option<Instant>,
    names: HashMap<IpAddr, BTreeSet<String>>,
}

impl AddressMap {
    fn addresses_of(&self, name: &str) -> Vec<IpAddr> {
        self.names
            .iter()
            .filter(|(_, names)| names.contains(name))
            .map(|(ip, _)| *ip)
            .collect()
    }
}

/// Address-to-name index for the domain clauses of the applied rule set.
///
/// Readers never wait: `names_for` reads the last published map. Refreshes
/// are serialized and swap in a complete new map.
pub struct DomainIndex {
    resolver: Option<Arc<dyn DomainResolver>>,
    ttl: Duration,
    current: ArcSwap<AddressMap>,
    refreshing: tokio::sync::Mutex<()>,
}

impl DomainIndex {
    pub fn new(resolver: Arc<dyn DomainResolver>, ttl: Duration) -> Self {
        Self {
            resolver: Some(resolver),
            ttl,
            current: ArcSwap::from_pointee(AddressMap::default()),
            refreshing: tokio::sync::Mutex::new(()),
        }
    }

    /// An index that never resolves anything; domain clauses then match
    /// only flows that carry a host name.
    pub fn disabled() -> Self {
        Self {
            resolver: None,
            ttl: Duration::MAX,
            current: ArcSwap::from_pointee(AddressMap::default()),
            refreshing: tokio::sync::Mutex::new(()),
        }
    }

    /// Rule domains that resolved to `ip`.
    pub fn names_for(&self, ip: IpAddr) -> Vec<String> {
        self.current
            .load()
            .names
            .get(&ip)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Version of the rule set the index was last built from.
    pub fn version(&self) -> Option<RuleSetVersion> {
        self.current.load().version
    }

    fn is_fresh(&self, ruleset: &RuleSet) -> bool {
        let map = self.current.load();
        map.version == Some(ruleset.version)
            && map.resolved_at.is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// Rebuild the index if it was built from another version or has
    /// outlived its TTL.
    pub async fn ensure(&self, ruleset: &RuleSet) {
        if self.resolver.is_none() || self.is_fresh(ruleset) {
            return;
        }
        let _guard = self.refreshing.lock().await;
        if self.is_fresh(ruleset) {
            return;
        }
        self.refresh(ruleset).await;
    }

    /// Resolve every exact domain named by `ruleset` and publish the result.
    ///
    /// A name that fails to resolve keeps the addresses it had before.
    pub async fn refresh(&self, ruleset: &RuleSet) {
        let Some(resolver) = &self.resolver else {
            return;
        };
        let previous = self.current.load_full();
        let mut names: HashMap<IpAddr, BTreeSet<String>> = HashMap::new();
        let mut failed = 0usize;

        for name in ruleset.domain_names() {
            let ips = match resolver.resolve(&name).await {
                Ok(ips) => ips,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(domain = %name, error = %e, "keeping previous addresses");
                    previous.addresses_of(&name)
                }
            };
            for ip in ips {
                names.entry(ip).or_default().insert(name.clone());
            }
        }

        tracing::debug!(
            version = %ruleset.version,
            addresses = names.len(),
            failed,
            "domain index rebuilt"
        );
        self.current.store(Arc::new(AddressMap {
            version: Some(ruleset.version),
            resolved_at: Some(Instant::now()),
            names,
        }));
    }
}

impl Default for DomainIndex {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aw_rules::{Action, FirewallRule, MatchClause, RuleChange, RuleDelta, RuleSelector};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn ruleset(patterns: &[&str]) -> RuleSet {
        let changes = patterns
            .iter()
            .map(|p| RuleChange::UpsertRule {
                rule: FirewallRule::new(RuleSelector::Global, MatchClause::domain(*p), Action::Deny, 0),
            })
            .collect();
        RuleSet::empty()
            .apply(&RuleDelta::new(RuleSetVersion::ZERO, changes))
            .unwrap()
    }

    struct Counting {
        inner: StaticResolver,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DomainResolver for Counting {
        async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(host).await
        }
    }

    #[tokio::test]
    async fn addresses_map_back_to_rule_domains() {
        let resolver = StaticResolver::new()
            .with("x.com", &[ip("104.244.42.1"), ip("2606:1f80::1")])
            .with("twitter.com", &[ip("104.244.42.1")]);
        let index = DomainIndex::new(Arc::new(resolver), Duration::from_secs(60));
        index.ensure(&ruleset(&["x.com", "twitter.com", "*.ads.example"])).await;

        assert_eq!(index.names_for(ip("104.244.42.1")), vec!["twitter.com", "x.com"]);
        assert_eq!(index.names_for(ip("2606:1f80::1")), vec!["x.com"]);
        assert!(index.names_for(ip("1.1.1.1")).is_empty());
        assert_eq!(index.version(), Some(RuleSetVersion(1)));
    }

    #[tokio::test]
    async fn same_version_is_not_resolved_twice() {
        let resolver = Arc::new(Counting {
            inner: StaticResolver::new().with("x.com", &[ip("104.244.42.1")]),
            calls: AtomicUsize::new(0),
        });
        let index = DomainIndex::new(resolver.clone(), Duration::from_secs(60));
        let set = ruleset(&["x.com"]);
        index.ensure(&set).await;
        index.ensure(&set).await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_lookup_keeps_last_known_addresses() {
        let index = DomainIndex::new(
            Arc::new(StaticResolver::new().with("x.com", &[ip("104.244.42.1")])),
            Duration::ZERO,
        );
        index.refresh(&ruleset(&["x.com"])).await;

        let offline = DomainIndex {
            resolver: Some(Arc::new(StaticResolver::new())),
            ttl: Duration::ZERO,
            current: ArcSwap::new(index.current.load_full()),
            refreshing: tokio::sync::Mutex::new(()),
        };
        offline.refresh(&ruleset(&["x.com"])).await;
        assert_eq!(offline.names_for(ip("104.244.42.1")), vec!["x.com"]);
    }

    #[tokio::test]
    async fn disabled_index_stays_empty() {
        let index = DomainIndex::disabled();
        index.ensure(&ruleset(&["x.com"])).await;
        assert!(index.names_for(ip("104.244.42.1")).is_empty());
        assert_eq!(index.version(), None);
    }
}
