// distribution.rs — Serving rule-set versions to agents.
//
// Agents register, pull what they are missing, heartbeat the version they
// enforce, and listen for pushed deltas. Nothing here takes the store's
// mutation lock: pulls and heartbeats read a committed snapshot only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use aw_audit::{AuditBatch, AuditDecision, AuditLog, AuditRecord, SharedAuditLog};
use aw_rules::{
    AgentStats, ApplicationIdentity, Heartbeat, HeartbeatAck, PullRequest, PullResponse,
    PushNotice, Registration, RegistrationAck, RuleDelta, RuleSetVersion,
};

use crate::catalog::ApplicationCatalog;
use crate::error::DistributionError;
use crate::store::RuleStore;

/// Fan-out of committed deltas.
///
/// Each subscriber has its own bounded queue. A subscriber that falls behind
/// sees `RecvError::Lagged` and must pull; it never slows the others down.
#[derive(Debug, Clone)]
pub struct DeltaPublisher {
    tx: broadcast::Sender<PushNotice>,
}

impl DeltaPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of subscribers the notice was queued for.
    pub fn publish(&self, delta: &RuleDelta) -> usize {
        self.tx
            .send(PushNotice {
                delta: delta.clone(),
            })
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushNotice> {
        self.tx.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// What the authority knows about one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentRecord {
    pub endpoint_id: String,
    pub hostname: String,
    pub capabilities: Vec<String>,
    pub applied_version: RuleSetVersion,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub stats: AgentStats,
}

pub struct Distributor {
    store: Arc<RuleStore>,
    publisher: DeltaPublisher,
    agents: DashMap<String, AgentRecord>,
    audit: Arc<SharedAuditLog>,
    catalog: Arc<ApplicationCatalog>,
    tally: AuditTally,
}

/// Running counts over the central audit log.
#[derive(Debug, Default)]
pub struct AuditTally {
    records: AtomicUsize,
    denied: AtomicUsize,
}

impl AuditTally {
    fn add(&self, records: &[AuditRecord]) {
        let denied = records
            .iter()
            .filter(|r| r.decision == AuditDecision::Deny)
            .count();
        self.records.fetch_add(records.len(), Ordering::Relaxed);
        self.denied.fetch_add(denied, Ordering::Relaxed);
    }

    pub fn records(&self) -> usize {
        self.records.load(Ordering::Relaxed)
    }

    pub fn denied(&self) -> usize {
        self.denied.load(Ordering::Relaxed)
    }
}

impl Distributor {
    pub fn new(
        store: Arc<RuleStore>,
        publisher: DeltaPublisher,
        audit: Arc<SharedAuditLog>,
        catalog: Arc<ApplicationCatalog>,
    ) -> Self {
        Self {
            store,
            publisher,
            agents: DashMap::new(),
            audit,
            catalog,
            tally: AuditTally::default(),
        }
    }

    /// Seed the audit tally from what the central log already holds.
    /// Called once at startup; ingest keeps it current afterwards.
    pub fn count_existing_audit(&self) -> Result<usize, DistributionError> {
        let path = self.audit.path()?;
        let existing = AuditLog::read_all(&path)?;
        self.tally.add(&existing);
        Ok(existing.len())
    }

    /// Record (or refresh) an endpoint. Re-registration after a reconnect
    /// replaces the previous record.
    pub fn register(&self, registration: Registration) -> RegistrationAck {
        let now = Utc::now();
        let current = self.store.version();
        tracing::info!(
            endpoint = %registration.endpoint_id,
            applied = %registration.applied_version,
            current = %current,
            "agent registered"
        );
        self.agents.insert(
            registration.endpoint_id.clone(),
            AgentRecord {
                endpoint_id: registration.endpoint_id.clone(),
                hostname: registration.hostname,
                capabilities: registration.capabilities,
                applied_version: registration.applied_version,
                registered_at: now,
                last_heartbeat: None,
                stats: AgentStats::default(),
            },
        );
        RegistrationAck {
            endpoint_id: registration.endpoint_id,
            current_version: current,
            registered_at: now,
        }
    }

    pub fn pull(&self, request: &PullRequest) -> PullResponse {
        let response = self.store.changes_since(request.since_version);
        tracing::debug!(
            endpoint = %request.endpoint_id,
            since = %request.since_version,
            snapshot = matches!(response, PullResponse::Snapshot { .. }),
            "pull served"
        );
        response
    }

    pub fn heartbeat(&self, heartbeat: Heartbeat) -> Result<HeartbeatAck, DistributionError> {
        let current = self.store.version();
        let mut record = self
            .agents
            .get_mut(&heartbeat.endpoint_id)
            .ok_or_else(|| DistributionError::UnknownEndpoint(heartbeat.endpoint_id.clone()))?;
        record.applied_version = heartbeat.applied_version;
        record.last_heartbeat = Some(heartbeat.sent_at);
        record.stats = heartbeat.stats;
        let behind = heartbeat.applied_version < current;
        if behind {
            tracing::debug!(
                endpoint = %heartbeat.endpoint_id,
                applied = %heartbeat.applied_version,
                current = %current,
                "agent is behind"
            );
        }
        Ok(HeartbeatAck {
            current_version: current,
            behind,
        })
    }

    /// All known endpoints, by endpoint id.
    pub fn agents(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self.agents.iter().map(|e| e.value().clone()).collect();
        agents.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        agents
    }

    /// Endpoints whose last reported version is older than the store's.
    pub fn lagging_agents(&self) -> Vec<AgentRecord> {
        let current = self.store.version();
        self.agents()
            .into_iter()
            .filter(|a| a.applied_version < current)
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushNotice> {
        self.publisher.subscribe()
    }

    /// Append an agent's audit records to the central log and learn the
    /// applications they name.
    pub fn ingest_audit(&self, batch: AuditBatch) -> Result<usize, DistributionError> {
        let endpoint_id = batch.endpoint_id.clone();
        for instance in batch.records.iter().filter_map(|r| r.instance.as_ref()) {
            let mut identity = ApplicationIdentity::new(&instance.application);
            if let Some(hash) = &instance.content_hash {
                identity = identity.with_content_hash(hash);
            }
            self.catalog.observe(identity);
        }
        let counted = batch.records.clone();
        let written = self.audit.append_batch(batch.records)?;
        self.tally.add(&counted);
        tracing::debug!(endpoint = %endpoint_id, records = written, "audit batch ingested");
        Ok(written)
    }

    pub fn audit(&self) -> &Arc<SharedAuditLog> {
        &self.audit
    }

    pub fn tally(&self) -> &AuditTally {
        &self.tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aw_audit::{AuditLog, AuditQuery, AuditRecord, Enforcement, FlowMetadata};
    use aw_rules::{
        Action, ApplicationInstance, FirewallRule, MatchClause, Protocol, RuleSelector,
    };
    use tokio::sync::broadcast::error::RecvError;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<RuleStore>,
        catalog: Arc<ApplicationCatalog>,
        distributor: Distributor,
    }

    fn fixture(capacity: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let publisher = DeltaPublisher::new(capacity);
        let store = Arc::new(RuleStore::in_memory().with_publisher(publisher.clone()));
        let audit = Arc::new(SharedAuditLog::open(dir.path().join("audit.jsonl")).unwrap());
        let catalog = Arc::new(ApplicationCatalog::new());
        let distributor = Distributor::new(store.clone(), publisher, audit, catalog.clone());
        Fixture {
            _dir: dir,
            store,
            catalog,
            distributor,
        }
    }

    fn global_deny(domain: &str) -> FirewallRule {
        FirewallRule::new(
            RuleSelector::Global,
            MatchClause::domain(domain),
            Action::Deny,
            0,
        )
    }

    fn registration(endpoint: &str, version: u64) -> Registration {
        Registration {
            endpoint_id: endpoint.into(),
            hostname: format!("{}.corp", endpoint),
            capabilities: vec!["iptables".into()],
            applied_version: RuleSetVersion(version),
        }
    }

    fn heartbeat(endpoint: &str, version: u64) -> Heartbeat {
        Heartbeat {
            endpoint_id: endpoint.into(),
            applied_version: RuleSetVersion(version),
            stats: AgentStats::default(),
            sent_at: Utc::now(),
        }
    }

    #[test]
    fn heartbeat_reports_behind_and_tracks_lag() {
        let fx = fixture(8);
        fx.store.create_rule(global_deny("x.com")).unwrap();

        let ack = fx.distributor.register(registration("e1", 0));
        assert_eq!(ack.current_version, RuleSetVersion(1));
        fx.distributor.register(registration("e2", 1));

        let ack = fx.distributor.heartbeat(heartbeat("e1", 0)).unwrap();
        assert!(ack.behind);
        let lagging: Vec<String> = fx
            .distributor
            .lagging_agents()
            .into_iter()
            .map(|a| a.endpoint_id)
            .collect();
        assert_eq!(lagging, vec!["e1".to_string()]);

        let ack = fx.distributor.heartbeat(heartbeat("e1", 1)).unwrap();
        assert!(!ack.behind);
        assert!(fx.distributor.lagging_agents().is_empty());
        assert_eq!(fx.distributor.agents().len(), 2);
    }

    #[test]
    fn heartbeat_from_unknown_endpoint_is_rejected() {
        let fx = fixture(8);
        assert!(matches!(
            fx.distributor.heartbeat(heartbeat("ghost", 0)),
            Err(DistributionError::UnknownEndpoint(_))
        ));
    }

    #[test]
    fn pull_returns_missing_deltas() {
        let fx = fixture(8);
        fx.store.create_rule(global_deny("a.com")).unwrap();
        fx.store.create_rule(global_deny("b.com")).unwrap();
        let response = fx.distributor.pull(&PullRequest {
            endpoint_id: "e1".into(),
            since_version: RuleSetVersion(1),
        });
        match response {
            PullResponse::Deltas { deltas } => assert_eq!(deltas.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn subscribers_are_independent_and_laggards_are_told() {
        let fx = fixture(2);
        let mut slow = fx.distributor.subscribe();
        let mut fast = fx.distributor.subscribe();

        fx.store.create_rule(global_deny("a.com")).unwrap();
        assert_eq!(
            fast.recv().await.unwrap().delta.to_version,
            RuleSetVersion(1)
        );
        fx.store.create_rule(global_deny("b.com")).unwrap();
        fx.store.create_rule(global_deny("c.com")).unwrap();
        assert_eq!(
            fast.recv().await.unwrap().delta.to_version,
            RuleSetVersion(2)
        );
        assert_eq!(
            fast.recv().await.unwrap().delta.to_version,
            RuleSetVersion(3)
        );

        // Three notices into a queue of two: the slow subscriber lagged.
        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(1))));
        assert_eq!(
            slow.recv().await.unwrap().delta.to_version,
            RuleSetVersion(2)
        );
    }

    #[test]
    fn ingested_audit_is_chained_and_learned() {
        let fx = fixture(8);
        let instance = ApplicationInstance::new(
            ApplicationIdentity::new("Thunderbird").with_content_hash("ab12"),
            "e1",
            "/usr/bin/thunderbird",
            None,
        );
        let records = (0..3)
            .map(|_| {
                AuditRecord::decision(
                    "e1",
                    Action::Allow,
                    Enforcement::Permitted,
                    FlowMetadata::new("198.51.100.4".parse().unwrap(), 993, Protocol::Tcp),
                )
                .with_instance(&instance)
            })
            .collect();
        let written = fx
            .distributor
            .ingest_audit(AuditBatch {
                endpoint_id: "e1".into(),
                records,
            })
            .unwrap();
        assert_eq!(written, 3);

        let path = fx.distributor.audit().path().unwrap();
        assert_eq!(AuditLog::verify_chain(&path).unwrap(), 3);
        let found = AuditLog::query(
            &path,
            &AuditQuery {
                instance: Some(instance.instance_id),
                ..AuditQuery::default()
            },
        )
        .unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(fx.catalog.search("thunder").len(), 1);
        assert_eq!(fx.distributor.tally().records(), 3);
        assert_eq!(fx.distributor.tally().denied(), 0);
    }

    #[test]
    fn tally_resumes_from_existing_log() {
        let fx = fixture(8);
        let flow = || FlowMetadata::new("198.51.100.4".parse().unwrap(), 443, Protocol::Tcp);
        fx.distributor
            .ingest_audit(AuditBatch {
                endpoint_id: "e1".into(),
                records: vec![
                    AuditRecord::decision("e1", Action::Deny, Enforcement::Terminated, flow()),
                    AuditRecord::decision("e1", Action::Allow, Enforcement::Permitted, flow()),
                ],
            })
            .unwrap();

        let restarted = Distributor::new(
            fx.store.clone(),
            DeltaPublisher::new(8),
            fx.distributor.audit().clone(),
            fx.catalog.clone(),
        );
        assert_eq!(restarted.tally().records(), 0);
        assert_eq!(restarted.count_existing_audit().unwrap(), 2);
        assert_eq!(restarted.tally().records(), 2);
        assert_eq!(restarted.tally().denied(), 1);
    }
}
