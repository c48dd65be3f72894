//! End-to-end: a real agent sync loop against the authority over HTTP.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use aw_agent::{
    Attribution, AuditOutbox, Enforcer, FlowKey, HttpAuthorityClient, MemoryPrimitive,
    ObservedFlow, RuleCache, SyncClient, SyncSettings,
};
use aw_audit::{AuditLog, AuditQuery, Enforcement, MemorySink};
use aw_authority::{router, AppState, AuthorityConfig, BlockSelection};
use aw_rules::{
    Action, ApplicationIdentity, ApplicationInstance, EvaluatorConfig, FirewallRule, MatchClause,
    PolicyEvaluator, Protocol, RuleSelector, RuleSetVersion,
};

struct Authority {
    _dir: tempfile::TempDir,
    state: Arc<AppState>,
    url: String,
    audit_path: std::path::PathBuf,
}

async fn start_authority(retention: usize) -> Authority {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AuthorityConfig::for_dir(dir.path());
    config.change_log_retention = retention;
    config.catalog = vec![
        ApplicationIdentity::new("Firefox").with_publisher("Mozilla"),
        ApplicationIdentity::new("FireFTP"),
    ];
    let audit_path = config.audit_log();
    let state = Arc::new(AppState::open(&config).unwrap());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Authority {
        _dir: dir,
        state,
        url: format!("http://{}", addr),
        audit_path,
    }
}

struct Endpoint {
    cache: Arc<RuleCache>,
    enforcer: Arc<Enforcer>,
    shutdown: watch::Sender<bool>,
}

fn start_agent(url: &str) -> Endpoint {
    let cache = Arc::new(RuleCache::in_memory());
    let outbox = Arc::new(AuditOutbox::new(Arc::new(MemorySink::new())));
    let enforcer = Arc::new(
        Enforcer::new(
            Arc::new(MemoryPrimitive::new()),
            outbox.clone(),
            PolicyEvaluator::new(EvaluatorConfig::allow_by_default()),
            "e1",
        )
        .unwrap(),
    );
    let sync = SyncClient::new(
        Arc::new(HttpAuthorityClient::new(url).unwrap()),
        cache.clone(),
        enforcer.clone(),
        SyncSettings {
            endpoint_id: "e1".into(),
            hostname: "laptop".into(),
            capabilities: vec!["memory".into(), "sweep".into()],
            heartbeat_interval: Duration::from_millis(100),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            sweep_on_push: true,
        },
    )
    .with_outbox(outbox);

    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(async move { sync.run(rx).await });
    Endpoint {
        cache,
        enforcer,
        shutdown,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn instance(name: &str, publisher: Option<&str>) -> Attribution {
    let mut identity = ApplicationIdentity::new(name);
    if let Some(p) = publisher {
        identity = identity.with_publisher(p);
    }
    Attribution::Attributed(ApplicationInstance::new(
        identity,
        "e1",
        format!("/usr/bin/{}", name.to_lowercase()),
        None,
    ))
}

fn flow_to(domain: &str, local_port: u16) -> ObservedFlow {
    ObservedFlow::new(FlowKey {
        protocol: Protocol::Tcp,
        local_ip: "10.0.0.2".parse().unwrap(),
        local_port,
        remote_ip: "203.0.113.10".parse().unwrap(),
        remote_port: 443,
    })
    .with_domain(domain)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_application_is_enforced_on_the_endpoint() {
    let authority = start_authority(1024).await;
    let agent = start_agent(&authority.url);

    let state = authority.state.clone();
    assert!(
        eventually(|| state.distributor.agents().len() == 1).await,
        "agent never registered"
    );

    // A long-lived Firefox connection opened before any rule exists.
    let early = flow_to("x.com", 40001);
    let early_id = early.flow_id;
    let decision = agent
        .enforcer
        .handle(
            early,
            instance("Firefox", Some("Mozilla")),
            &agent.cache.load(),
        )
        .unwrap();
    assert_eq!(decision.enforcement, Enforcement::Permitted);

    // Operator blocks Firefox (ordinal 1) from x.com.
    let result = authority.state.workflow.search("alice", "fire");
    let rule = authority
        .state
        .workflow
        .commit(
            "alice",
            BlockSelection {
                session_id: result.session_id,
                ordinal: 1,
                clause: MatchClause::domain("x.com"),
                action: Action::Deny,
                priority: 0,
                expected_digest: Some(result.digest.clone()),
            },
        )
        .unwrap();
    assert_eq!(rule.created_seq, 1);

    let cache = agent.cache.clone();
    assert!(
        eventually(|| cache.version() == RuleSetVersion(1)).await,
        "delta never reached the agent"
    );
    // The sweep after the push tore the early connection down.
    let enforcer = agent.enforcer.clone();
    assert!(eventually(|| !enforcer.is_open(early_id)).await);

    let ruleset = agent.cache.load();
    let firefox = agent
        .enforcer
        .handle(
            flow_to("x.com", 40002),
            instance("Firefox", Some("Mozilla")),
            &ruleset,
        )
        .unwrap();
    assert_eq!(firefox.enforcement, Enforcement::Terminated);
    let fireftp = agent
        .enforcer
        .handle(flow_to("x.com", 40003), instance("FireFTP", None), &ruleset)
        .unwrap();
    assert_eq!(fireftp.enforcement, Enforcement::Permitted);

    // Records reach the central log with the next heartbeat.
    let audit_path = authority.audit_path.clone();
    assert!(
        eventually(|| {
            AuditLog::query(
                &audit_path,
                &AuditQuery {
                    endpoint: Some("e1".into()),
                    ..AuditQuery::default()
                },
            )
            .map(|r| r.len() >= 4)
            .unwrap_or(false)
        })
        .await,
        "audit records never uploaded"
    );
    assert!(AuditLog::verify_chain(&authority.audit_path).unwrap() >= 4);
    assert!(authority.state.distributor.lagging_agents().is_empty());

    let _ = agent.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_agent_catches_up_from_a_snapshot() {
    // No retained deltas: anything behind gets the full rule set.
    let authority = start_authority(0).await;
    for domain in ["a.example", "b.example", "c.example"] {
        authority
            .state
            .store
            .create_rule(FirewallRule::new(
                RuleSelector::Global,
                MatchClause::domain(domain),
                Action::Deny,
                0,
            ))
            .unwrap();
    }

    let agent = start_agent(&authority.url);
    let cache = agent.cache.clone();
    assert!(eventually(|| cache.version() == RuleSetVersion(3)).await);
    assert_eq!(agent.cache.load().rules.len(), 3);

    let _ = agent.shutdown.send(true);
}
