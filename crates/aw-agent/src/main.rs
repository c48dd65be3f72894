//! # aw-agent
//!
//! AppWall endpoint agent daemon.
//!
//! ## Usage
//!
//! ```text
//! aw-agent --config /etc/appwall/agent.toml run
//! aw-agent --state-dir . run --dry-run
//! aw-agent status
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use aw_agent::{
    Agent, AgentConfig, AgentStatus, AuditOutbox, DomainIndex, Enforcer, FirewallPrimitive,
    FlowAttributor, HttpAuthorityClient, IptablesPrimitive, MemoryPrimitive, PrimitiveKind,
    ProcInspector, RuleCache, SocketMonitor, SyncClient, SyncSettings, SystemResolver,
};
use aw_audit::SharedAuditLog;
use aw_rules::PolicyEvaluator;

/// AppWall endpoint agent.
#[derive(Parser)]
#[command(name = "aw-agent", version, about = "AppWall endpoint agent")]
struct Cli {
    /// Path to agent.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding `.appwall/` state when no config file is given.
    #[arg(long, default_value = ".")]
    state_dir: PathBuf,

    /// Authority base URL (overrides the config file).
    #[arg(long)]
    authority: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Attribute, evaluate and enforce outbound flows (default).
    Run {
        /// Use the in-memory primitive: decide and audit, touch no kernel state.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the running agent's last reported status.
    Status,
}

fn init_tracing(json: bool) -> Result<()> {
    // Logs go to stderr so stdout stays free for command output.
    let filter = EnvFilter::from_default_env()
        .add_directive("aw_agent=info".parse()?)
        .add_directive("aw_audit=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    let mut config = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::for_dir(&cli.state_dir),
    };
    if let Some(url) = cli.authority.clone() {
        config.authority_url = Some(url);
    }

    match cli.command.unwrap_or(Commands::Run { dry_run: false }) {
        Commands::Run { dry_run } => {
            if dry_run {
                config.primitive = PrimitiveKind::Memory;
            }
            run(config).await
        }
        Commands::Status => status(&config),
    }
}

async fn run(config: AgentConfig) -> Result<()> {
    tracing::info!(endpoint = %config.endpoint_id, "starting AppWall agent");

    let primitive: Arc<dyn FirewallPrimitive> = match config.primitive {
        PrimitiveKind::Iptables => Arc::new(IptablesPrimitive::new()),
        PrimitiveKind::Memory => {
            tracing::warn!("dry run: decisions are audited but not enforced in the kernel");
            Arc::new(MemoryPrimitive::new())
        }
    };
    let primitive_name = primitive.name().to_string();

    let domains = if config.resolve_domains {
        DomainIndex::new(
            Arc::new(SystemResolver::new(config.dns_timeout())),
            config.domain_ttl(),
        )
    } else {
        tracing::warn!("domain resolution off; domain rules match only flows with a known host name");
        DomainIndex::disabled()
    };

    let audit = Arc::new(SharedAuditLog::open(&config.audit_log)?);
    let outbox = Arc::new(AuditOutbox::new(audit));
    let enforcer = Arc::new(
        Enforcer::new(
            primitive,
            outbox.clone(),
            PolicyEvaluator::new(config.evaluator_config()),
            config.endpoint_id.clone(),
        )
        .context("refusing to run without an enforcement primitive")?
        .with_domains(Arc::new(domains)),
    );

    let cache = Arc::new(
        RuleCache::open(&config.cache_path).context("failed to load cached rule set")?,
    );
    let attributor = Arc::new(
        FlowAttributor::new(
            Arc::new(ProcInspector::new()),
            config.endpoint_id.clone(),
            config.attribution_timeout(),
        )
        .with_known_applications(config.applications.clone()),
    );
    let agent = Arc::new(Agent::new(attributor, enforcer.clone(), cache.clone()));
    enforcer.domains().ensure(&cache.load()).await;
    tracing::info!(
        version = %cache.version(),
        rules = cache.load().active_rule_count(),
        "enforcing"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sync_task = match &config.authority_url {
        Some(url) => {
            let client = Arc::new(HttpAuthorityClient::new(url.clone())?);
            let sync = SyncClient::new(
                client,
                cache.clone(),
                enforcer.clone(),
                SyncSettings {
                    endpoint_id: config.endpoint_id.clone(),
                    hostname: hostname(),
                    capabilities: vec![
                        primitive_name.clone(),
                        "terminate".to_string(),
                        "sweep".to_string(),
                    ],
                    heartbeat_interval: config.heartbeat_interval(),
                    initial_backoff: config.initial_backoff(),
                    max_backoff: config.max_backoff(),
                    sweep_on_push: config.sweep_on_push,
                },
            )
            .with_outbox(outbox.clone());
            let rx = shutdown_rx.clone();
            Some(tokio::spawn(async move { sync.run(rx).await }))
        }
        None => {
            tracing::info!("no authority configured; enforcing cached rule set only");
            None
        }
    };

    let mut monitor = SocketMonitor::new();
    let mut ticker = tokio::time::interval(config.poll_interval());
    let mut status_ticker = tokio::time::interval(std::time::Duration::from_secs(5));
    let status_path = config.status_path();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let events = match monitor.poll() {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::error!(error = %e, "socket scan failed");
                        continue;
                    }
                };
                for flow_id in events.closed {
                    if let Err(e) = agent.on_closed(flow_id) {
                        tracing::warn!(error = %e, "failed to clean up closed flow");
                    }
                }
                let decisions = futures_util::future::join_all(
                    events.opened.into_iter().map(|flow| {
                        let agent = Arc::clone(&agent);
                        async move { agent.on_flow(flow).await }
                    }),
                )
                .await;
                for result in decisions {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "enforcement failed");
                    }
                }
            }
            _ = status_ticker.tick() => {
                let status = AgentStatus {
                    endpoint_id: config.endpoint_id.clone(),
                    applied_version: agent.applied_version(),
                    primitive: primitive_name.clone(),
                    authority_url: config.authority_url.clone(),
                    stats: agent.stats(),
                    written_at: Utc::now(),
                };
                if let Err(e) = status.write(&status_path) {
                    tracing::warn!(error = %e, "could not write status file");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
        }
    }

    if shutdown_tx.send(true).is_err() {
        tracing::debug!("sync loop already gone");
    }
    if let Some(task) = sync_task {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "sync task ended abnormally");
        }
    }
    tracing::info!("AppWall agent stopped");
    Ok(())
}

fn status(config: &AgentConfig) -> Result<()> {
    let path = config.status_path();
    let status = AgentStatus::read(&path)
        .with_context(|| format!("no status at {} (is the agent running?)", path.display()))?;
    let age = Utc::now() - status.written_at;

    println!("Endpoint:        {}", status.endpoint_id);
    println!("Primitive:       {}", status.primitive);
    println!(
        "Authority:       {}",
        status.authority_url.as_deref().unwrap_or("(standalone)")
    );
    println!("Rule set:        {}", status.applied_version);
    println!("Active rules:    {}", status.stats.active_rules);
    println!("Flows:           {}", status.stats.total_flows);
    println!("  denied:        {}", status.stats.denied_flows);
    println!("  unattributed:  {}", status.stats.unattributed_flows);
    println!("  open:          {}", status.stats.open_flows);
    println!("  swept:         {}", status.stats.swept_flows);
    if let Some(started) = status.stats.started_at {
        println!("Started:         {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!(
        "Reported:        {} ({}s ago)",
        status.written_at.format("%Y-%m-%d %H:%M:%S UTC"),
        age.num_seconds()
    );
    Ok(())
}

fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|h| h.trim().to_string())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
