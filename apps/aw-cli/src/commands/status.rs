// status.rs — Read-only views: agents, catalog, authority stats.

use chrono::{DateTime, Utc};

use aw_authority::api::AuthorityStats;
use aw_authority::{AgentRecord, CatalogEntry};

use crate::client::AuthorityApi;

pub fn agents(api: &AuthorityApi) -> anyhow::Result<()> {
    let agents: Vec<AgentRecord> = api.get("/agents")?;
    let stats: AuthorityStats = api.get("/stats")?;
    print!("{}", render_agents(&agents, stats.version.get(), Utc::now()));
    Ok(())
}

pub fn apps(api: &AuthorityApi) -> anyhow::Result<()> {
    let entries: Vec<CatalogEntry> = api.get("/apps")?;
    if entries.is_empty() {
        println!("No applications in the catalog.");
        return Ok(());
    }
    println!("{:<40} FIRST SEEN", "APPLICATION");
    for entry in entries {
        println!(
            "{:<40} {}",
            entry.identity.to_string(),
            entry.first_seen.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub fn stats(api: &AuthorityApi) -> anyhow::Result<()> {
    let s: AuthorityStats = api.get("/stats")?;
    println!("Rule set version:  {}", s.version);
    println!("Rules:             {} ({} active)", s.rules, s.active_rules);
    println!("Templates:         {}", s.templates);
    println!("Assignments:       {}", s.assignments);
    println!("Applications:      {}", s.applications);
    println!("Agents:            {} ({} behind)", s.agents, s.lagging_agents);
    println!(
        "Audit records:     {} ({} denied)",
        s.audit_records, s.denied_records
    );
    Ok(())
}

pub fn render_agents(agents: &[AgentRecord], current: u64, now: DateTime<Utc>) -> String {
    if agents.is_empty() {
        return "No agents registered.\n".to_string();
    }
    let mut out = format!(
        "{:<20} {:<20} {:>8} {:<10} {:>7} {:>7}  LAST SEEN\n",
        "ENDPOINT", "HOST", "VERSION", "SYNC", "FLOWS", "DENIED"
    );
    for a in agents {
        let applied = a.applied_version.get();
        let sync = if applied >= current {
            "current".to_string()
        } else {
            format!("-{}", current - applied)
        };
        let last_seen = match a.last_heartbeat {
            Some(t) => format!("{}s ago", (now - t).num_seconds().max(0)),
            None => "never".to_string(),
        };
        out.push_str(&format!(
            "{:<20} {:<20} {:>8} {:<10} {:>7} {:>7}  {}\n",
            a.endpoint_id,
            a.hostname,
            applied,
            sync,
            a.stats.total_flows,
            a.stats.denied_flows,
            last_seen,
        ));
    }
    out
}
