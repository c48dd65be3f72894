// audit.rs — Audit subcommands: verify, tail, query.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::Subcommand;
use uuid::Uuid;

use aw_audit::{AuditDecision, AuditLog, AuditQuery, AuditRecord};
use aw_authority::AuthorityConfig;

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Verify the audit log hash chain integrity.
    Verify {
        /// Path to audit log (defaults to .appwall/audit.jsonl).
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Show recent decisions.
    Tail {
        /// Path to audit log (defaults to .appwall/audit.jsonl).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Number of records to show.
        #[arg(short, default_value = "10")]
        n: usize,
    },
    /// Filter decisions by endpoint, instance and time.
    Query {
        #[arg(long)]
        log: Option<PathBuf>,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        instance: Option<Uuid>,
        /// RFC 3339 lower bound, inclusive.
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// RFC 3339 upper bound, inclusive.
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        /// Only denied flows.
        #[arg(long)]
        denied: bool,
        #[arg(long)]
        limit: Option<usize>,
        /// Print full records as JSON lines.
        #[arg(long)]
        json: bool,
    },
}

pub fn execute(cmd: &AuditCommands, config: &AuthorityConfig) -> anyhow::Result<()> {
    match cmd {
        AuditCommands::Verify { log } => {
            let path = log.clone().unwrap_or_else(|| config.audit_log());

            if !path.exists() {
                println!("No audit log found at {}", path.display());
                return Ok(());
            }

            match AuditLog::verify_chain(&path) {
                Ok(count) => {
                    println!(
                        "Audit log verified: {} record(s), hash chain intact.",
                        count
                    );
                }
                Err(aw_audit::AuditError::IntegrityViolation {
                    line,
                    expected,
                    actual,
                }) => {
                    println!("INTEGRITY VIOLATION at line {}:", line);
                    println!("  Expected previous_hash: {}", expected);
                    println!("  Actual previous_hash:   {}", actual);
                    println!();
                    println!("The audit log may have been tampered with.");
                    anyhow::bail!("Audit log integrity check failed");
                }
                Err(e) => return Err(e.into()),
            }
        }

        AuditCommands::Tail { log, n } => {
            let path = log.clone().unwrap_or_else(|| config.audit_log());

            if !path.exists() {
                println!("No audit log found at {}", path.display());
                return Ok(());
            }

            let records = AuditLog::query(
                &path,
                &AuditQuery {
                    limit: Some(*n),
                    ..AuditQuery::default()
                },
            )?;
            print!("{}", render_records(&records));
        }

        AuditCommands::Query {
            log,
            endpoint,
            instance,
            since,
            until,
            denied,
            limit,
            json,
        } => {
            let path = log.clone().unwrap_or_else(|| config.audit_log());
            let query = AuditQuery {
                since: *since,
                until: *until,
                instance: *instance,
                endpoint: endpoint.clone(),
                // Applied after the decision filter below.
                limit: None,
            };
            let mut records = AuditLog::query(&path, &query)?;
            if *denied {
                records.retain(|r| r.decision == AuditDecision::Deny);
            }
            if let Some(limit) = limit {
                let skip = records.len().saturating_sub(*limit);
                records.drain(..skip);
            }

            if *json {
                for record in &records {
                    println!("{}", serde_json::to_string(record)?);
                }
            } else {
                print!("{}", render_records(&records));
            }
        }
    }

    Ok(())
}

fn decision_label(decision: AuditDecision) -> &'static str {
    match decision {
        AuditDecision::Allow => "allow",
        AuditDecision::Deny => "deny",
        AuditDecision::Discarded => "discarded",
    }
}

pub fn render_records(records: &[AuditRecord]) -> String {
    if records.is_empty() {
        return "No audit records.\n".to_string();
    }
    let mut out = format!(
        "{:<20} {:<14} {:<18} {:<10} {:>4}  DESTINATION\n",
        "TIMESTAMP", "ENDPOINT", "APPLICATION", "DECISION", "VER"
    );
    out.push_str(&"-".repeat(90));
    out.push('\n');
    for r in records {
        let application = r
            .instance
            .as_ref()
            .map(|i| i.application.as_str())
            .unwrap_or("(unattributed)");
        let destination = match &r.flow.domain {
            Some(domain) => format!("{}:{} ({})", domain, r.flow.remote_port, r.flow.service),
            None => format!(
                "{}:{} ({})",
                r.flow.remote_ip, r.flow.remote_port, r.flow.service
            ),
        };
        let mut decision = decision_label(r.decision).to_string();
        if r.sweep {
            decision.push('*');
        }
        out.push_str(&format!(
            "{:<20} {:<14} {:<18} {:<10} {:>4}  {}\n",
            r.timestamp.format("%Y-%m-%d %H:%M:%S"),
            r.endpoint_id,
            application,
            decision,
            r.ruleset_version.get(),
            destination,
        ));
    }
    out
}
