// search.rs — The two-phase search-and-block workflow from the command line.

use std::io::{BufRead, Write};

use clap::Args;
use uuid::Uuid;

use aw_authority::api::{BlockRequest, SearchRequest, UnblockRequest};
use aw_authority::{BlockSelection, SearchResult};
use aw_rules::{Action, FirewallRule, MatchClause};

use crate::client::AuthorityApi;

#[derive(Args)]
pub struct BlockArgs {
    /// What to block: a domain, IP, CIDR block or proto:port.
    #[arg(long)]
    pub target: String,

    /// Search now and pick from the results (interactive unless --ordinal is given).
    #[arg(long, conflicts_with = "session")]
    pub query: Option<String>,

    /// Session id printed by a previous `aw search`.
    #[arg(long)]
    pub session: Option<Uuid>,

    /// Candidate number from the search results (1-based).
    #[arg(long)]
    pub ordinal: Option<usize>,

    /// Candidate digest printed by `aw search`; rejects the block if the list changed.
    #[arg(long)]
    pub digest: Option<String>,

    #[arg(long, default_value = "deny")]
    pub action: Action,

    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub priority: i32,
}

pub fn search(api: &AuthorityApi, operator: &str, query: &str) -> anyhow::Result<()> {
    let result = run_search(api, operator, query)?;
    print!("{}", render_candidates(&result));
    if !result.candidates.is_empty() {
        println!();
        println!(
            "Block with: aw block --session {} --digest {} --ordinal <N> --target <TARGET>",
            result.session_id, result.digest
        );
    }
    Ok(())
}

fn run_search(api: &AuthorityApi, operator: &str, query: &str) -> anyhow::Result<SearchResult> {
    api.post(
        "/search",
        &SearchRequest {
            operator: operator.to_string(),
            query: query.to_string(),
        },
    )
}

pub fn block(api: &AuthorityApi, operator: &str, args: &BlockArgs) -> anyhow::Result<()> {
    let clause = MatchClause::parse_target(&args.target)?;

    let (session_id, ordinal, digest) = match (&args.query, args.session) {
        (Some(query), _) => {
            let result = run_search(api, operator, query)?;
            if result.candidates.is_empty() {
                anyhow::bail!("No application matches '{}'.", query);
            }
            let ordinal = match args.ordinal {
                Some(n) => n,
                None => {
                    print!("{}", render_candidates(&result));
                    prompt_ordinal(result.candidates.len())?
                }
            };
            (result.session_id, ordinal, Some(result.digest))
        }
        (None, Some(session)) => {
            let ordinal = args
                .ordinal
                .ok_or_else(|| anyhow::anyhow!("--ordinal is required with --session"))?;
            (session, ordinal, args.digest.clone())
        }
        (None, None) => anyhow::bail!("give either --query or --session"),
    };

    let rule: FirewallRule = api.post(
        "/block",
        &BlockRequest {
            operator: operator.to_string(),
            selection: BlockSelection {
                session_id,
                ordinal,
                clause,
                action: args.action,
                priority: args.priority,
                expected_digest: digest,
            },
        },
    )?;

    println!("Created rule {}", rule.rule_id);
    println!("  {} {} -> {}", rule.action, rule.selector, rule.clause);
    println!("  version {}", rule.created_seq);
    Ok(())
}

pub fn unblock(api: &AuthorityApi, rule_id: Uuid, revision: Option<u64>) -> anyhow::Result<()> {
    let expected_revision = match revision {
        Some(r) => r,
        None => {
            let rule: FirewallRule = api.get(&format!("/rules/{}", rule_id))?;
            rule.revision
        }
    };
    let removed: FirewallRule = api.post(
        "/unblock",
        &UnblockRequest {
            rule_id,
            expected_revision,
        },
    )?;
    println!(
        "Removed rule {} ({} {} -> {})",
        removed.rule_id, removed.action, removed.selector, removed.clause
    );
    Ok(())
}

fn prompt_ordinal(candidates: usize) -> anyhow::Result<usize> {
    print!("Pick 1-{}: ", candidates);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    parse_ordinal(&line, candidates)
}

fn parse_ordinal(input: &str, candidates: usize) -> anyhow::Result<usize> {
    let n: usize = input
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("'{}' is not a number", input.trim()))?;
    if n == 0 || n > candidates {
        anyhow::bail!("pick a number between 1 and {}", candidates);
    }
    Ok(n)
}

pub fn render_candidates(result: &SearchResult) -> String {
    if result.candidates.is_empty() {
        return format!("No application matches '{}'.\n", result.query);
    }
    let mut out = format!(
        "{} candidate(s) for '{}' (session {}, expires {}):\n",
        result.candidates.len(),
        result.query,
        result.session_id,
        result.expires_at.format("%H:%M:%S"),
    );
    for c in &result.candidates {
        out.push_str(&format!("  {:>3}. {}\n", c.ordinal, c.identity));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use aw_authority::Candidate;
    use aw_rules::ApplicationIdentity;
    use chrono::Utc;

    fn result(names: &[&str]) -> SearchResult {
        SearchResult {
            session_id: Uuid::new_v4(),
            query: "fire".into(),
            candidates: names
                .iter()
                .enumerate()
                .map(|(i, n)| Candidate {
                    ordinal: i + 1,
                    identity: ApplicationIdentity::new(*n),
                })
                .collect(),
            digest: "abc".into(),
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn candidates_are_numbered_from_one() {
        let out = render_candidates(&result(&["Firefox", "FireFTP"]));
        assert!(out.starts_with("2 candidate(s) for 'fire'"));
        assert!(out.contains("    1. Firefox\n"));
        assert!(out.contains("    2. FireFTP\n"));
    }

    #[test]
    fn empty_search_says_so() {
        assert_eq!(
            render_candidates(&result(&[])),
            "No application matches 'fire'.\n"
        );
    }

    #[test]
    fn ordinal_must_be_in_range() {
        assert_eq!(parse_ordinal("2\n", 2).unwrap(), 2);
        assert!(parse_ordinal("0", 2).is_err());
        assert!(parse_ordinal("3", 2).is_err());
        assert!(parse_ordinal("first", 2).is_err());
    }
}
