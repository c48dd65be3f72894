// rules.rs — Standalone rule subcommands: list, show, add, set, disable, enable.

use clap::Subcommand;
use uuid::Uuid;

use aw_authority::api::{CreateRuleRequest, RuleSpec, UpdateRuleRequest};
use aw_authority::RuleUpdate;
use aw_rules::{Action, ApplicationIdentity, FirewallRule, MatchClause, RuleSelector, RuleState};

use super::{describe, short_id};
use crate::client::AuthorityApi;

#[derive(Subcommand)]
pub enum RuleCommands {
    /// List rules in creation order.
    List {
        /// Include disabled rules.
        #[arg(long)]
        all: bool,
    },
    /// Show one rule in full.
    Show { rule_id: Uuid },
    /// Create a rule directly, without the search step.
    Add {
        /// Domain, IP, CIDR block or proto:port.
        #[arg(long)]
        target: String,
        /// Application name (every instance, every endpoint).
        #[arg(long, conflicts_with_all = ["instance", "global"])]
        app: Option<String>,
        /// Publisher, to narrow --app.
        #[arg(long, requires = "app")]
        publisher: Option<String>,
        /// One installed instance.
        #[arg(long, conflicts_with = "global")]
        instance: Option<Uuid>,
        /// Every attributed flow.
        #[arg(long)]
        global: bool,
        #[arg(long, default_value = "deny")]
        action: Action,
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        priority: i32,
        #[arg(long)]
        description: Option<String>,
    },
    /// Change fields of an existing rule.
    Set {
        rule_id: Uuid,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        action: Option<Action>,
        #[arg(long, allow_hyphen_values = true)]
        priority: Option<i32>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Keep a rule but stop enforcing it.
    Disable { rule_id: Uuid },
    /// Enforce a disabled rule again.
    Enable { rule_id: Uuid },
}

pub fn execute(cmd: Option<&RuleCommands>, api: &AuthorityApi) -> anyhow::Result<()> {
    let default = RuleCommands::List { all: false };
    match cmd.unwrap_or(&default) {
        RuleCommands::List { all } => {
            let rules: Vec<FirewallRule> = api.get("/rules")?;
            let shown: Vec<FirewallRule> = rules
                .into_iter()
                .filter(|r| *all || r.is_active())
                .collect();
            print!("{}", render_rules(&shown));
        }

        RuleCommands::Show { rule_id } => {
            let rule: FirewallRule = api.get(&format!("/rules/{}", rule_id))?;
            println!("{}", serde_json::to_string_pretty(&rule)?);
        }

        RuleCommands::Add {
            target,
            app,
            publisher,
            instance,
            global,
            action,
            priority,
            description,
        } => {
            let selector = selector_from(app.as_deref(), publisher.as_deref(), *instance, *global)?;
            let request = CreateRuleRequest {
                selector,
                rule: RuleSpec {
                    rule_id: None,
                    clause: MatchClause::parse_target(target)?,
                    action: *action,
                    priority: *priority,
                    description: description.clone(),
                },
            };
            let rule: FirewallRule = api.post("/rules", &request)?;
            println!("Created rule {}", rule.rule_id);
            println!("  {}", describe(&rule.selector, &rule.clause, rule.action));
        }

        RuleCommands::Set {
            rule_id,
            target,
            action,
            priority,
            description,
        } => {
            let clause = target
                .as_deref()
                .map(MatchClause::parse_target)
                .transpose()?;
            let rule = update(
                api,
                *rule_id,
                RuleUpdate {
                    clause,
                    action: *action,
                    priority: *priority,
                    state: None,
                    description: description.clone(),
                },
            )?;
            println!("Updated rule {} (revision {})", rule.rule_id, rule.revision);
        }

        RuleCommands::Disable { rule_id } => {
            let rule = set_state(api, *rule_id, RuleState::Disabled)?;
            println!("Disabled rule {}", rule.rule_id);
        }

        RuleCommands::Enable { rule_id } => {
            let rule = set_state(api, *rule_id, RuleState::Active)?;
            println!("Enabled rule {}", rule.rule_id);
        }
    }

    Ok(())
}

fn set_state(api: &AuthorityApi, rule_id: Uuid, state: RuleState) -> anyhow::Result<FirewallRule> {
    update(
        api,
        rule_id,
        RuleUpdate {
            state: Some(state),
            ..RuleUpdate::default()
        },
    )
}

/// Read-then-write against the revision just read.
fn update(api: &AuthorityApi, rule_id: Uuid, update: RuleUpdate) -> anyhow::Result<FirewallRule> {
    let current: FirewallRule = api.get(&format!("/rules/{}", rule_id))?;
    api.post(
        &format!("/rules/{}", rule_id),
        &UpdateRuleRequest {
            expected_revision: current.revision,
            update,
        },
    )
}

fn selector_from(
    app: Option<&str>,
    publisher: Option<&str>,
    instance: Option<Uuid>,
    global: bool,
) -> anyhow::Result<RuleSelector> {
    match (app, instance, global) {
        (Some(name), None, false) => {
            let mut identity = ApplicationIdentity::new(name);
            if let Some(p) = publisher {
                identity = identity.with_publisher(p);
            }
            Ok(RuleSelector::Identity { identity })
        }
        (None, Some(instance_id), false) => Ok(RuleSelector::Instance { instance_id }),
        (None, None, true) => Ok(RuleSelector::Global),
        _ => anyhow::bail!("give exactly one of --app, --instance or --global"),
    }
}

pub fn render_rules(rules: &[FirewallRule]) -> String {
    if rules.is_empty() {
        return "No rules.\n".to_string();
    }
    let mut out = format!(
        "{:<10} {:<9} {:<6} {:>5} {:>5}  {:<30} CLAUSE\n",
        "ID", "STATE", "ACTION", "PRI", "SEQ", "SCOPE"
    );
    out.push_str(&"-".repeat(90));
    out.push('\n');
    for rule in rules {
        let state = match rule.state {
            RuleState::Active => "active",
            RuleState::Disabled => "disabled",
        };
        out.push_str(&format!(
            "{:<10} {:<9} {:<6} {:>5} {:>5}  {:<30} {}\n",
            short_id(&rule.rule_id),
            state,
            rule.action.to_string(),
            rule.priority,
            rule.created_seq,
            truncate(&rule.selector.to_string(), 30),
            rule.clause,
        ));
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max - 1).collect();
        format!("{}…", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_needs_exactly_one_scope() {
        assert_eq!(
            selector_from(None, None, None, true).unwrap(),
            RuleSelector::Global
        );
        match selector_from(Some("Firefox"), Some("Mozilla"), None, false).unwrap() {
            RuleSelector::Identity { identity } => {
                assert_eq!(identity.name, "Firefox");
                assert_eq!(identity.publisher.as_deref(), Some("Mozilla"));
            }
            other => panic!("unexpected selector {:?}", other),
        }
        assert!(selector_from(None, None, None, false).is_err());
        assert!(selector_from(Some("a"), None, Some(Uuid::new_v4()), false).is_err());
    }

    #[test]
    fn rule_rows() {
        let mut rule = FirewallRule::new(
            RuleSelector::Identity {
                identity: ApplicationIdentity::new("Firefox"),
            },
            MatchClause::domain("x.com"),
            Action::Deny,
            5,
        );
        rule.created_seq = 7;
        let out = render_rules(&[rule.clone()]);
        let row = out.lines().nth(2).unwrap();
        assert!(row.starts_with(&short_id(&rule.rule_id)));
        assert!(row.contains("active"));
        assert!(row.contains("deny"));
        assert!(row.contains("app Firefox"));
        assert!(row.ends_with("x.com"));

        assert_eq!(render_rules(&[]), "No rules.\n");
    }

    #[test]
    fn long_scopes_are_truncated() {
        assert_eq!(truncate("abcdef", 4), "abc…");
        assert_eq!(truncate("abc", 4), "abc");
    }
}
