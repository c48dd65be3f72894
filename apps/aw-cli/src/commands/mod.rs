pub mod audit;
pub mod rules;
pub mod search;
pub mod status;
pub mod templates;

use aw_authority::api::RuleSpec;
use aw_rules::{Action, MatchClause, RuleSelector};

/// Shorten a UUID for table output.
pub fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Parse `TARGET=ACTION[@PRIORITY]`, e.g. `x.com=deny`, `tcp:22=allow@10`.
pub fn parse_rule_spec(arg: &str) -> anyhow::Result<RuleSpec> {
    let (target, rest) = arg
        .rsplit_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected TARGET=ACTION, got '{}'", arg))?;
    let (action, priority) = match rest.split_once('@') {
        Some((action, priority)) => (
            action,
            priority
                .parse()
                .map_err(|_| anyhow::anyhow!("bad priority '{}'", priority))?,
        ),
        None => (rest, 0),
    };
    Ok(RuleSpec {
        rule_id: None,
        clause: MatchClause::parse_target(target)?,
        action: action.parse::<Action>()?,
        priority,
        description: None,
    })
}

/// One-line summary of a rule's scope and clause.
pub fn describe(selector: &RuleSelector, clause: &MatchClause, action: Action) -> String {
    format!("{} {} -> {}", action, selector, clause)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aw_rules::{PortRange, Protocol};

    #[test]
    fn rule_spec_forms() {
        let spec = parse_rule_spec("x.com=deny").unwrap();
        assert_eq!(spec.clause, MatchClause::domain("x.com"));
        assert_eq!(spec.action, Action::Deny);
        assert_eq!(spec.priority, 0);

        let spec = parse_rule_spec("tcp:22=allow@10").unwrap();
        assert_eq!(
            spec.clause,
            MatchClause::ProtocolPorts {
                protocol: Protocol::Tcp,
                ports: PortRange::single(22)
            }
        );
        assert_eq!(spec.action, Action::Allow);
        assert_eq!(spec.priority, 10);

        let spec = parse_rule_spec("10.0.0.0/8=block").unwrap();
        assert_eq!(spec.action, Action::Deny);
    }

    #[test]
    fn rule_spec_rejects_garbage() {
        assert!(parse_rule_spec("x.com").is_err());
        assert!(parse_rule_spec("x.com=maybe").is_err());
        assert!(parse_rule_spec("x.com=deny@high").is_err());
        assert!(parse_rule_spec("=deny").is_err());
    }

    #[test]
    fn describe_reads_left_to_right() {
        let line = describe(
            &RuleSelector::Global,
            &MatchClause::domain("*.example.com"),
            Action::Deny,
        );
        assert_eq!(line, "deny global -> *.example.com");
    }
}
