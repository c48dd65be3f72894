// templates.rs — Policy template and assignment subcommands.

use clap::Subcommand;
use uuid::Uuid;

use aw_authority::api::{
    CreateAssignmentRequest, CreateTemplateRequest, RuleSpec, UpdateAssignmentRequest,
    UpdateTemplateRequest,
};
use aw_rules::{PolicyAssignment, PolicyTemplate};

use super::{parse_rule_spec, short_id};
use crate::client::AuthorityApi;

#[derive(Subcommand)]
pub enum TemplateCommands {
    /// List templates.
    List,
    /// Show one template in full.
    Show { template_id: Uuid },
    /// Create a template.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// TARGET=ACTION[@PRIORITY], repeatable (e.g. --rule x.com=deny).
        #[arg(long = "rule")]
        rules: Vec<String>,
    },
    /// Rename a template or replace its rules.
    Update {
        template_id: Uuid,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Replaces the whole rule list when given.
        #[arg(long = "rule")]
        rules: Vec<String>,
    },
    /// Delete a template that no assignment references.
    Remove { template_id: Uuid },
}

#[derive(Subcommand)]
pub enum AssignmentCommands {
    /// List assignments.
    List,
    /// Bind a template to one application instance.
    Create {
        #[arg(long)]
        template: Uuid,
        #[arg(long)]
        instance: Uuid,
        /// Per-assignment override, TARGET=ACTION[@PRIORITY], repeatable.
        #[arg(long = "override")]
        overrides: Vec<String>,
    },
    /// Replace an assignment's overrides.
    Update {
        assignment_id: Uuid,
        #[arg(long = "override")]
        overrides: Vec<String>,
    },
    /// Remove an assignment.
    Remove { assignment_id: Uuid },
}

fn parse_specs(args: &[String]) -> anyhow::Result<Vec<RuleSpec>> {
    args.iter().map(|a| parse_rule_spec(a)).collect()
}

pub fn execute(cmd: &TemplateCommands, api: &AuthorityApi) -> anyhow::Result<()> {
    match cmd {
        TemplateCommands::List => {
            let templates: Vec<PolicyTemplate> = api.get("/templates")?;
            print!("{}", render_templates(&templates));
        }

        TemplateCommands::Show { template_id } => {
            let template: PolicyTemplate = api.get(&format!("/templates/{}", template_id))?;
            println!("{}", serde_json::to_string_pretty(&template)?);
        }

        TemplateCommands::Create {
            name,
            description,
            rules,
        } => {
            let template: PolicyTemplate = api.post(
                "/templates",
                &CreateTemplateRequest {
                    name: name.clone(),
                    description: description.clone(),
                    rules: parse_specs(rules)?,
                },
            )?;
            println!(
                "Created template {} '{}' with {} rule(s)",
                template.template_id,
                template.name,
                template.rules.len()
            );
        }

        TemplateCommands::Update {
            template_id,
            name,
            description,
            rules,
        } => {
            let path = format!("/templates/{}", template_id);
            let current: PolicyTemplate = api.get(&path)?;
            let rules = if rules.is_empty() {
                None
            } else {
                Some(parse_specs(rules)?)
            };
            let template: PolicyTemplate = api.post(
                &path,
                &UpdateTemplateRequest {
                    expected_revision: current.revision,
                    name: name.clone(),
                    description: description.clone(),
                    rules,
                },
            )?;
            println!(
                "Updated template {} (revision {})",
                template.template_id, template.revision
            );
        }

        TemplateCommands::Remove { template_id } => {
            let path = format!("/templates/{}", template_id);
            let current: PolicyTemplate = api.get(&path)?;
            let removed: PolicyTemplate =
                api.delete(&format!("{}?expected_revision={}", path, current.revision))?;
            println!("Removed template {} '{}'", removed.template_id, removed.name);
        }
    }

    Ok(())
}

pub fn execute_assignments(cmd: &AssignmentCommands, api: &AuthorityApi) -> anyhow::Result<()> {
    match cmd {
        AssignmentCommands::List => {
            let assignments: Vec<PolicyAssignment> = api.get("/assignments")?;
            print!("{}", render_assignments(&assignments));
        }

        AssignmentCommands::Create {
            template,
            instance,
            overrides,
        } => {
            let assignment: PolicyAssignment = api.post(
                "/assignments",
                &CreateAssignmentRequest {
                    template_id: *template,
                    instance_id: *instance,
                    overrides: parse_specs(overrides)?,
                },
            )?;
            println!("Created assignment {}", assignment.assignment_id);
        }

        AssignmentCommands::Update {
            assignment_id,
            overrides,
        } => {
            let path = format!("/assignments/{}", assignment_id);
            let current: PolicyAssignment = api.get(&path)?;
            let assignment: PolicyAssignment = api.post(
                &path,
                &UpdateAssignmentRequest {
                    expected_revision: current.revision,
                    overrides: parse_specs(overrides)?,
                },
            )?;
            println!(
                "Updated assignment {} ({} override(s))",
                assignment.assignment_id,
                assignment.overrides.len()
            );
        }

        AssignmentCommands::Remove { assignment_id } => {
            let path = format!("/assignments/{}", assignment_id);
            let current: PolicyAssignment = api.get(&path)?;
            let removed: PolicyAssignment =
                api.delete(&format!("{}?expected_revision={}", path, current.revision))?;
            println!("Removed assignment {}", removed.assignment_id);
        }
    }

    Ok(())
}

pub fn render_templates(templates: &[PolicyTemplate]) -> String {
    if templates.is_empty() {
        return "No templates.\n".to_string();
    }
    let mut out = format!("{:<10} {:<24} {:>5} {:>4}  DESCRIPTION\n", "ID", "NAME", "RULES", "REV");
    for t in templates {
        out.push_str(&format!(
            "{:<10} {:<24} {:>5} {:>4}  {}\n",
            short_id(&t.template_id),
            t.name,
            t.rules.len(),
            t.revision,
            t.description.as_deref().unwrap_or("-"),
        ));
    }
    out
}

pub fn render_assignments(assignments: &[PolicyAssignment]) -> String {
    if assignments.is_empty() {
        return "No assignments.\n".to_string();
    }
    let mut out = format!(
        "{:<10} {:<10} {:<38} {:>9}\n",
        "ID", "TEMPLATE", "INSTANCE", "OVERRIDES"
    );
    for a in assignments {
        out.push_str(&format!(
            "{:<10} {:<10} {:<38} {:>9}\n",
            short_id(&a.assignment_id),
            short_id(&a.template_id),
            a.instance_id,
            a.overrides.len(),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use aw_rules::{Action, FirewallRule, MatchClause, RuleSelector};

    #[test]
    fn template_rows() {
        let template = PolicyTemplate::new(
            "browsers",
            vec![FirewallRule::new(
                RuleSelector::Global,
                MatchClause::domain("x.com"),
                Action::Deny,
                0,
            )],
        );
        let out = render_templates(&[template.clone()]);
        let row = out.lines().nth(1).unwrap();
        assert!(row.starts_with(&short_id(&template.template_id)));
        assert!(row.contains("browsers"));
        assert!(row.ends_with("  -"));
    }

    #[test]
    fn assignment_rows_show_full_instance_id() {
        let instance = Uuid::new_v4();
        let assignment = PolicyAssignment::new(Uuid::new_v4(), instance);
        let out = render_assignments(&[assignment]);
        assert!(out.contains(&instance.to_string()));
        assert_eq!(render_assignments(&[]), "No assignments.\n");
    }

    #[test]
    fn bad_rule_argument_fails_the_whole_list() {
        let args = vec!["x.com=deny".to_string(), "nonsense".to_string()];
        assert!(parse_specs(&args).is_err());
        let args = vec!["x.com=deny".to_string(), "udp:53=allow".to_string()];
        assert_eq!(parse_specs(&args).unwrap().len(), 2);
    }
}
