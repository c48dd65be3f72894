//! # aw-cli
//!
//! Command-line administration for AppWall.
//!
//! - `aw search <query>` / `aw block` / `aw unblock`: the search-and-block workflow
//! - `aw rules`, `aw templates`, `aw assignments`: rule set management
//! - `aw agents`, `aw apps`, `aw stats`: what the authority knows
//! - `aw audit verify/tail/query`: inspect a local audit log

mod client;
mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use aw_authority::AuthorityConfig;

use crate::client::AuthorityApi;

/// AppWall CLI: search, block and manage application network rules.
#[derive(Parser)]
#[command(name = "aw", version, about)]
struct Cli {
    /// Authority base URL.
    #[arg(long, default_value = "http://127.0.0.1:7300")]
    authority: String,

    /// Directory holding `.appwall/` state (used to locate the audit log).
    #[arg(long, default_value = ".")]
    state_dir: PathBuf,

    /// Operator name recorded on search sessions (defaults to $USER).
    #[arg(long)]
    operator: Option<String>,

    /// Log HTTP requests to stderr.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the application catalog; starts a selection session.
    Search {
        /// Case-insensitive substring of the application name.
        query: String,
    },
    /// Block (or allow) one application from the last search.
    Block(commands::search::BlockArgs),
    /// Remove a rule created by `aw block`.
    Unblock {
        rule_id: uuid::Uuid,
        /// Revision you expect the rule to be at (read from the authority if omitted).
        #[arg(long)]
        revision: Option<u64>,
    },
    /// Manage standalone rules.
    Rules {
        #[command(subcommand)]
        command: Option<commands::rules::RuleCommands>,
    },
    /// Manage policy templates.
    Templates {
        #[command(subcommand)]
        command: commands::templates::TemplateCommands,
    },
    /// Manage policy assignments.
    Assignments {
        #[command(subcommand)]
        command: commands::templates::AssignmentCommands,
    },
    /// List registered agents and the version each enforces.
    Agents,
    /// List applications in the catalog.
    Apps,
    /// Authority statistics.
    Stats,
    /// Inspect the audit trail.
    Audit {
        #[command(subcommand)]
        command: commands::audit::AuditCommands,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "aw_cli=debug" } else { "aw_cli=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = AuthorityConfig::for_dir(&cli.state_dir);
    let operator = cli
        .operator
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "operator".to_string());

    let api = AuthorityApi::new(&cli.authority)?;
    match &cli.command {
        Commands::Search { query } => commands::search::search(&api, &operator, query),
        Commands::Block(args) => commands::search::block(&api, &operator, args),
        Commands::Unblock { rule_id, revision } => {
            commands::search::unblock(&api, *rule_id, *revision)
        }
        Commands::Rules { command } => commands::rules::execute(command.as_ref(), &api),
        Commands::Templates { command } => commands::templates::execute(command, &api),
        Commands::Assignments { command } => commands::templates::execute_assignments(command, &api),
        Commands::Agents => commands::status::agents(&api),
        Commands::Apps => commands::status::apps(&api),
        Commands::Stats => commands::status::stats(&api),
        Commands::Audit { command } => commands::audit::execute(command, &config),
    }
}
