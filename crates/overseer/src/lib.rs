use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod breaker;
mod classifier;
mod commands;
mod config;
mod domain;
mod healing;
mod hooks;
mod machine;
mod monitor;
mod orchestrator;
mod store;
mod subteam;
mod utils;
mod watchdog;

use crate::config::{AppContext, OverseerPaths, load_config};
use crate::domain::Mode;
use crate::hooks::HookKind;
use crate::monitor::ProcessKind;
use crate::utils::clock::system_clock;

pub use crate::orchestrator::Blocked;

/// Version recorded in every state file this binary writes.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Overseer - drives a multi-agent task pipeline through planning, execution
/// and verification, and keeps it inside its budget.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
  /// Start a new project from a request
  Init {
    /// Execution mode; detected from the directory when omitted
    #[arg(long, value_enum)]
    mode: Option<Mode>,
    /// Replace a project that has not finished
    #[arg(long)]
    force: bool,
    /// What the agents should build or do
    #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
    request: Vec<String>,
  },
  /// Check the current step and advance when its exit condition holds
  Next {
    /// Open a human gate (template confirmation, plan review)
    #[arg(long)]
    confirm: bool,
  },
  /// Show phase, budget, team progress and findings
  Status {
    #[arg(long)]
    json: bool,
  },
  /// Hand an observed failure to the healing engine
  Heal {
    /// Error text; read from stdin when neither option is given
    #[arg(long, conflicts_with = "from_file")]
    error: Option<String>,
    #[arg(long, value_name = "PATH")]
    from_file: Option<PathBuf>,
  },
  /// Kill registered processes that no longer have a reason to run
  Sweep,
  /// Project configuration
  #[command(subcommand)]
  Config(ConfigCommand),
  /// Register an externally started process with the current project
  Register {
    pid: u32,
    #[arg(long, value_enum, default_value = "helper")]
    kind: ProcessKind,
    #[arg(long)]
    role: Option<String>,
  },
  /// Remove a process from the registry
  Unregister { pid: u32 },
  /// Answer an agent tool hook (JSON on stdin, decision on stdout)
  Hook {
    #[arg(value_enum)]
    kind: HookKind,
  },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
  /// Write a commented .overseer/overseer.toml
  Setup {
    /// Skip the prompts
    #[arg(long, short)]
    yes: bool,
  },
  /// Report agent executables on PATH and the execution mode
  Detect,
}

pub fn parse() -> Cli {
  Cli::parse()
}

pub fn run() -> Result<()> {
  let cli = parse();
  let cwd = std::env::current_dir()?;
  let ctx = AppContext {
    config: load_config(&cwd)?,
    paths: OverseerPaths::new(cwd),
    clock: system_clock(),
  };

  match cli.command {
    Commands::Init {
      mode,
      force,
      request,
    } => commands::init::run(&ctx, &request, mode, force),
    Commands::Next { confirm } => commands::next::run(&ctx, confirm),
    Commands::Status { json } => commands::status::run(&ctx, json),
    Commands::Heal { error, from_file } => {
      commands::heal::run(&ctx, error.as_deref(), from_file.as_deref())
    }
    Commands::Sweep => commands::sweep::run(&ctx),
    Commands::Config(ConfigCommand::Setup { yes }) => commands::config::setup(&ctx, yes),
    Commands::Config(ConfigCommand::Detect) => commands::config::detect(&ctx),
    Commands::Register { pid, kind, role } => commands::register::run(&ctx, pid, kind, role),
    Commands::Unregister { pid } => commands::register::run_unregister(&ctx, pid),
    Commands::Hook { kind } => commands::hook::run(&ctx, kind),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::{CommandFactory, error::ErrorKind};

  #[test]
  fn command_factory_builds() {
    Cli::command().debug_assert();
  }

  #[test]
  fn init_joins_trailing_words() {
    let cli = Cli::try_parse_from(["overseer", "init", "--mode", "work", "write", "a", "report"]).unwrap();
    match cli.command {
      Commands::Init { mode, request, .. } => {
        assert_eq!(mode, Some(Mode::Work));
        assert_eq!(request, vec!["write", "a", "report"]);
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn heal_sources_conflict() {
    let err = Cli::try_parse_from(["overseer", "heal", "--error", "x", "--from-file", "y"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
  }

  #[test]
  fn hook_kinds_are_kebab_case() {
    let cli = Cli::try_parse_from(["overseer", "hook", "pre-tool-use"]).unwrap();
    assert!(matches!(cli.command, Commands::Hook { kind: HookKind::PreToolUse }));
  }
}
