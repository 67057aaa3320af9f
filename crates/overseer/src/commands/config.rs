use std::fs;

use anyhow::{Context, Result};

use crate::config::{self, AppContext, detect_mode};
use crate::utils::log::t;
use crate::utils::term::print_table;
use crate::utils::which::which;
use crate::utils::wizard::{Choice, Wizard};
use crate::{log_info, log_success, log_warn};

const NO_AGENT: &str = "none";

/// Agents whose executable is on PATH, with the resolved path.
fn detected_agents(ctx: &AppContext) -> Vec<(String, Option<String>)> {
  ctx
    .config
    .agents
    .iter()
    .map(|(name, agent)| {
      let found = agent
        .cmd
        .first()
        .and_then(|program| which(program))
        .map(|p| p.display().to_string());
      (name.clone(), found)
    })
    .collect()
}

/// The template with `agent` set to `name`.
fn render_template(agent: Option<&str>) -> String {
  let template = config::config_template();
  let Some(name) = agent else {
    return template.to_string();
  };
  template
    .lines()
    .map(|line| {
      if line.trim_start().starts_with("# agent =") {
        format!("agent = \"{name}\"")
      } else {
        line.to_string()
      }
    })
    .collect::<Vec<_>>()
    .join("\n")
    + "\n"
}

pub fn setup(ctx: &AppContext, yes: bool) -> Result<()> {
  let path = ctx.paths.project_config();
  let wizard = Wizard::new();
  let mut agent = None;
  if !yes {
    let prompt = if path.exists() {
      format!("Replace the existing {}?", t::path(path.display()))
    } else {
      format!("Write project configuration to {}?", t::path(path.display()))
    };
    if !wizard.confirm(&prompt, !path.exists())? {
      log_info!("Nothing written.");
      return Ok(());
    }

    let mut options = vec![Choice {
      value: NO_AGENT.to_string(),
      label: NO_AGENT.to_string(),
      detail: Some("(start agents yourself)".to_string()),
    }];
    for (name, found) in detected_agents(ctx) {
      if let Some(found) = found {
        options.push(Choice {
          value: name.clone(),
          label: name,
          detail: Some(format!("({found})")),
        });
      }
    }
    let picked = wizard.select(
      "Which agent should overseer launch?",
      &options,
      ctx.config.agent.as_deref(),
    )?;
    agent = (picked != NO_AGENT).then_some(picked);
  }

  let dir = ctx.paths.state_dir();
  fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
  fs::write(&path, render_template(agent.as_deref()))
    .with_context(|| format!("failed to write {}", path.display()))?;
  log_success!("Wrote {}", t::path(".overseer/overseer.toml"));
  if let Some(agent) = agent {
    log_info!("Dispatched agents are launched with {}.", t::role(agent));
  }
  Ok(())
}

pub fn detect(ctx: &AppContext) -> Result<()> {
  let mode = detect_mode(ctx.paths.root());
  log_info!("Mode:    {}", mode);
  let configured = ctx.config.agent.as_deref().unwrap_or("(none)");
  log_info!("Agent:   {}", configured);
  if let Ok(agent_cmd) = std::env::var("OVERSEER_AGENT_CMD")
    && !agent_cmd.trim().is_empty()
  {
    log_info!("Override: OVERSEER_AGENT_CMD={}", agent_cmd);
  }

  let global = config::global_config_path()?;
  let project = ctx.paths.project_config();
  for (label, path) in [("Global:", global), ("Project:", project)] {
    let marker = if path.exists() { t::ok("found") } else { "absent".to_string() };
    log_info!("{:<8} {} ({})", label, t::path(path.display()), marker);
  }

  log_info!("");
  let agents = detected_agents(ctx);
  let rows: Vec<Vec<String>> = agents
    .iter()
    .map(|(name, found)| {
      vec![
        t::role(name),
        found.as_ref().map_or_else(|| t::warn("not on PATH"), t::ok),
      ]
    })
    .collect();
  print_table(&["AGENT", "EXECUTABLE"], &rows);
  if agents.iter().all(|(_, found)| found.is_none()) {
    log_warn!("No configured agent executable was found on PATH");
  }
  Ok(())
}
