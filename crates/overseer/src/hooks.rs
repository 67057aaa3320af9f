//! Agent tool hooks.
//!
//! A hook reads one JSON document from stdin, looks at the project state and
//! answers with `{"decision":"allow"}` or `{"decision":"block","reason":..}`.
//! Hooks never write anything; they run while other commands may hold the
//! state lock.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::breaker;
use crate::config::{AppContext, OverseerPaths};
use crate::domain::agent_result::read_result;
use crate::domain::{Phase, ProjectState};
use crate::store::StateStore;
use crate::store::json::JsonDoc;

/// Share of a ceiling after which `post-tool-use` starts warning.
pub const USAGE_WARNING_RATIO: f64 = 0.8;

const MUTATING_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit", "Bash"];
const PROTECTED_FILES: &[&str] = &["state.json", "processes.json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum HookKind {
  PreToolUse,
  PostToolUse,
  Stop,
}

/// The fields of the hook payload that matter here; everything else is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookInput {
  #[serde(default)]
  pub tool_name: Option<String>,
  #[serde(default)]
  pub tool_input: serde_json::Value,
  #[serde(default)]
  pub stop_hook_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum Decision {
  Allow,
  Block { reason: String },
}

impl Decision {
  fn block(reason: impl Into<String>) -> Self {
    Decision::Block {
      reason: reason.into(),
    }
  }
}

/// Identity of the agent a hook runs for, taken from the environment the
/// agent was dispatched with.
#[derive(Debug, Clone, Default)]
pub struct AgentEnv {
  pub output: Option<String>,
  pub role: Option<String>,
}

impl AgentEnv {
  #[must_use]
  pub fn from_env() -> Self {
    let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
    Self {
      output: var("OVERSEER_OUTPUT"),
      role: var("OVERSEER_ROLE"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookVerdict {
  pub decision: Decision,
  /// Printed to stderr; never part of the decision document.
  pub warnings: Vec<String>,
}

impl HookVerdict {
  fn allow() -> Self {
    Self {
      decision: Decision::Allow,
      warnings: Vec::new(),
    }
  }
}

fn shell_write_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(r"(>|\btee\b|\brm\b|\bmv\b|\bcp\b|\btruncate\b|\bsed\s+-i|\bdd\b|\bln\b)")
      .expect("valid shell write regex")
  })
}

fn is_protected_path(paths: &OverseerPaths, raw: &str) -> bool {
  let candidate = Path::new(raw);
  let abs: PathBuf = if candidate.is_absolute() {
    candidate.to_path_buf()
  } else {
    paths.root().join(candidate)
  };
  let normalized = abs.to_string_lossy().replace("/./", "/");
  PROTECTED_FILES.iter().any(|name| {
    let protected = paths.state_dir().join(name);
    normalized == protected.to_string_lossy()
      || raw.ends_with(&format!(".overseer/{name}"))
  })
}

/// Path-like strings in a tool's input.
fn touched_paths(input: &serde_json::Value) -> Vec<String> {
  let mut out = Vec::new();
  for key in ["file_path", "notebook_path", "path"] {
    if let Some(value) = input.get(key).and_then(serde_json::Value::as_str) {
      out.push(value.to_string());
    }
  }
  out
}

fn shell_writes_protected(command: &str) -> Option<&'static str> {
  if !shell_write_regex().is_match(command) {
    return None;
  }
  PROTECTED_FILES
    .iter()
    .find(|name| command.contains(&format!(".overseer/{name}")))
    .copied()
}

/// Decide one hook invocation. Pure apart from reading result files.
#[must_use]
pub fn evaluate(
  kind: HookKind,
  input: &HookInput,
  state: Option<&ProjectState>,
  ctx: &AppContext,
  agent: &AgentEnv,
) -> HookVerdict {
  match kind {
    HookKind::PreToolUse => pre_tool_use(input, state, ctx),
    HookKind::PostToolUse => post_tool_use(state, ctx),
    HookKind::Stop => stop(input, state, &ctx.paths, agent),
  }
}

fn pre_tool_use(input: &HookInput, state: Option<&ProjectState>, ctx: &AppContext) -> HookVerdict {
  let tool = input.tool_name.as_deref().unwrap_or_default();
  if !MUTATING_TOOLS.contains(&tool) {
    return HookVerdict::allow();
  }

  for path in touched_paths(&input.tool_input) {
    if is_protected_path(&ctx.paths, &path) {
      return HookVerdict {
        decision: Decision::block(format!(
          "{path} is owned by overseer; use the overseer commands instead of editing it"
        )),
        warnings: Vec::new(),
      };
    }
  }
  if tool == "Bash"
    && let Some(command) = input
      .tool_input
      .get("command")
      .and_then(serde_json::Value::as_str)
    && let Some(name) = shell_writes_protected(command)
  {
    return HookVerdict {
      decision: Decision::block(format!(
        ".overseer/{name} is owned by overseer; use the overseer commands instead of editing it"
      )),
      warnings: Vec::new(),
    };
  }

  let Some(state) = state else {
    return HookVerdict::allow();
  };
  if state.phase == Phase::Aborted {
    return HookVerdict {
      decision: Decision::block(format!(
        "project {} is aborted ({}); no further changes are allowed",
        state.project_id,
        state.abort_reason.as_deref().unwrap_or("no reason recorded")
      )),
      warnings: Vec::new(),
    };
  }
  let check = breaker::check(state, &ctx.config.limits);
  if check.hard {
    let reason = check
      .reason
      .map_or_else(|| "limit exceeded".to_string(), |r| r.to_string());
    return HookVerdict {
      decision: Decision::block(format!("circuit breaker tripped: {reason}")),
      warnings: Vec::new(),
    };
  }
  HookVerdict::allow()
}

fn post_tool_use(state: Option<&ProjectState>, ctx: &AppContext) -> HookVerdict {
  let mut verdict = HookVerdict::allow();
  let Some(state) = state else {
    return verdict;
  };
  let limits = &ctx.config.limits;
  let cb = &state.circuit_breakers;
  let (tokens, cost) = breaker::usage_ratios(cb, limits);
  if tokens >= USAGE_WARNING_RATIO {
    verdict.warnings.push(format!(
      "token usage at {:.0}% of the ceiling ({} of {})",
      tokens * 100.0,
      cb.tokens_used,
      limits.max_tokens
    ));
  }
  if cost >= USAGE_WARNING_RATIO {
    verdict.warnings.push(format!(
      "cost at {:.0}% of the ceiling (${:.2} of ${:.2})",
      cost * 100.0,
      cb.cost_usd,
      limits.max_cost_usd
    ));
  }
  verdict
}

/// Result file the stopping agent owes, if it can be determined.
fn expected_output(
  state: Option<&ProjectState>,
  paths: &OverseerPaths,
  agent: &AgentEnv,
) -> Option<PathBuf> {
  if let Some(output) = &agent.output {
    let path = PathBuf::from(output);
    return Some(if path.is_absolute() {
      path
    } else {
      paths.root().join(path)
    });
  }
  let role = agent.role.as_deref()?;
  let team = state?.active_team().filter(|t| t.is_active())?;
  team
    .roster
    .iter()
    .find(|a| a.role == role)
    .map(|a| paths.root().join(&a.output_path))
}

fn stop(
  input: &HookInput,
  state: Option<&ProjectState>,
  paths: &OverseerPaths,
  agent: &AgentEnv,
) -> HookVerdict {
  // A stop hook that already blocked once lets the agent go.
  if input.stop_hook_active {
    return HookVerdict::allow();
  }
  let Some(path) = expected_output(state, paths, agent) else {
    return HookVerdict::allow();
  };
  let reason = match read_result(&path) {
    Ok(JsonDoc::Valid(result)) if result.is_finished() => return HookVerdict::allow(),
    Ok(JsonDoc::Valid(_)) => format!(
      "{} still says in_progress; write the final status before stopping",
      path.display()
    ),
    Ok(JsonDoc::Absent) => format!(
      "write your result to {} before stopping",
      path.display()
    ),
    Ok(JsonDoc::Corrupt(err)) => format!(
      "{} is not a valid result document ({err}); fix it before stopping",
      path.display()
    ),
    Err(err) => format!("cannot read {}: {err:#}", path.display()),
  };
  HookVerdict {
    decision: Decision::block(reason),
    warnings: Vec::new(),
  }
}

/// Parse `raw`, load the state read-only and decide.
pub fn run_hook(ctx: &AppContext, kind: HookKind, raw: &str, agent: &AgentEnv) -> Result<HookVerdict> {
  let input: HookInput = if raw.trim().is_empty() {
    HookInput::default()
  } else {
    serde_json::from_str(raw).context("hook input is not valid JSON")?
  };
  let store = StateStore::new(
    ctx.paths.clone(),
    ctx.clock.clone(),
    ctx.config.state.backup_retention,
  );
  let state = store.load_or_recover()?;
  Ok(evaluate(kind, &input, state.as_ref(), ctx, agent))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::OverseerConfig;
  use crate::domain::{Mode, TripReason};
  use crate::utils::clock::system_clock;
  use chrono::Utc;
  use serde_json::json;

  fn ctx(root: &Path) -> AppContext {
    AppContext {
      paths: OverseerPaths::new(root),
      config: OverseerConfig::default(),
      clock: system_clock(),
    }
  }

  fn tool(name: &str, input: serde_json::Value) -> HookInput {
    HookInput {
      tool_name: Some(name.to_string()),
      tool_input: input,
      stop_hook_active: false,
    }
  }

  fn state() -> ProjectState {
    ProjectState::new("req", Mode::Coding, Utc::now())
  }

  #[test]
  fn edits_to_owned_files_are_blocked() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx(dir.path());
    let agent = AgentEnv::default();
    let abs = dir.path().join(".overseer/state.json");
    for input in [
      tool("Write", json!({"file_path": abs.display().to_string()})),
      tool("Edit", json!({"file_path": ".overseer/processes.json"})),
      tool("Bash", json!({"command": "echo '{}' > .overseer/state.json"})),
    ] {
      let verdict = evaluate(HookKind::PreToolUse, &input, None, &ctx, &agent);
      assert!(matches!(verdict.decision, Decision::Block { .. }), "{input:?}");
    }
    let read = tool("Bash", json!({"command": "cat .overseer/state.json"}));
    assert_eq!(
      evaluate(HookKind::PreToolUse, &read, None, &ctx, &agent).decision,
      Decision::Allow
    );
    let other = tool("Write", json!({"file_path": "src/main.rs"}));
    assert_eq!(
      evaluate(HookKind::PreToolUse, &other, Some(&state()), &ctx, &agent).decision,
      Decision::Allow
    );
  }

  #[test]
  fn aborted_or_tripped_projects_reject_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx(dir.path());
    let agent = AgentEnv::default();
    let write = tool("Write", json!({"file_path": "src/lib.rs"}));
    let read = tool("Read", json!({"file_path": "src/lib.rs"}));

    let mut aborted = state();
    aborted.phase = Phase::Aborted;
    aborted.abort_reason = Some("healing exhausted".into());
    let verdict = evaluate(HookKind::PreToolUse, &write, Some(&aborted), &ctx, &agent);
    assert!(matches!(verdict.decision, Decision::Block { ref reason } if reason.contains("healing exhausted")));
    assert_eq!(
      evaluate(HookKind::PreToolUse, &read, Some(&aborted), &ctx, &agent).decision,
      Decision::Allow
    );

    let mut tripped = state();
    tripped.circuit_breakers.tripped = Some(TripReason::CostCeiling {
      used: 51.0,
      limit: 50.0,
    });
    let verdict = evaluate(HookKind::PreToolUse, &write, Some(&tripped), &ctx, &agent);
    assert!(matches!(verdict.decision, Decision::Block { ref reason } if reason.contains("circuit breaker")));
  }

  #[test]
  fn post_tool_use_warns_near_the_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx(dir.path());
    let mut s = state();
    s.circuit_breakers.tokens_used = 1_700_000;
    let verdict = evaluate(
      HookKind::PostToolUse,
      &HookInput::default(),
      Some(&s),
      &ctx,
      &AgentEnv::default(),
    );
    assert_eq!(verdict.decision, Decision::Allow);
    assert_eq!(verdict.warnings.len(), 1);
    assert!(verdict.warnings[0].contains("85%"));
  }

  #[test]
  fn stop_waits_for_a_finished_result() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx(dir.path());
    let agent = AgentEnv {
      output: Some("out/planner.result.json".into()),
      role: None,
    };
    let input = HookInput::default();
    let verdict = evaluate(HookKind::Stop, &input, None, &ctx, &agent);
    assert!(matches!(verdict.decision, Decision::Block { ref reason } if reason.contains("write your result")));

    std::fs::create_dir_all(dir.path().join("out")).unwrap();
    let path = dir.path().join("out/planner.result.json");
    std::fs::write(&path, r#"{"status":"in_progress"}"#).unwrap();
    let verdict = evaluate(HookKind::Stop, &input, None, &ctx, &agent);
    assert!(matches!(verdict.decision, Decision::Block { .. }));

    let again = HookInput {
      stop_hook_active: true,
      ..HookInput::default()
    };
    assert_eq!(evaluate(HookKind::Stop, &again, None, &ctx, &agent).decision, Decision::Allow);

    std::fs::write(&path, r#"{"status":"success"}"#).unwrap();
    assert_eq!(evaluate(HookKind::Stop, &input, None, &ctx, &agent).decision, Decision::Allow);
    assert_eq!(
      evaluate(HookKind::Stop, &input, None, &ctx, &AgentEnv::default()).decision,
      Decision::Allow
    );
  }

  #[test]
  fn decisions_serialize_as_documents() {
    assert_eq!(serde_json::to_string(&Decision::Allow).unwrap(), r#"{"decision":"allow"}"#);
    assert_eq!(
      serde_json::to_string(&Decision::block("no")).unwrap(),
      r#"{"decision":"block","reason":"no"}"#
    );
  }
}
