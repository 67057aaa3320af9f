//! Groups of agents dispatched for one phase.
//!
//! Every agent gets a prompt file and is expected to write exactly one result
//! file next to it. Tracking is rebuilt from the [`SubTeam`] record and those
//! files on every call, so a team survives the orchestrator's own restarts.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::{OverseerPaths, QualityConfig, STATE_DIR_NAME, Timeouts};
use crate::domain::agent_result::read_result;
use crate::domain::state::slugify;
use crate::domain::{
  AgentAssignment, AgentResult, Phase, ProjectState, RecoveryMeta, SubTeam, TeamStatus,
};
use crate::monitor::{ProcessControl, ProcessKind, ProcessMonitor};
use crate::store::json::{JsonDoc, write_atomic};
use crate::utils::clock::SharedClock;
use crate::utils::command::{Command, expand_vars_in_argv};
use crate::watchdog::{Watchdog, WatchdogFinding};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamProgress {
  pub reported: Vec<String>,
  pub pending: Vec<String>,
  /// Unhealthy pending agents.
  pub health: Vec<WatchdogFinding>,
}

impl TeamProgress {
  #[must_use]
  pub fn is_complete(&self) -> bool {
    self.pending.is_empty()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Collected {
  pub role: String,
  pub result: AgentResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityGate {
  Passed,
  RerunRequested,
  AcceptedDegraded,
}

pub struct SubTeamManager<C: ProcessControl> {
  paths: OverseerPaths,
  clock: SharedClock,
  quality: QualityConfig,
  launcher: Option<Vec<String>>,
  watchdog: Watchdog,
  monitor: ProcessMonitor<C>,
}

impl<C: ProcessControl> SubTeamManager<C> {
  pub fn new(
    paths: OverseerPaths,
    clock: SharedClock,
    timeouts: Timeouts,
    quality: QualityConfig,
    launcher: Option<Vec<String>>,
    control: C,
  ) -> Self {
    Self {
      watchdog: Watchdog::new(paths.clone(), clock.clone(), timeouts.clone()),
      monitor: ProcessMonitor::new(paths.clone(), clock.clone(), timeouts, control),
      paths,
      clock,
      quality,
      launcher,
    }
  }

  fn team_dir(phase: Phase, id: &str) -> PathBuf {
    PathBuf::from(STATE_DIR_NAME)
      .join("phases")
      .join(phase.as_str())
      .join(id)
  }

  /// New team for `phase` with one prompt file per role.
  pub fn create(
    &self,
    state: &ProjectState,
    phase: Phase,
    roles: &[String],
    tier: &str,
    instruction: Option<&str>,
  ) -> Result<SubTeam> {
    if roles.is_empty() {
      bail!("no roles configured for {phase}");
    }
    let id = format!("{phase}-{}", next_team_seq(state, phase));
    let dir = Self::team_dir(phase, &id);
    let now = self.clock.now();

    let mut recovery = RecoveryMeta::default();
    if let Some(text) = instruction {
      let rel = dir.join("instruction.md");
      write_atomic(&self.paths.root().join(&rel), text.as_bytes())?;
      recovery.instruction_path = Some(rel.display().to_string());
    }

    let inputs = input_files(state, phase);
    let mut roster = Vec::with_capacity(roles.len());
    for role in roles {
      let file = slugify(role);
      let prompt_rel = dir.join(format!("{file}.prompt.md"));
      let output_rel = dir.join(format!("{file}.result.json"));
      let prompt = render_prompt(state, phase, role, tier, &output_rel, &inputs, instruction);
      write_atomic(&self.paths.root().join(&prompt_rel), prompt.as_bytes())?;
      roster.push(AgentAssignment {
        role: role.clone(),
        prompt_path: prompt_rel.display().to_string(),
        output_path: output_rel.display().to_string(),
        tier: tier.to_string(),
        started_at: now,
        pid: None,
      });
    }
    log::debug!("created team {id} with {} agents", roster.len());

    Ok(SubTeam {
      id,
      phase,
      roster,
      status: TeamStatus::Created,
      created_at: now,
      reruns: 0,
      confidence: None,
      degraded: false,
      recovery,
    })
  }

  /// Start the team's agents with the configured launcher and register their
  /// PIDs. Without a launcher only the start time is recorded. Returns the
  /// number of processes started.
  pub fn dispatch(&self, state: &ProjectState, team: &mut SubTeam) -> Result<usize> {
    let now = self.clock.now();
    team.status = TeamStatus::Running;
    let Some(launcher) = &self.launcher else {
      for agent in &mut team.roster {
        agent.started_at = now;
        agent.pid = None;
      }
      return Ok(0);
    };

    let mut launched = 0;
    for agent in &mut team.roster {
      let vars = HashMap::from([
        (
          "OVERSEER_PROMPT".to_string(),
          self.paths.root().join(&agent.prompt_path).display().to_string(),
        ),
        (
          "OVERSEER_OUTPUT".to_string(),
          self.paths.root().join(&agent.output_path).display().to_string(),
        ),
        ("OVERSEER_MODEL".to_string(), agent.tier.clone()),
        ("OVERSEER_ROLE".to_string(), agent.role.clone()),
        ("OVERSEER_PROJECT".to_string(), state.project_id.clone()),
      ]);
      let argv = expand_vars_in_argv(launcher, &vars);
      let mut cmd = Command::new(&argv)?.in_dir(self.paths.root());
      for (key, value) in &vars {
        cmd = cmd.with_env(key, value.clone());
      }
      let child = cmd
        .spawn_detached()
        .with_context(|| format!("failed to launch agent {}", agent.role))?;
      let pid = child.id();
      self.monitor.register(
        pid,
        &state.project_id,
        ProcessKind::AgentWorker,
        team.phase,
        Some(agent.role.clone()),
      )?;
      agent.pid = Some(pid);
      agent.started_at = now;
      launched += 1;
    }
    Ok(launched)
  }

  /// Which agents reported and how the others are doing. Read-only.
  #[must_use]
  pub fn check(&self, team: &SubTeam) -> TeamProgress {
    let mut reported = Vec::new();
    let mut pending = Vec::new();
    for agent in &team.roster {
      match read_result(&self.paths.root().join(&agent.output_path)) {
        Ok(JsonDoc::Valid(result)) if result.is_finished() => reported.push(agent.role.clone()),
        _ => pending.push(agent.role.clone()),
      }
    }
    let health = self
      .watchdog
      .check_team(team)
      .into_iter()
      .filter(|f| pending.contains(&f.subject))
      .collect();
    TeamProgress {
      reported,
      pending,
      health,
    }
  }

  /// [`Self::check`] for a new session picking the team up again.
  pub fn resume(&self, team: &mut SubTeam) -> TeamProgress {
    let progress = self.check(team);
    team.recovery.resumed_count = team.recovery.resumed_count.saturating_add(1);
    team.recovery.last_checked_at = Some(self.clock.now());
    team.recovery.reported.clone_from(&progress.reported);
    progress
  }

  /// Read every agent's finished result.
  ///
  /// # Errors
  /// Fails when any result is missing, unparsable or still in progress.
  pub fn collect(&self, team: &mut SubTeam) -> Result<Vec<Collected>> {
    team.status = TeamStatus::Collecting;
    let mut out = Vec::with_capacity(team.roster.len());
    for agent in &team.roster {
      let path = self.paths.root().join(&agent.output_path);
      match read_result(&path)? {
        JsonDoc::Valid(result) if result.is_finished() => out.push(Collected {
          role: agent.role.clone(),
          result,
        }),
        JsonDoc::Valid(_) => bail!("{} is still in progress", agent.role),
        JsonDoc::Absent => bail!("{} has not written {}", agent.role, path.display()),
        JsonDoc::Corrupt(err) => bail!("invalid result from {}: {err}", agent.role),
      }
    }
    Ok(out)
  }

  /// Score collected results against the quality threshold.
  ///
  /// Passing or degraded-accepted teams are marked complete with their
  /// confidence; a rerun leaves the team for [`Self::rerun`].
  pub fn quality_gate(&self, team: &mut SubTeam, results: &[Collected]) -> QualityGate {
    let confidence = aggregate_confidence(results);
    if confidence >= self.quality.threshold {
      team.status = TeamStatus::Complete;
      team.confidence = Some(confidence);
      return QualityGate::Passed;
    }
    if team.reruns < self.quality.max_reruns {
      return QualityGate::RerunRequested;
    }
    team.status = TeamStatus::Complete;
    team.confidence = Some(confidence);
    team.degraded = true;
    QualityGate::AcceptedDegraded
  }

  /// Archive the current results under `rerun-<n>/` and dispatch again.
  pub fn rerun(&self, state: &ProjectState, team: &mut SubTeam) -> Result<usize> {
    team.reruns = team.reruns.saturating_add(1);
    let archive = Self::team_dir(team.phase, &team.id).join(format!("rerun-{}", team.reruns));
    for agent in &team.roster {
      let src = self.paths.root().join(&agent.output_path);
      if !src.exists() {
        continue;
      }
      let name = Path::new(&agent.output_path)
        .file_name()
        .map_or_else(|| PathBuf::from("result.json"), PathBuf::from);
      crate::healing::move_path(&src, &self.paths.root().join(&archive).join(name))?;
    }
    let pids: Vec<u32> = team.roster.iter().filter_map(|a| a.pid).collect();
    self.monitor.unregister_exited(&pids)?;
    team.confidence = None;
    team.recovery.usage_recorded = false;
    self.dispatch(state, team)
  }

  /// Forget the team's exited processes; live ones are left to the orphan
  /// sweep.
  pub fn teardown(&self, team: &mut SubTeam) -> Result<()> {
    let pids: Vec<u32> = team.roster.iter().filter_map(|a| a.pid).collect();
    let removed = self.monitor.unregister_exited(&pids)?;
    if removed > 0 {
      log::debug!("team {}: unregistered {removed} processes", team.id);
    }
    team.status = TeamStatus::TornDown;
    Ok(())
  }
}

/// One past the highest sequence number used by `phase`'s teams so far.
fn next_team_seq(state: &ProjectState, phase: Phase) -> u32 {
  let prefix = format!("{phase}-");
  state
    .sub_teams
    .keys()
    .filter_map(|id| id.strip_prefix(&prefix)?.parse::<u32>().ok())
    .max()
    .unwrap_or(0)
    + 1
}

/// Mean per-agent confidence. No results count as fully confident.
#[must_use]
pub fn aggregate_confidence(results: &[Collected]) -> f64 {
  if results.is_empty() {
    return 1.0;
  }
  #[allow(clippy::cast_precision_loss)]
  let n = results.len() as f64;
  results
    .iter()
    .map(|c| c.result.effective_confidence())
    .sum::<f64>()
    / n
}

/// Result files of the phase that feeds `phase`.
fn input_files(state: &ProjectState, phase: Phase) -> Vec<String> {
  let source = match phase {
    Phase::Executing => Some(Phase::Planning),
    Phase::Verifying => Some(Phase::Executing),
    Phase::Healing => Some(state.working_phase()),
    _ => None,
  };
  let Some(source) = source else {
    return Vec::new();
  };
  if phase == Phase::Healing {
    // The failing team is still active while its healers are created.
    return state
      .active_team()
      .filter(|t| t.phase == source)
      .map(|t| t.roster.iter().map(|a| a.output_path.clone()).collect())
      .unwrap_or_default();
  }
  state
    .completed_team_for(source)
    .map(|t| t.roster.iter().map(|a| a.output_path.clone()).collect())
    .unwrap_or_default()
}

fn render_prompt(
  state: &ProjectState,
  phase: Phase,
  role: &str,
  tier: &str,
  output: &Path,
  inputs: &[String],
  instruction: Option<&str>,
) -> String {
  let mut out = String::new();
  let _ = writeln!(out, "# {phase}: {role}\n");
  let _ = writeln!(
    out,
    "Project `{}` ({} mode), model tier `{tier}`.\n",
    state.project_id, state.mode
  );
  let _ = writeln!(out, "## Request\n\n{}\n", state.request);
  if !inputs.is_empty() {
    let _ = writeln!(out, "## Inputs\n");
    for input in inputs {
      let _ = writeln!(out, "- `{input}`");
    }
    out.push('\n');
  }
  if let Some(text) = instruction {
    let _ = writeln!(out, "## Healing instruction\n\n{}\n", text.trim());
  }
  let _ = writeln!(out, "## Result\n");
  let _ = writeln!(
    out,
    "Write exactly one JSON document to `{}`. Write it early with \
     `\"status\": \"in_progress\"` and update it as you go; finish with \
     `success`, `partial` or `failed`.\n",
    output.display()
  );
  out.push_str(
    "```json\n{\n  \"status\": \"success\",\n  \"completed\": [],\n  \"failed\": [],\n  \
     \"outputs\": [\"relative/path\"],\n  \"summary\": \"\",\n  \"errors\": [],\n  \
     \"confidence\": 1.0,\n  \"findings\": [{\"priority\": \"p2\", \"message\": \"\"}],\n  \
     \"usage\": {\"tokens\": 0, \"cost_usd\": 0.0}\n}\n```\n\n",
  );
  out.push_str("Do not modify anything else under `.overseer/`.\n");
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::Mode;
  use crate::monitor::NixProcessControl;
  use crate::utils::clock::system_clock;
  use std::time::{Duration, Instant};

  fn manager(root: &Path, launcher: Option<Vec<String>>) -> SubTeamManager<NixProcessControl> {
    SubTeamManager::new(
      OverseerPaths::new(root),
      system_clock(),
      Timeouts::default(),
      QualityConfig::default(),
      launcher,
      NixProcessControl,
    )
  }

  fn write_result(root: &Path, team: &SubTeam, idx: usize, body: &str) {
    let path = root.join(&team.roster[idx].output_path);
    std::fs::write(path, body).unwrap();
  }

  #[test]
  fn create_writes_one_prompt_per_role() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), None);
    let state = ProjectState::new("Build the thing", Mode::Coding, chrono::Utc::now());
    let roles = vec!["backend".to_string(), "Front End".to_string()];
    let team = mgr.create(&state, Phase::Executing, &roles, "small", None).unwrap();

    assert_eq!(team.id, "executing-1");
    assert_eq!(team.status, TeamStatus::Created);
    assert_eq!(
      team.roster[1].output_path,
      ".overseer/phases/executing/executing-1/front-end.result.json"
    );
    let prompt = std::fs::read_to_string(dir.path().join(&team.roster[0].prompt_path)).unwrap();
    assert!(prompt.contains("Build the thing"));
    assert!(prompt.contains("backend.result.json"));
  }

  #[test]
  fn team_ids_continue_after_the_highest_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), None);
    let mut state = ProjectState::new("x", Mode::Coding, chrono::Utc::now());
    let roles = vec!["healer".to_string()];
    let first = mgr.create(&state, Phase::Healing, &roles, "medium", None).unwrap();
    let mut second = mgr.create(&state, Phase::Healing, &roles, "large", None).unwrap();
    second.id = "healing-2".to_string();
    assert_eq!(first.id, "healing-1");
    // Only the later team is on record, as after a rollback.
    state.sub_teams.insert(second.id.clone(), second);
    let next = mgr.create(&state, Phase::Healing, &roles, "large", None).unwrap();
    assert_eq!(next.id, "healing-3");
  }

  #[test]
  fn check_and_collect_follow_result_files() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), None);
    let state = ProjectState::new("x", Mode::Coding, chrono::Utc::now());
    let roles = vec!["a".to_string(), "b".to_string()];
    let mut team = mgr.create(&state, Phase::Executing, &roles, "small", None).unwrap();
    assert_eq!(mgr.dispatch(&state, &mut team).unwrap(), 0);
    assert_eq!(team.status, TeamStatus::Running);

    write_result(dir.path(), &team, 0, r#"{"status":"success"}"#);
    write_result(dir.path(), &team, 1, r#"{"status":"in_progress"}"#);
    let progress = mgr.resume(&mut team);
    assert_eq!(progress.reported, vec!["a"]);
    assert_eq!(progress.pending, vec!["b"]);
    assert!(progress.health.is_empty());
    assert_eq!(team.recovery.resumed_count, 1);
    assert!(mgr.collect(&mut team).is_err());

    write_result(dir.path(), &team, 1, r#"{"status":"partial","completed":["x"]}"#);
    assert!(mgr.check(&team).is_complete());
    let results = mgr.collect(&mut team).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(team.status, TeamStatus::Collecting);
  }

  #[test]
  fn low_confidence_reruns_once_then_degrades() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), None);
    let state = ProjectState::new("x", Mode::Coding, chrono::Utc::now());
    let mut team = mgr
      .create(&state, Phase::Verifying, &["verifier".to_string()], "small", None)
      .unwrap();
    mgr.dispatch(&state, &mut team).unwrap();

    write_result(dir.path(), &team, 0, r#"{"status":"success","confidence":0.8}"#);
    let results = mgr.collect(&mut team).unwrap();
    assert_eq!(mgr.quality_gate(&mut team, &results), QualityGate::RerunRequested);
    mgr.rerun(&state, &mut team).unwrap();
    assert_eq!(team.reruns, 1);
    assert!(
      dir
        .path()
        .join(".overseer/phases/verifying/verifying-1/rerun-1/verifier.result.json")
        .is_file()
    );
    assert!(!mgr.check(&team).is_complete());

    write_result(dir.path(), &team, 0, r#"{"status":"success","confidence":0.8}"#);
    let results = mgr.collect(&mut team).unwrap();
    assert_eq!(mgr.quality_gate(&mut team, &results), QualityGate::AcceptedDegraded);
    assert!(team.degraded);
    assert_eq!(team.status, TeamStatus::Complete);
    assert_eq!(team.confidence, Some(0.8));
  }

  #[test]
  fn aggregate_confidence_is_the_mean() {
    let c = |raw: &str| Collected {
      role: "r".into(),
      result: serde_json::from_str(raw).unwrap(),
    };
    let results = vec![
      c(r#"{"status":"success","confidence":1.0}"#),
      c(r#"{"status":"partial","completed":["a"],"failed":["b"]}"#),
    ];
    assert!((aggregate_confidence(&results) - 0.75).abs() < 1e-9);
    assert!((aggregate_confidence(&[]) - 1.0).abs() < f64::EPSILON);
  }

  #[test]
  fn dispatch_launches_and_registers_agents() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = vec![
      "/bin/sh".to_string(),
      "-c".to_string(),
      "printf '{\"status\":\"success\"}' > \"$OVERSEER_OUTPUT\"".to_string(),
    ];
    let mgr = manager(dir.path(), Some(launcher));
    let state = ProjectState::new("x", Mode::Coding, chrono::Utc::now());
    let mut team = mgr
      .create(&state, Phase::Planning, &["planner".to_string()], "small", None)
      .unwrap();
    assert_eq!(mgr.dispatch(&state, &mut team).unwrap(), 1);
    let pid = team.roster[0].pid.unwrap();

    let registry = ProcessMonitor::new(
      OverseerPaths::new(dir.path()),
      system_clock(),
      Timeouts::default(),
      NixProcessControl,
    )
    .load()
    .unwrap();
    assert_eq!(registry[&pid].role.as_deref(), Some("planner"));

    let deadline = Instant::now() + Duration::from_secs(10);
    while !mgr.check(&team).is_complete() && Instant::now() < deadline {
      std::thread::sleep(Duration::from_millis(50));
    }
    assert!(mgr.check(&team).is_complete());
    // Reap the finished child so it no longer counts as running.
    let _ = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(pid as i32), None);

    mgr.teardown(&mut team).unwrap();
    assert_eq!(team.status, TeamStatus::TornDown);
    let registry = mgr.monitor.load().unwrap();
    assert!(!registry.contains_key(&pid));
  }
}
