//! Bounded retry-with-escalation after agent failures.
//!
//! Every heal escalates one model tier: the failing run used tier 0, the first
//! heal runs at tier 1 and so on, clamped to the strongest tier. A signature
//! that was already attempted skips the identical retry and escalates. The
//! attempt log (`healing.jsonl`) is append-only and shared by every project
//! the directory has seen; each record names its project.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::breaker;
use crate::classifier::{self, Action, Category, Severity};
use crate::config::{Limits, ModelsConfig, OverseerPaths};
use crate::domain::{AgentResult, Phase, ProjectState, ResultStatus};
use crate::store::json::{self, append_jsonl, read_jsonl, write_json};
use crate::utils::clock::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
  Pending,
  Resolved,
  Failed,
  Skipped,
  RolledBack,
}

/// One line of the healing log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealingAttempt {
  #[serde(default)]
  pub project_id: String,
  pub signature: String,
  pub category: Category,
  /// 1-based per signature.
  pub attempt: u32,
  pub tier: String,
  pub outcome: AttemptOutcome,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealAction {
  Retry,
  Escalate,
  Abort,
  RollBack,
}

#[derive(Debug, Clone)]
pub struct HealOutcome {
  pub action: HealAction,
  /// State with updated counters. Unchanged apart from a latched trip on abort.
  pub state: ProjectState,
  /// Record to append to the healing log.
  pub attempt: Option<HealingAttempt>,
  pub category: Category,
  pub severity: Severity,
  pub signature: String,
  /// Instruction for the healing agent; absent when aborting.
  pub instruction: Option<String>,
  /// Why healing stopped, when it did.
  pub reason: Option<String>,
}

/// How a finished healing run compares to the failure it was fixing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunVerdict {
  Resolved,
  Failed,
  /// More errors than the original failure.
  Worse,
}

pub struct HealingEngine {
  paths: OverseerPaths,
  clock: SharedClock,
  limits: Limits,
  models: ModelsConfig,
}

impl HealingEngine {
  #[must_use]
  pub fn new(
    paths: OverseerPaths,
    clock: SharedClock,
    limits: Limits,
    models: ModelsConfig,
  ) -> Self {
    Self {
      paths,
      clock,
      limits,
      models,
    }
  }

  /// Attempts recorded for `project_id`, oldest first.
  pub fn history(&self, project_id: &str) -> Result<Vec<HealingAttempt>> {
    let all: Vec<HealingAttempt> = read_jsonl(&self.paths.healing_log())?;
    Ok(all.into_iter().filter(|a| a.project_id == project_id).collect())
  }

  pub fn record(&self, attempt: &HealingAttempt) -> Result<()> {
    append_jsonl(&self.paths.healing_log(), attempt)
  }

  /// Decide what to do about `raw_error`. Pure apart from reading the clock;
  /// the caller persists the returned state and appends the attempt.
  #[must_use]
  pub fn heal(&self, state: &ProjectState, raw_error: &str, history: &[HealingAttempt]) -> HealOutcome {
    let category = classifier::classify(raw_error);
    let severity = classifier::severity(category);
    let signature = breaker::normalize_signature(raw_error);
    let prior = classifier::count_similar(history, &signature);
    let attempt_no = u32::try_from(prior + 1).unwrap_or(u32::MAX);

    let mut next = state.clone();
    next.healing_attempts = next.healing_attempts.saturating_add(1);
    next.circuit_breakers = breaker::update(&next.circuit_breakers, 0, 0.0, Some(&signature));

    let abort = |reason: String, latch: Option<crate::domain::TripReason>| {
      let mut kept = state.clone();
      if let Some(trip) = latch {
        kept.circuit_breakers.tripped = Some(trip);
      }
      HealOutcome {
        action: HealAction::Abort,
        state: kept,
        attempt: Some(HealingAttempt {
          project_id: state.project_id.clone(),
          signature: signature.clone(),
          category,
          attempt: attempt_no,
          tier: self.models.tier(prior),
          outcome: AttemptOutcome::Failed,
          timestamp: self.clock.now(),
        }),
        category,
        severity,
        signature: signature.clone(),
        instruction: None,
        reason: Some(reason),
      }
    };

    let check = breaker::check(&next, &self.limits);
    if check.hard {
      let trip = check.reason;
      let reason = trip
        .as_ref()
        .map_or_else(|| "circuit breaker tripped".to_string(), ToString::to_string);
      return abort(format!("circuit breaker: {reason}"), trip);
    }
    if prior >= self.limits.max_heal_attempts as usize {
      return abort(
        format!(
          "healing exhausted: {prior} attempts for this error (limit {})",
          self.limits.max_heal_attempts
        ),
        None,
      );
    }
    if classifier::action_for_severity(severity) == Action::Abort {
      return abort(
        format!("{category} errors are {severity} severity and need a human"),
        None,
      );
    }

    let soft_trip = breaker::repeated(&next.circuit_breakers, &self.limits, &signature).is_some();
    let (action, outcome) = if prior > 0 || soft_trip {
      (HealAction::Escalate, AttemptOutcome::Skipped)
    } else {
      (HealAction::Retry, AttemptOutcome::Pending)
    };
    let tier = self.models.tier(prior + 1);
    let instruction = build_instruction(
      raw_error,
      category,
      severity,
      &tier,
      history
        .iter()
        .filter(|a| a.signature == signature)
        .collect::<Vec<_>>()
        .as_slice(),
    );

    HealOutcome {
      action,
      state: next,
      attempt: Some(HealingAttempt {
        project_id: state.project_id.clone(),
        signature: signature.clone(),
        category,
        attempt: attempt_no,
        tier,
        outcome,
        timestamp: self.clock.now(),
      }),
      category,
      severity,
      signature,
      instruction: Some(instruction),
      reason: None,
    }
  }

  /// Compare a finished healing run against the failure it was fixing.
  #[must_use]
  pub fn judge_run(baseline_errors: usize, results: &[AgentResult]) -> RunVerdict {
    let errors: usize = results.iter().map(|r| r.errors.len()).sum();
    let failed = results
      .iter()
      .any(|r| matches!(r.status, ResultStatus::Failed | ResultStatus::Partial));
    if errors > baseline_errors {
      RunVerdict::Worse
    } else if failed || errors > 0 {
      RunVerdict::Failed
    } else {
      RunVerdict::Resolved
    }
  }

  /// Save the state and the origin phase's outputs before a healing run.
  ///
  /// Layout: `checkpoints/<id>/state.json`, `checkpoints/<id>/phase/...` (a
  /// copy of `.overseer/phases/<origin>`) and `checkpoints/<id>/files/...`
  /// (copies of project files listed in `outputs`, by relative path).
  pub fn checkpoint(
    &self,
    state: &ProjectState,
    origin: Phase,
    outputs: &[String],
  ) -> Result<String> {
    let id = format!(
      "{}-{}",
      self.clock.now().format("%Y%m%dT%H%M%S%.3fZ"),
      origin
    );
    let dir = self.paths.checkpoints_dir().join(&id);
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    write_json(&dir.join("state.json"), state)?;

    let phase_dir = self.paths.phases_dir().join(origin.as_str());
    if phase_dir.is_dir() {
      copy_tree(&phase_dir, &dir.join("phase"))?;
    }
    for rel in outputs {
      let Some(rel_path) = project_relative(self.paths.root(), rel) else {
        log::warn!("not checkpointing {rel}: outside the project");
        continue;
      };
      let src = self.paths.root().join(&rel_path);
      if src.is_file() {
        let dst = dir.join("files").join(&rel_path);
        copy_file(&src, &dst)?;
      }
    }
    log::debug!("checkpoint {id} written to {}", dir.display());
    Ok(id)
  }

  /// Undo a healing run that made things worse.
  ///
  /// The run's outputs move to `discarded/<ts>/`, the checkpointed phase
  /// outputs and files are copied back, and the checkpointed state is returned
  /// with the current counters carried over so they never decrease.
  pub fn rollback(
    &self,
    checkpoint_id: &str,
    current: &ProjectState,
    healing_outputs: &[String],
  ) -> Result<ProjectState> {
    let dir = self.paths.checkpoints_dir().join(checkpoint_id);
    let mut restored: ProjectState = json::read_json(&dir.join("state.json"))?
      .with_context(|| format!("checkpoint {checkpoint_id} has no state"))?;

    let discard_dir = self
      .paths
      .discarded_dir()
      .join(self.clock.now().format("%Y%m%dT%H%M%S%.3fZ").to_string());
    for rel in healing_outputs {
      let Some(rel_path) = project_relative(self.paths.root(), rel) else {
        continue;
      };
      let src = self.paths.root().join(&rel_path);
      if src.exists() {
        let dst = discard_dir.join(&rel_path);
        move_path(&src, &dst)?;
      }
    }
    let healing_dir = self.paths.phases_dir().join(Phase::Healing.as_str());
    if healing_dir.is_dir() {
      move_path(&healing_dir, &discard_dir.join("phases").join("healing"))?;
    }

    let saved_phase = dir.join("phase");
    if saved_phase.is_dir() {
      let origin = restored.working_phase();
      copy_tree(&saved_phase, &self.paths.phases_dir().join(origin.as_str()))?;
    }
    let saved_files = dir.join("files");
    if saved_files.is_dir() {
      copy_tree(&saved_files, self.paths.root())?;
    }

    restored.circuit_breakers = current.circuit_breakers.clone();
    restored.healing_attempts = current.healing_attempts;
    restored.revision = current.revision;
    restored.findings = current.findings.clone();
    // Teams started after the checkpoint stay on record so their ids are
    // never handed out again.
    for (id, team) in &current.sub_teams {
      restored
        .sub_teams
        .entry(id.clone())
        .or_insert_with(|| team.clone());
    }
    Ok(restored)
  }
}

fn build_instruction(
  raw_error: &str,
  category: Category,
  severity: Severity,
  tier: &str,
  prior: &[&HealingAttempt],
) -> String {
  let mut out = String::new();
  out.push_str("# Healing task\n\n");
  out.push_str("A previous agent run failed with this error:\n\n```\n");
  out.push_str(raw_error.trim());
  out.push_str("\n```\n\n");
  out.push_str(&format!(
    "Category: {category} (severity {severity}). Model tier: {tier}.\n\n"
  ));
  out.push_str("Suggested fix: ");
  out.push_str(classifier::suggested_fix(category));
  out.push_str("\n\n");
  if prior.is_empty() {
    out.push_str("This is the first attempt at this error.\n");
  } else {
    out.push_str("Earlier attempts at this same error did not resolve it:\n");
    for attempt in prior {
      out.push_str(&format!(
        "- attempt {} at tier {} ({:?})\n",
        attempt.attempt, attempt.tier, attempt.outcome
      ));
    }
    out.push_str("Do not repeat those approaches; try a different fix.\n");
  }
  out
}

/// Relative form of `path` inside `root`, rejecting anything that escapes it.
fn project_relative(root: &Path, path: &str) -> Option<PathBuf> {
  let candidate = Path::new(path);
  let rel = if candidate.is_absolute() {
    candidate.strip_prefix(root).ok()?.to_path_buf()
  } else {
    candidate.to_path_buf()
  };
  let escapes = rel.components().any(|c| {
    matches!(
      c,
      std::path::Component::ParentDir | std::path::Component::RootDir | std::path::Component::Prefix(_)
    )
  });
  (!escapes && !rel.as_os_str().is_empty()).then_some(rel)
}

fn copy_file(src: &Path, dst: &Path) -> Result<()> {
  if let Some(parent) = dst.parent() {
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
  }
  fs::copy(src, dst)
    .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
  Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
  fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
  for entry in fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
    let entry = entry?;
    let target = dst.join(entry.file_name());
    if entry.file_type()?.is_dir() {
      copy_tree(&entry.path(), &target)?;
    } else {
      copy_file(&entry.path(), &target)?;
    }
  }
  Ok(())
}

pub(crate) fn move_path(src: &Path, dst: &Path) -> Result<()> {
  if let Some(parent) = dst.parent() {
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
  }
  if fs::rename(src, dst).is_ok() {
    return Ok(());
  }
  // Cross-device: copy then remove.
  if src.is_dir() {
    copy_tree(src, dst)?;
    fs::remove_dir_all(src).with_context(|| format!("failed to remove {}", src.display()))?;
  } else {
    copy_file(src, dst)?;
    fs::remove_file(src).with_context(|| format!("failed to remove {}", src.display()))?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::Mode;
  use crate::utils::clock::FixedClock;
  use chrono::TimeZone;
  use std::sync::Arc;

  const MISSING_DEP: &str = "Error: Cannot find module 'left-pad' from /work/src/app.js:3:1";

  fn engine(root: &Path) -> HealingEngine {
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
    HealingEngine::new(
      OverseerPaths::new(root),
      Arc::new(clock),
      Limits::default(),
      ModelsConfig::default(),
    )
  }

  fn executing_state() -> ProjectState {
    let mut s = ProjectState::new("x", Mode::Coding, Utc::now());
    s.phase = Phase::Executing;
    s
  }

  #[test]
  fn identical_failures_escalate_instead_of_retrying() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let state = executing_state();

    let first = engine.heal(&state, MISSING_DEP, &[]);
    assert_eq!(first.action, HealAction::Retry);
    let a1 = first.attempt.clone().unwrap();
    assert_eq!(a1.tier, "medium");
    assert_eq!(a1.outcome, AttemptOutcome::Pending);
    assert_eq!(first.state.healing_attempts, 1);

    let second = engine.heal(
      &first.state,
      "Error: Cannot find module 'left-pad' from /tmp/other/app.js:9:9",
      &[a1.clone()],
    );
    assert_eq!(second.action, HealAction::Escalate);
    let a2 = second.attempt.unwrap();
    assert_eq!(a2.outcome, AttemptOutcome::Skipped);
    assert_eq!(a2.attempt, 2);
    assert_eq!(a2.tier, "large");
    assert_eq!(second.state.healing_attempts, 2);
    assert!(second.instruction.unwrap().contains("Do not repeat"));
  }

  #[test]
  fn repeated_heals_never_retry_and_end_in_abort() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let mut state = executing_state();
    let mut history = Vec::new();
    let mut actions = Vec::new();
    for _ in 0..6 {
      let out = engine.heal(&state, "assertion failed: left == right", &history);
      actions.push(out.action);
      if let Some(a) = out.attempt {
        history.push(a);
      }
      state = out.state;
    }
    assert_eq!(actions[0], HealAction::Retry);
    assert!(actions[1..].iter().all(|a| *a != HealAction::Retry));
    assert_eq!(actions[3], HealAction::Abort);
    assert_eq!(state.healing_attempts, 3);
  }

  #[test]
  fn hard_trip_aborts_and_latches() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let mut state = executing_state();
    state.circuit_breakers.tokens_used = Limits::default().max_tokens + 1;
    let out = engine.heal(&state, MISSING_DEP, &[]);
    assert_eq!(out.action, HealAction::Abort);
    assert!(out.state.circuit_breakers.tripped.is_some());
    assert_eq!(out.state.healing_attempts, 0);
    assert_eq!(out.attempt.unwrap().outcome, AttemptOutcome::Failed);
  }

  #[test]
  fn critical_severity_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let out = engine(dir.path()).heal(&executing_state(), "EACCES: permission denied", &[]);
    assert_eq!(out.action, HealAction::Abort);
    assert!(out.reason.unwrap().contains("permission"));
  }

  #[test]
  fn judge_run_detects_worse_runs() {
    let ok: AgentResult = serde_json::from_str(r#"{"status":"success"}"#).unwrap();
    let bad: AgentResult =
      serde_json::from_str(r#"{"status":"failed","errors":["a","b","c"]}"#).unwrap();
    assert_eq!(HealingEngine::judge_run(1, &[ok.clone()]), RunVerdict::Resolved);
    assert_eq!(HealingEngine::judge_run(3, &[bad.clone()]), RunVerdict::Failed);
    assert_eq!(HealingEngine::judge_run(1, &[ok, bad]), RunVerdict::Worse);
  }

  #[test]
  fn rollback_restores_checkpoint_and_keeps_counters() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let engine = engine(root);
    let paths = OverseerPaths::new(root);

    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("src/app.js"), "original").unwrap();
    let exec_dir = paths.phases_dir().join("executing").join("t1");
    fs::create_dir_all(&exec_dir).unwrap();
    fs::write(exec_dir.join("implementer.result.json"), "{}").unwrap();

    let mut state = executing_state();
    state.healing_attempts = 1;
    let id = engine
      .checkpoint(&state, Phase::Executing, &["src/app.js".to_string()])
      .unwrap();

    // The healing run damages things.
    fs::write(root.join("src/app.js"), "broken").unwrap();
    fs::write(root.join("src/extra.js"), "junk").unwrap();
    fs::remove_file(exec_dir.join("implementer.result.json")).unwrap();
    let mut current = state.clone();
    current.phase = Phase::Healing;
    current.healing_from = Some(Phase::Executing);
    current.healing_attempts = 2;
    current.circuit_breakers.tokens_used = 500;

    let restored = engine
      .rollback(&id, &current, &["src/extra.js".to_string(), "../escape".to_string()])
      .unwrap();
    assert_eq!(restored.phase, Phase::Executing);
    assert_eq!(restored.healing_attempts, 2);
    assert_eq!(restored.circuit_breakers.tokens_used, 500);
    assert_eq!(fs::read_to_string(root.join("src/app.js")).unwrap(), "original");
    assert!(!root.join("src/extra.js").exists());
    assert!(exec_dir.join("implementer.result.json").exists());
    let discarded: Vec<_> = fs::read_dir(paths.discarded_dir()).unwrap().flatten().collect();
    assert_eq!(discarded.len(), 1);
    assert!(discarded[0].path().join("src/extra.js").exists());
  }

  #[test]
  fn history_round_trips_through_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let state = executing_state();
    let out = engine.heal(&state, MISSING_DEP, &[]);
    engine.record(&out.attempt.unwrap()).unwrap();
    let history = engine.history(&state.project_id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].category, Category::MissingDependency);
    assert_eq!(history[0].project_id, state.project_id);
  }

  #[test]
  fn history_is_scoped_to_the_project() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let mut old = executing_state();
    old.project_id = "old-project".to_string();
    for _ in 0..3 {
      let out = engine.heal(&old, MISSING_DEP, &engine.history(&old.project_id).unwrap());
      engine.record(&out.attempt.unwrap()).unwrap();
      old = out.state;
    }
    assert_eq!(engine.history("old-project").unwrap().len(), 3);

    let mut fresh = executing_state();
    fresh.project_id = "new-project".to_string();
    let history = engine.history(&fresh.project_id).unwrap();
    assert!(history.is_empty());
    let out = engine.heal(&fresh, MISSING_DEP, &history);
    assert_eq!(out.action, HealAction::Retry);
    assert_eq!(out.attempt.unwrap().attempt, 1);
  }

  #[test]
  fn relative_paths_cannot_escape_the_project() {
    let root = Path::new("/repo");
    assert_eq!(project_relative(root, "src/a.rs"), Some(PathBuf::from("src/a.rs")));
    assert_eq!(project_relative(root, "/repo/src/a.rs"), Some(PathBuf::from("src/a.rs")));
    assert_eq!(project_relative(root, "/etc/passwd"), None);
    assert_eq!(project_relative(root, "../x"), None);
  }
}
