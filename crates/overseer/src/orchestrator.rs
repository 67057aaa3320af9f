//! Drives a project through its phases.
//!
//! Every command loads the state, computes one step and saves the result
//! through the [`StateStore`]. Nothing else writes the state file.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::breaker;
use crate::config::{AppContext, detect_mode};
use crate::domain::{
  Finding, Mode, Phase, Priority, ProjectState, ResultStatus, SubPhase, SubTeam, TeamStatus,
  TripReason,
};
use crate::healing::{AttemptOutcome, HealAction, HealingEngine, RunVerdict};
use crate::machine::{PhaseMachine, TransitionError};
use crate::monitor::{
  NixProcessControl, ProcessControl, ProcessKind, ProcessMonitor, ProcessRegistryEntry,
  SweepReport,
};
use crate::store::StateStore;
use crate::subteam::{Collected, QualityGate, SubTeamManager};
use crate::watchdog::{Watchdog, WatchdogFinding};

const RECENT_EVENTS: usize = 5;

/// A condition that needs a human or another external action. The binary
/// exits with status 2 for it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct Blocked {
  pub reason: String,
}

impl Blocked {
  pub fn new(reason: impl Into<String>) -> Self {
    Self {
      reason: reason.into(),
    }
  }
}

impl From<TransitionError> for Blocked {
  fn from(err: TransitionError) -> Self {
    Self::new(format!("transition rejected: {err}"))
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
  /// The project moved or new work was dispatched.
  Advanced,
  /// Agents are still working.
  Waiting,
  /// Nothing left to do.
  Done,
  Blocked(String),
}

#[derive(Debug, Clone)]
pub struct Step {
  pub state: ProjectState,
  pub report: Vec<String>,
  pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
  pub tokens_used: u64,
  pub max_tokens: u64,
  pub cost_usd: f64,
  pub max_cost_usd: f64,
  pub healing_attempts: u32,
  pub max_total_heal_attempts: u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tripped: Option<TripReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeamSummary {
  pub id: String,
  pub phase: Phase,
  pub status: TeamStatus,
  pub reported: Vec<String>,
  pub pending: Vec<String>,
  pub health: Vec<WatchdogFinding>,
  pub reruns: u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub confidence: Option<f64>,
  pub degraded: bool,
  pub age_secs: i64,
}

/// Document printed by `status --json`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
  pub project_id: String,
  pub request: String,
  pub mode: Mode,
  pub phase: Phase,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sub_phase: Option<SubPhase>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub healing_from: Option<Phase>,
  pub revision: u64,
  pub updated_at: DateTime<Utc>,
  pub agents: Vec<String>,
  pub breaker: BreakerStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub team: Option<TeamSummary>,
  /// Findings keyed by priority label (`P0`..`P3`).
  pub findings: BTreeMap<String, Vec<String>>,
  pub integrity: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub abort_reason: Option<String>,
  /// Latest journal entries, oldest first, as `kind: detail`.
  pub recent_events: Vec<String>,
  /// Registered processes killed for this project so far.
  pub kills: usize,
  pub next_action: String,
}

/// What a sweep did, and the project's state afterwards.
#[derive(Debug, Clone)]
pub struct SweepOutcome {
  pub report: SweepReport,
  pub state: Option<ProjectState>,
  pub aborted: Option<String>,
}

pub struct Orchestrator<C: ProcessControl + Clone = NixProcessControl> {
  ctx: AppContext,
  store: StateStore,
  watchdog: Watchdog,
  monitor: ProcessMonitor<C>,
  teams: SubTeamManager<C>,
  healing: HealingEngine,
}

impl Orchestrator<NixProcessControl> {
  pub fn new(ctx: &AppContext) -> Result<Self> {
    Self::with_control(ctx, NixProcessControl)
  }
}

fn put_team(state: &mut ProjectState, team: SubTeam) {
  state.sub_teams.insert(team.id.clone(), team);
}

fn position(phase: Phase, sub_phase: Option<SubPhase>) -> String {
  match sub_phase {
    Some(sub) => format!("{phase}/{sub}"),
    None => phase.to_string(),
  }
}

fn first_line(text: &str) -> &str {
  text.lines().find(|l| !l.trim().is_empty()).unwrap_or(text).trim()
}

impl<C: ProcessControl + Clone> Orchestrator<C> {
  /// # Errors
  /// Fails when the configured agent launcher is unknown or empty.
  pub fn with_control(ctx: &AppContext, control: C) -> Result<Self> {
    let cfg = &ctx.config;
    let launcher = cfg.launcher_argv()?;
    Ok(Self {
      store: StateStore::new(
        ctx.paths.clone(),
        ctx.clock.clone(),
        cfg.state.backup_retention,
      ),
      watchdog: Watchdog::new(ctx.paths.clone(), ctx.clock.clone(), cfg.timeouts.clone()),
      monitor: ProcessMonitor::new(
        ctx.paths.clone(),
        ctx.clock.clone(),
        cfg.timeouts.clone(),
        control.clone(),
      ),
      teams: SubTeamManager::new(
        ctx.paths.clone(),
        ctx.clock.clone(),
        cfg.timeouts.clone(),
        cfg.quality.clone(),
        launcher,
        control,
      ),
      healing: HealingEngine::new(
        ctx.paths.clone(),
        ctx.clock.clone(),
        cfg.limits.clone(),
        cfg.models.clone(),
      ),
      ctx: ctx.clone(),
    })
  }

  #[must_use]
  pub fn store(&self) -> &StateStore {
    &self.store
  }

  fn load(&self) -> Result<ProjectState> {
    self
      .store
      .load_or_recover()?
      .context("no project here; run `overseer init <request>` first")
  }

  fn event(&self, state: &ProjectState, kind: &str, detail: impl Into<String>) -> Result<()> {
    self.store.append_event(&state.project_id, kind, detail)
  }

  fn warn_integrity(&self, state: &ProjectState) {
    for issue in self.watchdog.check_state_integrity(state) {
      crate::log_warn!("State integrity: {}", issue);
    }
  }

  /// Start a new project, replacing a finished one.
  pub fn init(&self, request: &str, mode: Option<Mode>, force: bool) -> Result<ProjectState> {
    if request.trim().is_empty() {
      bail!("the request must not be empty");
    }
    let _command = self.store.lock_command()?;
    let existing = self.store.load_or_recover()?;
    if let Some(existing) = &existing
      && !existing.phase.is_terminal()
      && !force
    {
      return Err(
        Blocked::new(format!(
          "project {} is still {}; pass --force to replace it",
          existing.project_id, existing.phase
        ))
        .into(),
      );
    }
    let mode = mode.unwrap_or_else(|| detect_mode(self.ctx.paths.root()));
    let mut state = ProjectState::new(request, mode, self.ctx.clock.now());
    // Healing history and kill accounting are keyed by project id.
    if let Some(existing) = &existing
      && existing.project_id == state.project_id
    {
      state.project_id = format!("{}-r{}", state.project_id, existing.revision + 1);
    }
    if let Some(existing) = &existing {
      self.archive_outputs(existing)?;
    }
    self.store.replace(&mut state)?;
    self.event(&state, "init", format!("{} mode: {}", state.mode, state.request))?;
    Ok(state)
  }

  /// Move a replaced project's phase outputs out of the way so the new
  /// project's teams never read them as their own results.
  fn archive_outputs(&self, old: &ProjectState) -> Result<()> {
    let phases = self.ctx.paths.phases_dir();
    if !phases.is_dir() {
      return Ok(());
    }
    let target = self.ctx.paths.archive_dir().join(&old.project_id).join("phases");
    crate::healing::move_path(&phases, &target)?;
    log::debug!("archived outputs of {} to {}", old.project_id, target.display());
    Ok(())
  }

  /// Check the current step's exit condition and take at most one step.
  pub fn next(&self, confirm: bool) -> Result<Step> {
    let _command = self.store.lock_command()?;
    let original = self.load()?;
    self.warn_integrity(&original);
    let mut state = original.clone();
    let mut report = Vec::new();
    let outcome = self.advance(&mut state, confirm, &mut report)?;
    if state != original {
      self.store.save(&mut state)?;
    }
    Ok(Step {
      state,
      report,
      outcome,
    })
  }

  fn advance(
    &self,
    state: &mut ProjectState,
    confirm: bool,
    report: &mut Vec<String>,
  ) -> Result<StepOutcome> {
    match state.phase {
      Phase::Complete => {
        report.push("Project is complete; nothing to do.".to_string());
        return Ok(StepOutcome::Done);
      }
      Phase::Aborted => {
        return Ok(StepOutcome::Blocked(format!(
          "project aborted: {}",
          state.abort_reason.as_deref().unwrap_or("no reason recorded")
        )));
      }
      _ => {}
    }
    let check = breaker::check(state, &self.ctx.config.limits);
    if check.hard {
      let reason = check
        .reason
        .as_ref()
        .map_or_else(|| "circuit breaker tripped".to_string(), ToString::to_string);
      return self.abort(state, &format!("circuit breaker: {reason}"), check.reason, report);
    }

    match (state.phase, state.sub_phase) {
      (Phase::Init, _) => {
        self.transition(state, Phase::Planning, Some(SubPhase::TemplateConfirm))?;
        let roles = self.ctx.config.roles_for(Phase::Planning);
        report.push(format!(
          "Planning started. Planning team: {}. Review the request, then run `overseer next --confirm`.",
          roles.join(", ")
        ));
        Ok(StepOutcome::Advanced)
      }
      (Phase::Planning, Some(SubPhase::TemplateConfirm)) => {
        if !confirm {
          return Ok(StepOutcome::Blocked(
            "template_confirm: confirm the request and planning team with `overseer next --confirm`"
              .to_string(),
          ));
        }
        state.confirmations.insert(SubPhase::TemplateConfirm);
        self.transition(state, Phase::Planning, Some(SubPhase::PlanDispatchWait))?;
        let tier = self.ctx.config.models.tier(0);
        self.start_team(state, Phase::Planning, &tier, None, report)?;
        Ok(StepOutcome::Advanced)
      }
      (Phase::Planning, Some(SubPhase::PlanReview)) => {
        if !confirm {
          let plan = state
            .completed_team_for(Phase::Planning)
            .map(|t| {
              t.roster
                .iter()
                .map(|a| a.output_path.clone())
                .collect::<Vec<_>>()
                .join(", ")
            })
            .unwrap_or_default();
          return Ok(StepOutcome::Blocked(format!(
            "plan_review: review the plan ({plan}) and approve it with `overseer next --confirm`"
          )));
        }
        state.confirmations.insert(SubPhase::PlanReview);
        self.transition(state, Phase::Executing, Some(SubPhase::ExecutionDispatchWait))?;
        let tier = self.ctx.config.models.tier(0);
        self.start_team(state, Phase::Executing, &tier, None, report)?;
        Ok(StepOutcome::Advanced)
      }
      (_, Some(sub)) if sub.waits_on_team() => self.wait_on_team(state, confirm, report),
      (phase, sub) => bail!(
        "state is inconsistent at {}; inspect .overseer/state.json or restore a backup",
        position(phase, sub)
      ),
    }
  }

  fn transition(
    &self,
    state: &mut ProjectState,
    phase: Phase,
    sub_phase: Option<SubPhase>,
  ) -> Result<()> {
    PhaseMachine::new(&self.watchdog, &self.ctx.config.limits)
      .validate_transition(state, phase, sub_phase)
      .map_err(Blocked::from)?;
    let from = position(state.phase, state.sub_phase);
    if phase == Phase::Healing {
      if state.phase != Phase::Healing {
        state.healing_from = Some(state.phase);
      }
    } else {
      state.healing_from = None;
    }
    state.phase = phase;
    state.sub_phase = sub_phase;
    let to = position(phase, sub_phase);
    log::debug!("transition {from} -> {to}");
    self.event(state, "transition", format!("{from} -> {to}"))
  }

  fn start_team(
    &self,
    state: &mut ProjectState,
    phase: Phase,
    tier: &str,
    instruction: Option<&str>,
    report: &mut Vec<String>,
  ) -> Result<String> {
    let roles = self.ctx.config.roles_for(phase);
    let mut team = self.teams.create(state, phase, &roles, tier, instruction)?;
    let launched = self.teams.dispatch(state, &mut team)?;
    state.assign_agents(roles.iter().cloned());
    if launched > 0 {
      report.push(format!("Dispatched {} ({launched} agents, tier {tier}).", team.id));
    } else {
      report.push(format!(
        "Team {} is ready. Start one agent per prompt; each writes its result file:",
        team.id
      ));
      for agent in &team.roster {
        report.push(format!(
          "  {}: {} -> {}",
          agent.role, agent.prompt_path, agent.output_path
        ));
      }
    }
    let id = team.id.clone();
    self.event(
      state,
      "dispatch",
      format!("{id} ({}) tier {tier}", team.roles().join(", ")),
    )?;
    put_team(state, team);
    state.active_team = Some(id.clone());
    Ok(id)
  }

  fn wait_on_team(
    &self,
    state: &mut ProjectState,
    confirm: bool,
    report: &mut Vec<String>,
  ) -> Result<StepOutcome> {
    let Some(mut team) = state.active_team().filter(|t| t.is_active()).cloned() else {
      let phase = state.phase;
      if !confirm {
        return Ok(StepOutcome::Blocked(format!(
          "no {phase} team is running; dispatch a new one with `overseer next --confirm`"
        )));
      }
      let tier = self.ctx.config.models.tier(0);
      self.start_team(state, phase, &tier, None, report)?;
      return Ok(StepOutcome::Advanced);
    };

    let progress = self.teams.resume(&mut team);
    if !progress.is_complete() {
      if !progress.health.is_empty() {
        for finding in &progress.health {
          report.push(format!("{} is {}: {}", finding.subject, finding.status, finding.detail));
        }
        let text = progress
          .health
          .iter()
          .map(|f| f.detail.clone())
          .collect::<Vec<_>>()
          .join("\n");
        let baseline = progress.health.len();
        return self.handle_failure(state, team, &text, baseline, &[], report);
      }
      report.push(format!(
        "Waiting for {} of {} agents in {}: {}",
        progress.pending.len(),
        team.roster.len(),
        team.id,
        progress.pending.join(", ")
      ));
      put_team(state, team);
      return Ok(StepOutcome::Waiting);
    }

    let results = self.teams.collect(&mut team)?;
    self.absorb(state, &mut team, &results);
    let outputs: Vec<String> = results
      .iter()
      .flat_map(|c| c.result.outputs.iter().cloned())
      .collect();

    let check = breaker::check(state, &self.ctx.config.limits);
    if check.hard {
      put_team(state, team);
      let reason = check
        .reason
        .as_ref()
        .map_or_else(|| "circuit breaker tripped".to_string(), ToString::to_string);
      return self.abort(state, &format!("circuit breaker: {reason}"), check.reason, report);
    }

    if state.phase == Phase::Healing {
      return self.judge_healing(state, team, &results, &outputs, report);
    }

    let failed: Vec<&Collected> = results.iter().filter(|c| c.result.is_failure()).collect();
    if !failed.is_empty() {
      let text = failed
        .iter()
        .map(|c| c.result.failure_text())
        .collect::<Vec<_>>()
        .join("\n");
      let baseline = failed
        .iter()
        .map(|c| c.result.errors.len())
        .sum::<usize>()
        .max(1);
      for c in &failed {
        report.push(format!("{} failed: {}", c.role, first_line(&c.result.failure_text())));
      }
      return self.handle_failure(state, team, &text, baseline, &outputs, report);
    }

    match self.teams.quality_gate(&mut team, &results) {
      QualityGate::RerunRequested => {
        let confidence = crate::subteam::aggregate_confidence(&results);
        self.teams.rerun(state, &mut team)?;
        report.push(format!(
          "Confidence {confidence:.2} is below {:.2}; re-running {} ({} of {}).",
          self.ctx.config.quality.threshold,
          team.id,
          team.reruns,
          self.ctx.config.quality.max_reruns
        ));
        self.event(state, "rerun", format!("{} confidence {confidence:.2}", team.id))?;
        put_team(state, team);
        Ok(StepOutcome::Waiting)
      }
      gate @ (QualityGate::Passed | QualityGate::AcceptedDegraded) => {
        let confidence = team.confidence.unwrap_or(1.0);
        if gate == QualityGate::AcceptedDegraded {
          report.push(format!(
            "Accepted {} with degraded confidence {confidence:.2}.",
            team.id
          ));
          state.findings.push(Finding {
            priority: Priority::Medium,
            message: format!(
              "{} results accepted below the quality threshold (confidence {confidence:.2})",
              team.id
            ),
            agent: "overseer".to_string(),
            phase: team.phase,
          });
        }
        self.teams.teardown(&mut team)?;
        self.event(state, "collect", format!("{} confidence {confidence:.2}", team.id))?;
        put_team(state, team);
        self.complete_phase(state, report)
      }
    }
  }

  /// Add the results' usage and findings to the project, once per result set.
  fn absorb(&self, state: &mut ProjectState, team: &mut SubTeam, results: &[Collected]) {
    if team.recovery.usage_recorded {
      return;
    }
    for collected in results {
      let usage = &collected.result.usage;
      state.circuit_breakers =
        breaker::update(&state.circuit_breakers, usage.tokens, usage.cost_usd, None);
      for finding in &collected.result.findings {
        state.findings.push(Finding {
          priority: finding.priority,
          message: finding.message.clone(),
          agent: collected.role.clone(),
          phase: team.phase,
        });
      }
    }
    team.recovery.usage_recorded = true;
  }

  fn complete_phase(&self, state: &mut ProjectState, report: &mut Vec<String>) -> Result<StepOutcome> {
    match state.phase {
      Phase::Planning => {
        let review = state.sub_phase.and_then(SubPhase::next_in_phase);
        self.transition(state, Phase::Planning, review)?;
        report.push("Plan is ready. Review it, then run `overseer next --confirm`.".to_string());
      }
      Phase::Executing => {
        self.transition(state, Phase::Verifying, Some(SubPhase::VerifyWait))?;
        let tier = self.ctx.config.models.tier(0);
        self.start_team(state, Phase::Verifying, &tier, None, report)?;
      }
      Phase::Verifying => {
        self.transition(state, Phase::Complete, None)?;
        state.active_team = None;
        report.push("Verification passed. Project complete.".to_string());
      }
      other => bail!("no phase follows {other}"),
    }
    Ok(StepOutcome::Advanced)
  }

  fn handle_failure(
    &self,
    state: &mut ProjectState,
    mut team: SubTeam,
    text: &str,
    baseline: usize,
    outputs: &[String],
    report: &mut Vec<String>,
  ) -> Result<StepOutcome> {
    let origin = state.working_phase();
    if !origin.can_heal() {
      self.teams.teardown(&mut team)?;
      self.event(state, "failure", format!("{}: {}", team.id, first_line(text)))?;
      put_team(state, team);
      return Ok(StepOutcome::Blocked(format!(
        "{origin} failed: {}; fix the cause and dispatch a new {origin} team with `overseer next --confirm`",
        first_line(text)
      )));
    }
    let checkpoint = (state.phase == Phase::Healing)
      .then(|| team.recovery.checkpoint_id.clone())
      .flatten();
    self.start_healing(state, Some(team), text, baseline, checkpoint, outputs, report)
  }

  /// Run the healing engine on `text` and act on its decision.
  #[allow(clippy::too_many_arguments)]
  fn start_healing(
    &self,
    state: &mut ProjectState,
    failing: Option<SubTeam>,
    text: &str,
    baseline: usize,
    checkpoint: Option<String>,
    outputs: &[String],
    report: &mut Vec<String>,
  ) -> Result<StepOutcome> {
    if let Some(team) = &failing {
      put_team(state, team.clone());
    }
    let history = self.healing.history(&state.project_id)?;
    let outcome = self.healing.heal(state, text, &history);
    if let Some(attempt) = &outcome.attempt {
      self.healing.record(attempt)?;
    }
    self.event(
      state,
      "heal",
      format!(
        "{:?} {} ({}, {} severity)",
        outcome.action, outcome.signature, outcome.category, outcome.severity
      ),
    )?;

    if outcome.action == HealAction::Abort {
      *state = outcome.state;
      let reason = outcome
        .reason
        .unwrap_or_else(|| "healing stopped".to_string());
      return self.abort(state, &reason, None, report);
    }
    *state = outcome.state;

    let origin = state.working_phase();
    let checkpoint = match checkpoint {
      Some(id) => id,
      None => self.healing.checkpoint(state, origin, outputs)?,
    };
    if let Some(mut team) = failing {
      self.teams.teardown(&mut team)?;
      put_team(state, team);
    }
    if state.phase != Phase::Healing {
      let sub_phase = state.sub_phase;
      self.transition(state, Phase::Healing, sub_phase)?;
    }

    let tier = outcome
      .attempt
      .as_ref()
      .map_or_else(|| self.ctx.config.models.tier(1), |a| a.tier.clone());
    let instruction = outcome.instruction.unwrap_or_default();
    let id = self.start_team(state, Phase::Healing, &tier, Some(&instruction), report)?;
    if let Some(team) = state.sub_teams.get_mut(&id) {
      team.recovery.checkpoint_id = Some(checkpoint);
      team.recovery.baseline_errors = Some(baseline);
      team.recovery.signature = Some(outcome.signature.clone());
    }
    let attempt = outcome.attempt.as_ref().map_or(1, |a| a.attempt);
    report.push(format!(
      "Healing {} failure from {origin} (attempt {attempt}, tier {tier}, {}).",
      outcome.category,
      match outcome.action {
        HealAction::Retry => "retry",
        _ => "escalated",
      }
    ));
    Ok(StepOutcome::Advanced)
  }

  /// Append a follow-up record for the latest attempt at `signature`. It
  /// reports on that attempt and does not open a new one.
  fn record_follow_up(
    &self,
    project_id: &str,
    signature: &str,
    outcome: AttemptOutcome,
  ) -> Result<()> {
    let history = self.healing.history(project_id)?;
    let Some(last) = history.iter().rev().find(|a| a.signature == signature) else {
      log::warn!("no healing attempt recorded for {signature}");
      return Ok(());
    };
    let mut follow_up = last.clone();
    follow_up.outcome = outcome;
    follow_up.timestamp = self.ctx.clock.now();
    self.healing.record(&follow_up)
  }

  fn judge_healing(
    &self,
    state: &mut ProjectState,
    mut team: SubTeam,
    results: &[Collected],
    outputs: &[String],
    report: &mut Vec<String>,
  ) -> Result<StepOutcome> {
    let baseline = team.recovery.baseline_errors.unwrap_or(1);
    let signature = team.recovery.signature.clone().unwrap_or_default();
    let raw: Vec<_> = results.iter().map(|c| c.result.clone()).collect();

    match HealingEngine::judge_run(baseline, &raw) {
      RunVerdict::Resolved => {
        self.record_follow_up(&state.project_id, &signature, AttemptOutcome::Resolved)?;
        self.teams.teardown(&mut team)?;
        put_team(state, team);
        let origin = state.working_phase();
        let sub_phase = state.sub_phase;
        self.transition(state, origin, sub_phase)?;
        report.push(format!("Healing resolved the failure; running {origin} again."));
        let tier = self.ctx.config.models.tier(0);
        self.start_team(state, origin, &tier, None, report)?;
        Ok(StepOutcome::Advanced)
      }
      RunVerdict::Failed => {
        self.record_follow_up(&state.project_id, &signature, AttemptOutcome::Failed)?;
        let text = results
          .iter()
          .filter(|c| c.result.status != ResultStatus::Success || !c.result.errors.is_empty())
          .map(|c| c.result.failure_text())
          .collect::<Vec<_>>()
          .join("\n");
        let text = if text.trim().is_empty() {
          "healing run did not resolve the failure".to_string()
        } else {
          text
        };
        report.push(format!("Healing run failed: {}", first_line(&text)));
        let checkpoint = team.recovery.checkpoint_id.clone();
        self.start_healing(state, Some(team), &text, baseline, checkpoint, outputs, report)
      }
      RunVerdict::Worse => {
        let checkpoint = team
          .recovery
          .checkpoint_id
          .clone()
          .context("healing team has no checkpoint to roll back to")?;
        self.record_follow_up(&state.project_id, &signature, AttemptOutcome::RolledBack)?;
        self.teams.teardown(&mut team)?;
        let mut restored = self.healing.rollback(&checkpoint, state, outputs)?;
        // The failing team is collected again and goes back to healing.
        if let Some(origin_team) = restored.active_team_mut() {
          origin_team.status = TeamStatus::Running;
        }
        let errors: usize = raw.iter().map(|r| r.errors.len()).sum();
        put_team(&mut restored, team);
        *state = restored;
        self.event(
          state,
          "rollback",
          format!("{:?} to {checkpoint}: {errors} errors vs {baseline}", HealAction::RollBack),
        )?;
        report.push(format!(
          "Healing made things worse ({errors} errors, was {baseline}); rolled back to checkpoint {checkpoint}."
        ));
        Ok(StepOutcome::Advanced)
      }
    }
  }

  fn abort(
    &self,
    state: &mut ProjectState,
    reason: &str,
    latch: Option<TripReason>,
    report: &mut Vec<String>,
  ) -> Result<StepOutcome> {
    if let Some(trip) = latch
      && trip.is_hard()
      && state.circuit_breakers.tripped.is_none()
    {
      self.event(state, "breaker", trip.to_string())?;
      state.circuit_breakers.tripped = Some(trip);
    }
    if let Some(mut team) = state.active_team().filter(|t| t.is_active()).cloned() {
      self.teams.teardown(&mut team)?;
      put_team(state, team);
    }
    self.transition(state, Phase::Aborted, None)?;
    state.active_team = None;
    state.abort_reason = Some(reason.to_string());
    self.event(state, "abort", reason)?;
    report.push(format!("Project aborted: {reason}"));
    Ok(StepOutcome::Blocked(format!("project aborted: {reason}")))
  }

  /// Feed an externally observed failure to the healing engine.
  pub fn heal(&self, error_text: &str) -> Result<Step> {
    if error_text.trim().is_empty() {
      bail!("no error text given");
    }
    let _command = self.store.lock_command()?;
    let original = self.load()?;
    let mut state = original.clone();
    let mut report = Vec::new();
    let outcome = self.heal_step(&mut state, error_text, &mut report)?;
    if state != original {
      self.store.save(&mut state)?;
    }
    Ok(Step {
      state,
      report,
      outcome,
    })
  }

  fn heal_step(
    &self,
    state: &mut ProjectState,
    error_text: &str,
    report: &mut Vec<String>,
  ) -> Result<StepOutcome> {
    match state.phase {
      Phase::Aborted => {
        return Ok(StepOutcome::Blocked(format!(
          "project is aborted ({}); healing is not possible",
          state.abort_reason.as_deref().unwrap_or("no reason recorded")
        )));
      }
      Phase::Complete => {
        return Ok(StepOutcome::Blocked(
          "project is complete; nothing to heal".to_string(),
        ));
      }
      _ => {}
    }
    let check = breaker::check(state, &self.ctx.config.limits);
    if check.hard {
      let reason = check
        .reason
        .as_ref()
        .map_or_else(|| "circuit breaker tripped".to_string(), ToString::to_string);
      return self.abort(state, &format!("circuit breaker: {reason}"), check.reason, report);
    }
    if !state.working_phase().can_heal() {
      return Ok(StepOutcome::Blocked(format!(
        "cannot heal during {}; healing applies to executing and verifying",
        state.phase
      )));
    }
    let failing = state.active_team().filter(|t| t.is_active()).cloned();
    let checkpoint = if state.phase == Phase::Healing {
      failing.as_ref().and_then(|t| t.recovery.checkpoint_id.clone())
    } else {
      None
    };
    let baseline = error_text.lines().filter(|l| !l.trim().is_empty()).count().max(1);
    self.start_healing(state, failing, error_text, baseline, checkpoint, &[], report)
  }

  /// One orphan sweep. Kills of this project's processes count towards the
  /// breaker; crossing the ceiling aborts the project.
  pub fn sweep(&self) -> Result<SweepOutcome> {
    let _command = self.store.lock_command()?;
    let loaded = self.store.load_or_recover()?;
    let report = self.monitor.sweep(loaded.as_ref())?;
    let Some(mut state) = loaded else {
      return Ok(SweepOutcome {
        report,
        state: None,
        aborted: None,
      });
    };
    for kill in &report.killed {
      self.store.append_event(
        &kill.project,
        "kill",
        format!("pid {}: {}", kill.pid, kill.reason),
      )?;
    }
    let own = report
      .killed
      .iter()
      .filter(|k| k.project == state.project_id)
      .count();
    if own == 0 {
      return Ok(SweepOutcome {
        report,
        state: Some(state),
        aborted: None,
      });
    }

    let key = breaker::orphan_kill_key(&state.project_id);
    for _ in 0..own {
      state.circuit_breakers = breaker::update(&state.circuit_breakers, 0, 0.0, Some(&key));
    }
    let mut aborted = None;
    let check = breaker::check(&state, &self.ctx.config.limits);
    if check.hard && !state.phase.is_terminal() {
      let reason = check
        .reason
        .as_ref()
        .map_or_else(|| "circuit breaker tripped".to_string(), ToString::to_string);
      let reason = format!("circuit breaker: {reason}");
      let mut lines = Vec::new();
      self.abort(&mut state, &reason, check.reason, &mut lines)?;
      aborted = Some(reason);
    }
    self.store.save(&mut state)?;
    Ok(SweepOutcome {
      report,
      state: Some(state),
      aborted,
    })
  }

  /// Record an externally started process for the current project.
  pub fn register(
    &self,
    pid: u32,
    kind: ProcessKind,
    role: Option<String>,
  ) -> Result<ProcessRegistryEntry> {
    let _command = self.store.lock_command()?;
    let state = self.load()?;
    if state.phase.is_terminal() {
      return Err(Blocked::new(format!("project is {}; nothing may run for it", state.phase)).into());
    }
    let entry = self
      .monitor
      .register(pid, &state.project_id, kind, state.phase, role)?;
    self.event(&state, "register", format!("pid {pid} ({:?})", entry.kind))?;
    Ok(entry)
  }

  pub fn unregister(&self, pid: u32) -> Result<bool> {
    let _command = self.store.lock_command()?;
    let removed = self.monitor.unregister(pid)?;
    if removed && let Some(state) = self.store.load_or_recover()? {
      self.event(&state, "unregister", format!("pid {pid}"))?;
    }
    Ok(removed)
  }

  /// Read-only summary of the project, `None` when there is none.
  pub fn status(&self) -> Result<Option<StatusSummary>> {
    let Some(state) = self.store.load_or_recover()? else {
      return Ok(None);
    };
    let limits = &self.ctx.config.limits;
    let now = self.ctx.clock.now();
    let team = state.active_team().map(|team| {
      let progress = self.teams.check(team);
      TeamSummary {
        id: team.id.clone(),
        phase: team.phase,
        status: team.status,
        reported: progress.reported,
        pending: progress.pending,
        health: progress.health,
        reruns: team.reruns,
        confidence: team.confidence,
        degraded: team.degraded,
        age_secs: crate::watchdog::age(now, team.created_at).num_seconds(),
      }
    });
    let findings = state
      .findings_by_priority()
      .into_iter()
      .map(|(priority, items)| {
        (
          priority.label().to_string(),
          items
            .iter()
            .map(|f| format!("[{}/{}] {}", f.phase, f.agent, f.message))
            .collect(),
        )
      })
      .collect();
    let events = self.store.events()?;
    let recent_events = events
      .iter()
      .skip(events.len().saturating_sub(RECENT_EVENTS))
      .map(|e| format!("{}: {}", e.kind, e.detail))
      .collect();
    let kills = self
      .monitor
      .kill_log()?
      .iter()
      .filter(|k| k.project == state.project_id)
      .count();
    let next_action = next_action(&state, team.as_ref());
    Ok(Some(StatusSummary {
      project_id: state.project_id.clone(),
      request: state.request.clone(),
      mode: state.mode,
      phase: state.phase,
      sub_phase: state.sub_phase,
      healing_from: state.healing_from,
      revision: state.revision,
      updated_at: state.updated_at,
      agents: state.agents.clone(),
      breaker: BreakerStatus {
        tokens_used: state.circuit_breakers.tokens_used,
        max_tokens: limits.max_tokens,
        cost_usd: state.circuit_breakers.cost_usd,
        max_cost_usd: limits.max_cost_usd,
        healing_attempts: state.healing_attempts,
        max_total_heal_attempts: limits.max_total_heal_attempts,
        tripped: state.circuit_breakers.tripped.clone(),
      },
      team,
      findings,
      integrity: self.watchdog.check_state_integrity(&state),
      abort_reason: state.abort_reason.clone(),
      recent_events,
      kills,
      next_action,
    }))
  }
}

fn next_action(state: &ProjectState, team: Option<&TeamSummary>) -> String {
  match (state.phase, state.sub_phase) {
    (Phase::Complete, _) => "nothing; the project is complete".to_string(),
    (Phase::Aborted, _) => "start a new project with `overseer init --force <request>`".to_string(),
    (Phase::Init, _) => "run `overseer next` to start planning".to_string(),
    (_, Some(sub)) if sub.needs_confirmation() => {
      format!("review {sub}, then run `overseer next --confirm`")
    }
    _ => match team {
      Some(t) if t.pending.is_empty() && t.status == TeamStatus::Running => {
        "all agents reported; run `overseer next` to collect".to_string()
      }
      Some(t) if !t.health.is_empty() => {
        "some agents look unhealthy; run `overseer next` to start healing".to_string()
      }
      Some(t) if t.status == TeamStatus::Running => {
        format!("wait for {}; run `overseer next` to check", t.pending.join(", "))
      }
      _ => "run `overseer next --confirm` to dispatch a team".to_string(),
    },
  }
}
