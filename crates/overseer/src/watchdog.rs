//! Detection only: agent output health, state integrity and phase
//! preconditions. Nothing here kills, retries or writes.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::{OverseerPaths, Timeouts};
use crate::domain::{
  AgentResult, Phase, ProjectState, ResultStatus, SubPhase, SubTeam,
};
use crate::store::json::{JsonDoc, read_json_doc};
use crate::utils::clock::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
  Healthy,
  Stuck,
  Empty,
  Missing,
}

impl fmt::Display for AgentHealth {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      AgentHealth::Healthy => "healthy",
      AgentHealth::Stuck => "stuck",
      AgentHealth::Empty => "empty",
      AgentHealth::Missing => "missing",
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchdogFinding {
  pub subject: String,
  pub status: AgentHealth,
  pub detail: String,
}

pub struct Watchdog {
  paths: OverseerPaths,
  clock: SharedClock,
  timeouts: Timeouts,
}

impl Watchdog {
  #[must_use]
  pub fn new(paths: OverseerPaths, clock: SharedClock, timeouts: Timeouts) -> Self {
    Self {
      paths,
      clock,
      timeouts,
    }
  }

  /// Classify one agent's result file.
  ///
  /// - missing: absent at or after `started_at + timeout`
  /// - empty: zero-length or not a result document, older than the grace period
  /// - stuck: an `in_progress` document not modified within the timeout
  /// - healthy: anything else, including "still running before the deadline"
  #[must_use]
  pub fn check_agent_health(
    &self,
    role: &str,
    output_path: &Path,
    started_at: DateTime<Utc>,
    phase: Phase,
  ) -> (AgentHealth, String) {
    let now = self.clock.now();
    let timeout = self.timeouts.for_phase(phase);
    let Ok(meta) = std::fs::metadata(output_path) else {
      if now >= started_at + timeout {
        return (
          AgentHealth::Missing,
          format!(
            "{role}: timed out without a result after {}s ({})",
            (now - started_at).num_seconds(),
            output_path.display()
          ),
        );
      }
      return (AgentHealth::Healthy, format!("{role}: running"));
    };
    let modified: DateTime<Utc> = meta
      .modified()
      .map(DateTime::<Utc>::from)
      .unwrap_or(started_at);
    let idle = now - modified;

    let parsed = if meta.len() == 0 {
      None
    } else {
      match read_json_doc::<AgentResult>(output_path) {
        Ok(JsonDoc::Valid(result)) => Some(result),
        _ => None,
      }
    };
    match parsed {
      None if idle > self.timeouts.grace() => (
        AgentHealth::Empty,
        format!("{role}: result file is empty or not a result document"),
      ),
      None => (AgentHealth::Healthy, format!("{role}: result being written")),
      Some(result) if result.status == ResultStatus::InProgress && idle > timeout => (
        AgentHealth::Stuck,
        format!("{role}: timed out in progress, no update for {}s", idle.num_seconds()),
      ),
      Some(result) if result.status == ResultStatus::InProgress => {
        (AgentHealth::Healthy, format!("{role}: in progress"))
      }
      Some(_) => (AgentHealth::Healthy, format!("{role}: reported")),
    }
  }

  /// Non-healthy findings for every member of `team`.
  #[must_use]
  pub fn check_team(&self, team: &SubTeam) -> Vec<WatchdogFinding> {
    team
      .roster
      .iter()
      .filter_map(|agent| {
        let path = self.paths.root().join(&agent.output_path);
        let (status, detail) =
          self.check_agent_health(&agent.role, &path, agent.started_at, team.phase);
        (status != AgentHealth::Healthy).then(|| WatchdogFinding {
          subject: agent.role.clone(),
          status,
          detail,
        })
      })
      .collect()
  }

  /// Structural problems in `state` that no valid sequence of commands produces.
  #[must_use]
  pub fn check_state_integrity(&self, state: &ProjectState) -> Vec<String> {
    let mut issues = Vec::new();
    let working = state.working_phase();

    match state.sub_phase {
      Some(sub) if state.phase.is_terminal() || state.phase == Phase::Init => {
        issues.push(format!("{} phase carries sub-phase {sub}", state.phase));
      }
      Some(sub) if sub.phase() != working => {
        issues.push(format!("sub-phase {sub} does not belong to phase {working}"));
      }
      None if !working.sub_phases().is_empty() => {
        issues.push(format!("phase {working} has no sub-phase"));
      }
      _ => {}
    }

    match (state.phase, state.healing_from) {
      (Phase::Healing, None) => issues.push("healing without an origin phase".to_string()),
      (Phase::Healing, Some(origin)) if !origin.can_heal() => {
        issues.push(format!("healing cannot start from {origin}"));
      }
      (phase, Some(origin)) if phase != Phase::Healing => {
        issues.push(format!("healing origin {origin} set outside healing"));
      }
      _ => {}
    }

    let cb = &state.circuit_breakers;
    if !cb.cost_usd.is_finite() || cb.cost_usd < 0.0 {
      issues.push(format!("invalid cost counter {}", cb.cost_usd));
    }
    let heal_errors: u64 = cb
      .error_counts
      .iter()
      .filter(|(sig, _)| !sig.starts_with(crate::breaker::ORPHAN_KILL_PREFIX))
      .map(|(_, n)| u64::from(*n))
      .sum();
    if heal_errors > u64::from(state.healing_attempts) {
      issues.push(format!(
        "breaker counted {heal_errors} healing errors but only {} attempts are recorded",
        state.healing_attempts
      ));
    }
    if let Some(trip) = &cb.tripped
      && trip.is_hard()
      && state.phase != Phase::Aborted
    {
      issues.push(format!("breaker tripped ({trip}) but project is {}", state.phase));
    }

    if let Some(id) = &state.active_team
      && !state.sub_teams.contains_key(id)
    {
      issues.push(format!("active team {id} is unknown"));
    }
    for (id, team) in &state.sub_teams {
      if id != &team.id {
        issues.push(format!("team stored as {id} has id {}", team.id));
      }
    }
    issues
  }

  /// Conditions that must hold before entering `target`.
  pub fn check_phase_preconditions(
    &self,
    state: &ProjectState,
    target: Phase,
  ) -> Result<(), Vec<String>> {
    let mut reasons = Vec::new();
    match target {
      Phase::Init | Phase::Aborted => {}
      Phase::Planning => {
        if state.request.trim().is_empty() {
          reasons.push("project has no request text".to_string());
        }
      }
      Phase::Executing => {
        if !state.confirmations.contains(&SubPhase::PlanReview) {
          reasons.push("plan has not been reviewed".to_string());
        }
        self.require_team_outputs(state, Phase::Planning, &mut reasons);
      }
      Phase::Verifying => self.require_team_outputs(state, Phase::Executing, &mut reasons),
      Phase::Complete => self.require_team_outputs(state, Phase::Verifying, &mut reasons),
      Phase::Healing => {
        if !state.phase.can_heal() {
          reasons.push(format!("cannot heal from {}", state.phase));
        }
      }
    }
    if reasons.is_empty() {
      Ok(())
    } else {
      Err(reasons)
    }
  }

  fn require_team_outputs(&self, state: &ProjectState, phase: Phase, reasons: &mut Vec<String>) {
    let Some(team) = state.completed_team_for(phase) else {
      reasons.push(format!("{phase} outputs have not been collected"));
      return;
    };
    for agent in &team.roster {
      let path = self.paths.root().join(&agent.output_path);
      match read_json_doc::<AgentResult>(&path) {
        Ok(JsonDoc::Valid(result)) if result.is_finished() => {}
        Ok(JsonDoc::Valid(_)) => {
          reasons.push(format!("{phase} output of {} is still in progress", agent.role));
        }
        _ => reasons.push(format!(
          "{phase} output of {} is incomplete ({})",
          agent.role, agent.output_path
        )),
      }
    }
  }
}

/// Age helper for status rendering.
#[must_use]
pub fn age(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
  (now - since).max(Duration::zero())
}
