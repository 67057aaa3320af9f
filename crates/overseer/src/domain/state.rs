use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::phase::{Phase, SubPhase};

/// How the project's agents are expected to work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
  #[default]
  Coding,
  Work,
}

impl fmt::Display for Mode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Mode::Coding => "coding",
      Mode::Work => "work",
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  #[serde(alias = "p0")]
  Critical,
  #[serde(alias = "p1")]
  High,
  #[serde(alias = "p2")]
  Medium,
  #[serde(alias = "p3")]
  Low,
}

impl Priority {
  pub const ALL: [Priority; 4] = [
    Priority::Critical,
    Priority::High,
    Priority::Medium,
    Priority::Low,
  ];

  #[must_use]
  pub fn label(self) -> &'static str {
    match self {
      Priority::Critical => "P0",
      Priority::High => "P1",
      Priority::Medium => "P2",
      Priority::Low => "P3",
    }
  }
}

/// Issue reported by an agent and accepted into the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
  pub priority: Priority,
  pub message: String,
  pub agent: String,
  pub phase: Phase,
}

/// Why the breaker stopped the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripReason {
  TokenCeiling { used: u64, limit: u64 },
  CostCeiling { used: f64, limit: f64 },
  HealingBudget { used: u32, limit: u32 },
  RepeatedError { signature: String, count: u32, limit: u32 },
  OrphanKills { count: u32, limit: u32 },
}

impl TripReason {
  /// Hard trips stop all further agent work for the project.
  #[must_use]
  pub fn is_hard(&self) -> bool {
    !matches!(self, TripReason::RepeatedError { .. })
  }
}

impl fmt::Display for TripReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TripReason::TokenCeiling { used, limit } => {
        write!(f, "token ceiling exceeded ({used} / {limit})")
      }
      TripReason::CostCeiling { used, limit } => {
        write!(f, "cost ceiling exceeded (${used:.2} / ${limit:.2})")
      }
      TripReason::HealingBudget { used, limit } => {
        write!(f, "healing budget exhausted ({used} / {limit} attempts)")
      }
      TripReason::RepeatedError {
        signature,
        count,
        limit,
      } => write!(f, "error repeated {count} times (limit {limit}): {signature}"),
      TripReason::OrphanKills { count, limit } => {
        write!(f, "{count} orphaned agent processes killed (limit {limit})")
      }
    }
  }
}

/// Cumulative resource and error counters of one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CircuitBreakers {
  #[serde(default)]
  pub tokens_used: u64,
  #[serde(default)]
  pub cost_usd: f64,
  #[serde(default)]
  pub error_counts: BTreeMap<String, u32>,
  /// Latched hard trip. Once set it is never cleared for this project.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tripped: Option<TripReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamStatus {
  Created,
  Running,
  Collecting,
  Complete,
  TornDown,
}

impl fmt::Display for TeamStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      TeamStatus::Created => "created",
      TeamStatus::Running => "running",
      TeamStatus::Collecting => "collecting",
      TeamStatus::Complete => "complete",
      TeamStatus::TornDown => "torn_down",
    })
  }
}

/// One role's slot in a sub-team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAssignment {
  pub role: String,
  pub prompt_path: String,
  pub output_path: String,
  pub tier: String,
  pub started_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pid: Option<u32>,
}

/// What is needed to pick a sub-team up again after the orchestrator's own
/// session ended. Only filled from the state file and output files on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RecoveryMeta {
  #[serde(default)]
  pub resumed_count: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_checked_at: Option<DateTime<Utc>>,
  /// Roles whose result file was present at the last check.
  #[serde(default)]
  pub reported: Vec<String>,
  /// Healing instruction the team was dispatched with, if any.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub instruction_path: Option<String>,
  /// Checkpoint taken before a healing team was dispatched.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub checkpoint_id: Option<String>,
  /// Error count of the failure a healing team is fixing.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub baseline_errors: Option<usize>,
  /// Normalized signature of that failure.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub signature: Option<String>,
  /// Usage and findings of the current results were added to the project.
  #[serde(default)]
  pub usage_recorded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTeam {
  pub id: String,
  pub phase: Phase,
  pub roster: Vec<AgentAssignment>,
  pub status: TeamStatus,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub reruns: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub confidence: Option<f64>,
  #[serde(default)]
  pub degraded: bool,
  #[serde(default)]
  pub recovery: RecoveryMeta,
}

impl SubTeam {
  #[must_use]
  pub fn roles(&self) -> Vec<String> {
    self.roster.iter().map(|a| a.role.clone()).collect()
  }

  #[must_use]
  pub fn is_active(&self) -> bool {
    !matches!(self.status, TeamStatus::Complete | TeamStatus::TornDown)
  }
}

/// Root document persisted in `.overseer/state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
  pub project_id: String,
  pub request: String,
  pub mode: Mode,
  pub phase: Phase,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sub_phase: Option<SubPhase>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub healing_from: Option<Phase>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub agents: Vec<String>,
  #[serde(default)]
  pub findings: Vec<Finding>,
  #[serde(default)]
  pub healing_attempts: u32,
  #[serde(default)]
  pub circuit_breakers: CircuitBreakers,
  #[serde(default)]
  pub sub_teams: BTreeMap<String, SubTeam>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub active_team: Option<String>,
  #[serde(default)]
  pub confirmations: BTreeSet<SubPhase>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub abort_reason: Option<String>,
  #[serde(default)]
  pub revision: u64,
  #[serde(default)]
  pub orchestrator_version: String,
}

impl ProjectState {
  #[must_use]
  pub fn new(request: &str, mode: Mode, now: DateTime<Utc>) -> Self {
    let project_id = format!("{}-{}", slugify(request), now.format("%Y%m%d%H%M%S"));
    Self {
      project_id,
      request: request.trim().to_string(),
      mode,
      phase: Phase::Init,
      sub_phase: None,
      healing_from: None,
      created_at: now,
      updated_at: now,
      agents: Vec::new(),
      findings: Vec::new(),
      healing_attempts: 0,
      circuit_breakers: CircuitBreakers::default(),
      sub_teams: BTreeMap::new(),
      active_team: None,
      confirmations: BTreeSet::new(),
      abort_reason: None,
      revision: 0,
      orchestrator_version: crate::VERSION.to_string(),
    }
  }

  #[must_use]
  pub fn active_team(&self) -> Option<&SubTeam> {
    self
      .active_team
      .as_ref()
      .and_then(|id| self.sub_teams.get(id))
  }

  pub fn active_team_mut(&mut self) -> Option<&mut SubTeam> {
    let id = self.active_team.clone()?;
    self.sub_teams.get_mut(&id)
  }

  /// Most recent team of `phase` whose outputs were collected and accepted.
  /// Acceptance is marked by the recorded confidence; torn down teams count.
  #[must_use]
  pub fn completed_team_for(&self, phase: Phase) -> Option<&SubTeam> {
    self
      .sub_teams
      .values()
      .filter(|t| {
        t.phase == phase
          && t.confidence.is_some()
          && matches!(t.status, TeamStatus::Complete | TeamStatus::TornDown)
      })
      .max_by_key(|t| t.created_at)
  }

  pub fn assign_agents<I: IntoIterator<Item = String>>(&mut self, roles: I) {
    for role in roles {
      if !self.agents.contains(&role) {
        self.agents.push(role);
      }
    }
  }

  #[must_use]
  pub fn findings_by_priority(&self) -> BTreeMap<Priority, Vec<&Finding>> {
    let mut out: BTreeMap<Priority, Vec<&Finding>> = BTreeMap::new();
    for finding in &self.findings {
      out.entry(finding.priority).or_default().push(finding);
    }
    out
  }

  /// Phase whose work is currently under way (the origin while healing).
  #[must_use]
  pub fn working_phase(&self) -> Phase {
    if self.phase == Phase::Healing {
      self.healing_from.unwrap_or(Phase::Executing)
    } else {
      self.phase
    }
  }
}

/// Lowercase, dash-separated identifier built from the first words of `text`.
#[must_use]
pub fn slugify(text: &str) -> String {
  let mut out = String::new();
  for ch in text.to_lowercase().chars() {
    if ch.is_ascii_alphanumeric() {
      out.push(ch);
    } else if !out.ends_with('-') {
      out.push('-');
    }
    if out.len() >= 32 {
      break;
    }
  }
  let trimmed = out.trim_matches('-');
  if trimmed.is_empty() {
    "project".to_string()
  } else {
    trimmed.to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn new_project_starts_at_init() {
    let now = Utc::now();
    let state = ProjectState::new("  Add OAuth login to the API!  ", Mode::Coding, now);
    assert_eq!(state.phase, Phase::Init);
    assert_eq!(state.request, "Add OAuth login to the API!");
    assert!(state.project_id.starts_with("add-oauth-login-to-the-api-"));
    assert_eq!(state.circuit_breakers, CircuitBreakers::default());
    assert_eq!(state.revision, 0);
  }

  #[test]
  fn slugify_falls_back_for_symbols_only() {
    assert_eq!(slugify("!!!"), "project");
    assert_eq!(slugify("Fix   bug #12"), "fix-bug-12");
  }

  #[test]
  fn priorities_accept_p_aliases() {
    let p: Priority = serde_json::from_str("\"p0\"").unwrap();
    assert_eq!(p, Priority::Critical);
    let p: Priority = serde_json::from_str("\"medium\"").unwrap();
    assert_eq!(p, Priority::Medium);
  }

  #[test]
  fn agents_are_deduplicated_in_order() {
    let mut state = ProjectState::new("x", Mode::Work, Utc::now());
    state.assign_agents(["planner".to_string(), "coder".to_string()]);
    state.assign_agents(["coder".to_string(), "verifier".to_string()]);
    assert_eq!(state.agents, vec!["planner", "coder", "verifier"]);
  }

  #[test]
  fn repeated_error_trip_is_soft() {
    let soft = TripReason::RepeatedError {
      signature: "e".into(),
      count: 3,
      limit: 3,
    };
    assert!(!soft.is_hard());
    assert!(TripReason::TokenCeiling { used: 2, limit: 1 }.is_hard());
  }
}
