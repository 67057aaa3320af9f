use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Coarse pipeline stage of a project.
///
/// The main line is `Init -> Planning -> Executing -> Verifying -> Complete`.
/// `Healing` is a detour entered from `Executing`/`Verifying` that returns to
/// its origin; `Aborted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
  Init,
  Planning,
  Executing,
  Verifying,
  Healing,
  Complete,
  Aborted,
}

/// Finer step inside a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubPhase {
  TemplateConfirm,
  PlanDispatchWait,
  PlanReview,
  ExecutionDispatchWait,
  VerifyWait,
}

const PLANNING_STEPS: &[SubPhase] = &[
  SubPhase::TemplateConfirm,
  SubPhase::PlanDispatchWait,
  SubPhase::PlanReview,
];
const EXECUTING_STEPS: &[SubPhase] = &[SubPhase::ExecutionDispatchWait];
const VERIFYING_STEPS: &[SubPhase] = &[SubPhase::VerifyWait];

impl Phase {
  pub const ALL: [Phase; 7] = [
    Phase::Init,
    Phase::Planning,
    Phase::Executing,
    Phase::Verifying,
    Phase::Healing,
    Phase::Complete,
    Phase::Aborted,
  ];

  #[must_use]
  pub fn as_str(self) -> &'static str {
    match self {
      Phase::Init => "init",
      Phase::Planning => "planning",
      Phase::Executing => "executing",
      Phase::Verifying => "verifying",
      Phase::Healing => "healing",
      Phase::Complete => "complete",
      Phase::Aborted => "aborted",
    }
  }

  #[must_use]
  pub fn is_terminal(self) -> bool {
    matches!(self, Phase::Complete | Phase::Aborted)
  }

  /// Position on the main line. `Healing` and `Aborted` are off the line.
  #[must_use]
  pub fn rank(self) -> Option<u8> {
    match self {
      Phase::Init => Some(0),
      Phase::Planning => Some(1),
      Phase::Executing => Some(2),
      Phase::Verifying => Some(3),
      Phase::Complete => Some(4),
      Phase::Healing | Phase::Aborted => None,
    }
  }

  /// Ordered sub-phases that must all be visited before leaving the phase.
  #[must_use]
  pub fn sub_phases(self) -> &'static [SubPhase] {
    match self {
      Phase::Planning => PLANNING_STEPS,
      Phase::Executing => EXECUTING_STEPS,
      Phase::Verifying => VERIFYING_STEPS,
      _ => &[],
    }
  }

  /// Next phase on the main line.
  #[must_use]
  pub fn successor(self) -> Option<Phase> {
    match self {
      Phase::Init => Some(Phase::Planning),
      Phase::Planning => Some(Phase::Executing),
      Phase::Executing => Some(Phase::Verifying),
      Phase::Verifying => Some(Phase::Complete),
      _ => None,
    }
  }

  /// Whether a failure in this phase may detour into `Healing`.
  #[must_use]
  pub fn can_heal(self) -> bool {
    matches!(self, Phase::Executing | Phase::Verifying)
  }
}

impl SubPhase {
  #[must_use]
  pub fn as_str(self) -> &'static str {
    match self {
      SubPhase::TemplateConfirm => "template_confirm",
      SubPhase::PlanDispatchWait => "plan_dispatch_wait",
      SubPhase::PlanReview => "plan_review",
      SubPhase::ExecutionDispatchWait => "execution_dispatch_wait",
      SubPhase::VerifyWait => "verify_wait",
    }
  }

  #[must_use]
  pub fn phase(self) -> Phase {
    match self {
      SubPhase::TemplateConfirm | SubPhase::PlanDispatchWait | SubPhase::PlanReview => {
        Phase::Planning
      }
      SubPhase::ExecutionDispatchWait => Phase::Executing,
      SubPhase::VerifyWait => Phase::Verifying,
    }
  }

  /// Index inside the owning phase's ordered steps.
  #[must_use]
  pub fn index(self) -> usize {
    self
      .phase()
      .sub_phases()
      .iter()
      .position(|s| *s == self)
      .unwrap_or(0)
  }

  /// Gates that only a human (or calling agent) can open with `next --confirm`.
  #[must_use]
  pub fn needs_confirmation(self) -> bool {
    matches!(self, SubPhase::TemplateConfirm | SubPhase::PlanReview)
  }

  /// Steps that wait on a dispatched sub-team.
  #[must_use]
  pub fn waits_on_team(self) -> bool {
    matches!(
      self,
      SubPhase::PlanDispatchWait | SubPhase::ExecutionDispatchWait | SubPhase::VerifyWait
    )
  }

  #[must_use]
  pub fn next_in_phase(self) -> Option<SubPhase> {
    let steps = self.phase().sub_phases();
    steps.get(self.index() + 1).copied()
  }
}

/// Progress key used to check that `next` never moves backwards:
/// `(phase rank, sub-phase index)`. Healing reports the position of the phase
/// it was entered from.
#[must_use]
pub fn progress_key(
  phase: Phase,
  sub_phase: Option<SubPhase>,
  healing_from: Option<Phase>,
) -> Option<(u8, usize)> {
  let effective = if phase == Phase::Healing {
    healing_from?
  } else {
    phase
  };
  let rank = effective.rank()?;
  Some((rank, sub_phase.map_or(0, SubPhase::index)))
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl fmt::Display for SubPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Phase {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Phase::ALL
      .into_iter()
      .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
      .ok_or_else(|| anyhow::anyhow!("unknown phase: {s}"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn main_line_is_ordered() {
    let mut phase = Phase::Init;
    let mut ranks = vec![phase.rank().unwrap()];
    while let Some(next) = phase.successor() {
      ranks.push(next.rank().unwrap());
      phase = next;
    }
    assert_eq!(phase, Phase::Complete);
    assert_eq!(ranks, vec![0, 1, 2, 3, 4]);
  }

  #[test]
  fn sub_phases_belong_to_their_phase() {
    for phase in Phase::ALL {
      for (idx, sub) in phase.sub_phases().iter().enumerate() {
        assert_eq!(sub.phase(), phase);
        assert_eq!(sub.index(), idx);
      }
    }
    assert_eq!(
      SubPhase::TemplateConfirm.next_in_phase(),
      Some(SubPhase::PlanDispatchWait)
    );
    assert_eq!(SubPhase::PlanReview.next_in_phase(), None);
  }

  #[test]
  fn healing_reports_origin_progress() {
    let key = progress_key(
      Phase::Healing,
      Some(SubPhase::ExecutionDispatchWait),
      Some(Phase::Executing),
    );
    assert_eq!(key, Some((2, 0)));
    assert_eq!(progress_key(Phase::Aborted, None, None), None);
  }

  #[test]
  fn parses_case_insensitively() {
    assert_eq!("Verifying".parse::<Phase>().unwrap(), Phase::Verifying);
    assert!("review".parse::<Phase>().is_err());
  }
}
