use crate::breaker;
use crate::config::Limits;
use crate::domain::{Phase, ProjectState, SubPhase};
use crate::watchdog::Watchdog;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
  #[error("project is {0}; no further transitions are possible")]
  Terminal(Phase),
  #[error("circuit breaker tripped: {0}")]
  BreakerTripped(String),
  #[error("cannot move from {from} to {to}")]
  OutOfOrder { from: String, to: String },
  #[error("cannot move from {from} to {to}: sub-phases must be visited in order")]
  SkippedSubPhase { from: String, to: String },
  #[error("sub-phase {sub_phase} does not belong to {phase}")]
  ForeignSubPhase { phase: Phase, sub_phase: String },
  #[error("cannot enter {target}: {}", reasons.join("; "))]
  Preconditions { target: Phase, reasons: Vec<String> },
}

fn describe(phase: Phase, sub_phase: Option<SubPhase>) -> String {
  match sub_phase {
    Some(sub) => format!("{phase}/{sub}"),
    None => phase.to_string(),
  }
}

/// Validates transitions of the phase graph.
pub struct PhaseMachine<'a> {
  watchdog: &'a Watchdog,
  limits: &'a Limits,
}

impl<'a> PhaseMachine<'a> {
  #[must_use]
  pub fn new(watchdog: &'a Watchdog, limits: &'a Limits) -> Self {
    Self { watchdog, limits }
  }

  /// Check that `state` may move to `(phase, sub_phase)`.
  ///
  /// Allowed moves: the next sub-phase of the current phase, the first step
  /// of the successor phase, a detour into healing from executing or
  /// verifying (keeping the sub-phase), the return from healing to its
  /// origin, and aborting from any non-terminal phase.
  pub fn validate_transition(
    &self,
    state: &ProjectState,
    phase: Phase,
    sub_phase: Option<SubPhase>,
  ) -> Result<(), TransitionError> {
    let from = state.phase;
    if from.is_terminal() {
      return Err(TransitionError::Terminal(from));
    }
    if phase == Phase::Aborted {
      return Ok(());
    }
    let check = breaker::check(state, self.limits);
    if check.hard {
      let reason = check
        .reason
        .map_or_else(|| "limit exceeded".to_string(), |r| r.to_string());
      return Err(TransitionError::BreakerTripped(reason));
    }

    let owner = if phase == Phase::Healing {
      state.working_phase()
    } else {
      phase
    };
    match sub_phase {
      Some(sub) if sub.phase() != owner => {
        return Err(TransitionError::ForeignSubPhase {
          phase,
          sub_phase: sub.to_string(),
        });
      }
      None if !owner.sub_phases().is_empty() => {
        return Err(TransitionError::SkippedSubPhase {
          from: describe(from, state.sub_phase),
          to: phase.to_string(),
        });
      }
      _ => {}
    }

    let out_of_order = || TransitionError::OutOfOrder {
      from: describe(from, state.sub_phase),
      to: describe(phase, sub_phase),
    };
    let skipped = || TransitionError::SkippedSubPhase {
      from: describe(from, state.sub_phase),
      to: describe(phase, sub_phase),
    };

    if from == Phase::Healing {
      // Only the way back to the origin, at the step it left.
      if Some(phase) != state.healing_from || sub_phase != state.sub_phase {
        return Err(out_of_order());
      }
    } else if phase == Phase::Healing {
      if !from.can_heal() {
        return Err(out_of_order());
      }
      if sub_phase != state.sub_phase {
        return Err(skipped());
      }
    } else if phase == from {
      let current = state.sub_phase.map(SubPhase::index);
      let target = sub_phase.map(SubPhase::index);
      match (current, target) {
        (Some(c), Some(t)) if t == c + 1 => {}
        _ => return Err(skipped()),
      }
    } else if from.successor() == Some(phase) {
      if let Some(last) = from.sub_phases().last()
        && state.sub_phase != Some(*last)
      {
        return Err(skipped());
      }
      if sub_phase != phase.sub_phases().first().copied() {
        return Err(skipped());
      }
    } else {
      return Err(out_of_order());
    }

    // The way back from healing was validated on the way in.
    if phase != from && from != Phase::Healing {
      self
        .watchdog
        .check_phase_preconditions(state, phase)
        .map_err(|reasons| TransitionError::Preconditions {
          target: phase,
          reasons,
        })?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{OverseerPaths, Timeouts};
  use crate::domain::{Mode, TripReason};
  use crate::utils::clock::system_clock;
  use chrono::Utc;

  fn fixture() -> (tempfile::TempDir, Watchdog, Limits) {
    let dir = tempfile::tempdir().unwrap();
    let watchdog = Watchdog::new(
      OverseerPaths::new(dir.path()),
      system_clock(),
      Timeouts::default(),
    );
    (dir, watchdog, Limits::default())
  }

  fn at(phase: Phase, sub: Option<SubPhase>) -> ProjectState {
    let mut state = ProjectState::new("req", Mode::Coding, Utc::now());
    state.phase = phase;
    state.sub_phase = sub;
    state
  }

  #[test]
  fn init_enters_planning_at_the_first_step() {
    let (_dir, wd, limits) = fixture();
    let machine = PhaseMachine::new(&wd, &limits);
    let state = at(Phase::Init, None);
    assert!(
      machine
        .validate_transition(&state, Phase::Planning, Some(SubPhase::TemplateConfirm))
        .is_ok()
    );
    assert!(matches!(
      machine.validate_transition(&state, Phase::Planning, Some(SubPhase::PlanReview)),
      Err(TransitionError::SkippedSubPhase { .. })
    ));
    assert!(matches!(
      machine.validate_transition(&state, Phase::Executing, Some(SubPhase::ExecutionDispatchWait)),
      Err(TransitionError::OutOfOrder { .. })
    ));
  }

  #[test]
  fn sub_phases_advance_one_at_a_time() {
    let (_dir, wd, limits) = fixture();
    let machine = PhaseMachine::new(&wd, &limits);
    let state = at(Phase::Planning, Some(SubPhase::TemplateConfirm));
    assert!(
      machine
        .validate_transition(&state, Phase::Planning, Some(SubPhase::PlanDispatchWait))
        .is_ok()
    );
    assert!(
      machine
        .validate_transition(&state, Phase::Planning, Some(SubPhase::PlanReview))
        .is_err()
    );
    assert!(matches!(
      machine.validate_transition(&state, Phase::Planning, Some(SubPhase::VerifyWait)),
      Err(TransitionError::ForeignSubPhase { .. })
    ));
    let back = at(Phase::Planning, Some(SubPhase::PlanReview));
    assert!(
      machine
        .validate_transition(&back, Phase::Planning, Some(SubPhase::TemplateConfirm))
        .is_err()
    );
  }

  #[test]
  fn leaving_a_phase_requires_its_last_step_and_preconditions() {
    let (_dir, wd, limits) = fixture();
    let machine = PhaseMachine::new(&wd, &limits);
    let early = at(Phase::Planning, Some(SubPhase::PlanDispatchWait));
    assert!(matches!(
      machine.validate_transition(&early, Phase::Executing, Some(SubPhase::ExecutionDispatchWait)),
      Err(TransitionError::SkippedSubPhase { .. })
    ));
    let review = at(Phase::Planning, Some(SubPhase::PlanReview));
    assert!(matches!(
      machine.validate_transition(&review, Phase::Executing, Some(SubPhase::ExecutionDispatchWait)),
      Err(TransitionError::Preconditions { target: Phase::Executing, .. })
    ));
  }

  #[test]
  fn healing_detours_and_returns_to_its_origin() {
    let (_dir, wd, limits) = fixture();
    let machine = PhaseMachine::new(&wd, &limits);
    let exec = at(Phase::Executing, Some(SubPhase::ExecutionDispatchWait));
    assert!(
      machine
        .validate_transition(&exec, Phase::Healing, Some(SubPhase::ExecutionDispatchWait))
        .is_ok()
    );
    let planning = at(Phase::Planning, Some(SubPhase::PlanDispatchWait));
    assert!(
      machine
        .validate_transition(&planning, Phase::Healing, Some(SubPhase::PlanDispatchWait))
        .is_err()
    );

    let mut healing = at(Phase::Healing, Some(SubPhase::ExecutionDispatchWait));
    healing.healing_from = Some(Phase::Executing);
    assert!(
      machine
        .validate_transition(&healing, Phase::Executing, Some(SubPhase::ExecutionDispatchWait))
        .is_ok()
    );
    assert!(
      machine
        .validate_transition(&healing, Phase::Verifying, Some(SubPhase::VerifyWait))
        .is_err()
    );
  }

  #[test]
  fn tripped_breaker_blocks_everything_but_abort() {
    let (_dir, wd, limits) = fixture();
    let machine = PhaseMachine::new(&wd, &limits);
    let mut state = at(Phase::Planning, Some(SubPhase::TemplateConfirm));
    state.circuit_breakers.tripped = Some(TripReason::CostCeiling {
      used: 60.0,
      limit: 50.0,
    });
    assert!(matches!(
      machine.validate_transition(&state, Phase::Planning, Some(SubPhase::PlanDispatchWait)),
      Err(TransitionError::BreakerTripped(_))
    ));
    assert!(machine.validate_transition(&state, Phase::Aborted, None).is_ok());

    let done = at(Phase::Aborted, None);
    assert_eq!(
      machine.validate_transition(&done, Phase::Planning, Some(SubPhase::TemplateConfirm)),
      Err(TransitionError::Terminal(Phase::Aborted))
    );
  }
}
