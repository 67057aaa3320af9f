use anyhow::Result;

use crate::orchestrator::{Blocked, Step, StepOutcome};
use crate::utils::log::t;
use crate::{log_info, log_success};

pub mod config;
pub mod heal;
pub mod hook;
pub mod init;
pub mod next;
pub mod register;
pub mod status;
pub mod sweep;

/// Print a step's report. A blocking outcome becomes a [`Blocked`] error.
pub(crate) fn finish_step(step: &Step) -> Result<()> {
  for line in &step.report {
    log_info!("{}", line);
  }
  let state = &step.state;
  let position = match state.sub_phase {
    Some(sub) => format!("{}/{}", state.phase, sub),
    None => state.phase.to_string(),
  };
  match &step.outcome {
    StepOutcome::Advanced => log_success!("Now at {}", t::phase(position)),
    StepOutcome::Waiting | StepOutcome::Done => {}
    StepOutcome::Blocked(reason) => return Err(Blocked::new(reason.clone()).into()),
  }
  Ok(())
}
