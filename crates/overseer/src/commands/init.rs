use anyhow::Result;

use crate::config::AppContext;
use crate::domain::Mode;
use crate::orchestrator::Orchestrator;
use crate::utils::log::t;
use crate::{log_info, log_success};

pub fn run(ctx: &AppContext, request: &[String], mode: Option<Mode>, force: bool) -> Result<()> {
  let request = request.join(" ");
  let orchestrator = Orchestrator::new(ctx)?;
  let state = orchestrator.init(&request, mode, force)?;
  log_success!(
    "Created project {} ({} mode)",
    t::role(&state.project_id),
    state.mode
  );
  log_info!("State lives in {}", t::path(".overseer/state.json"));
  log_info!("Run {} to start planning.", t::path("overseer next"));
  Ok(())
}
