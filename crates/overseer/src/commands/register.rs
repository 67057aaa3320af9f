use anyhow::Result;

use crate::config::AppContext;
use crate::monitor::ProcessKind;
use crate::orchestrator::Orchestrator;
use crate::utils::log::t;
use crate::{log_success, log_warn};

pub fn run(ctx: &AppContext, pid: u32, kind: ProcessKind, role: Option<String>) -> Result<()> {
  let entry = Orchestrator::new(ctx)?.register(pid, kind, role)?;
  log_success!(
    "Registered {} for {} ({})",
    t::pid(entry.pid),
    entry.project_id,
    t::phase(entry.phase)
  );
  Ok(())
}

pub fn run_unregister(ctx: &AppContext, pid: u32) -> Result<()> {
  if Orchestrator::new(ctx)?.unregister(pid)? {
    log_success!("Unregistered {}", t::pid(pid));
  } else {
    log_warn!("{} was not registered", t::pid(pid));
  }
  Ok(())
}
