use anyhow::Result;

use crate::config::AppContext;
use crate::orchestrator::{Blocked, Orchestrator};
use crate::utils::log::t;
use crate::utils::term::print_table;
use crate::{log_info, log_success, log_warn};

pub fn run(ctx: &AppContext) -> Result<()> {
  let outcome = Orchestrator::new(ctx)?.sweep()?;
  let report = &outcome.report;
  if report.is_empty() {
    log_info!("No registered processes need attention.");
    return Ok(());
  }

  let mut rows = Vec::new();
  for kill in &report.killed {
    rows.push(vec![t::pid(kill.pid), t::err("killed"), kill.reason.clone()]);
  }
  for (pid, reason) in &report.flagged {
    rows.push(vec![t::pid(pid), t::warn("flagged"), reason.clone()]);
  }
  for pid in &report.reaped {
    rows.push(vec![t::pid(pid), "reaped".to_string(), "exited".to_string()]);
  }
  for (pid, reason) in &report.skipped {
    rows.push(vec![t::pid(pid), "skipped".to_string(), reason.clone()]);
  }
  print_table(&["PID", "ACTION", "REASON"], &rows);

  if !report.killed.is_empty() {
    log_success!(
      "Killed {} orphaned processes (see {})",
      report.killed.len(),
      t::path(".overseer/kills.log")
    );
  }
  if !report.flagged.is_empty() {
    log_warn!(
      "{} processes look orphaned; they are killed if the next sweep sees them again",
      report.flagged.len()
    );
  }
  if let Some(reason) = outcome.aborted {
    return Err(Blocked::new(format!("project aborted: {reason}")).into());
  }
  Ok(())
}
