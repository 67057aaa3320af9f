use anyhow::{Context, Result};

use crate::config::AppContext;
use crate::orchestrator::{Orchestrator, StatusSummary};
use crate::utils::log::t;
use crate::utils::term::{print_table, usage_bar};
use crate::{log_info, log_warn};

const BAR_WIDTH: usize = 20;

fn ratio(used: f64, limit: f64) -> f64 {
  if limit > 0.0 { used / limit } else { 0.0 }
}

pub fn run(ctx: &AppContext, json: bool) -> Result<()> {
  let summary = Orchestrator::new(ctx)?.status()?;
  if json {
    // An object either way, so callers can tell "no project" from bad output.
    let doc = match &summary {
      Some(summary) => serde_json::to_string_pretty(summary),
      None => serde_json::to_string_pretty(&serde_json::json!({ "project": null })),
    }
    .context("failed to encode status")?;
    anstream::println!("{doc}");
    return Ok(());
  }
  let Some(summary) = summary else {
    log_info!("No project here. Start one with {}.", t::path("overseer init <request>"));
    return Ok(());
  };
  print_human(&summary);
  Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn print_human(s: &StatusSummary) {
  log_info!("Project:  {} ({} mode, revision {})", t::role(&s.project_id), s.mode, s.revision);
  log_info!("Request:  {}", s.request);
  let mut phase = t::phase(s.phase);
  if let Some(sub) = s.sub_phase {
    phase.push_str(&format!(" / {sub}"));
  }
  if let Some(origin) = s.healing_from {
    phase.push_str(&format!(" (healing {origin})"));
  }
  log_info!("Phase:    {}", phase);
  if !s.agents.is_empty() {
    log_info!("Agents:   {}", s.agents.join(", "));
  }
  if let Some(reason) = &s.abort_reason {
    log_info!("Aborted:  {}", t::err(reason));
  }

  let b = &s.breaker;
  log_info!("");
  log_info!("Budget");
  log_info!(
    "  tokens   {} {}/{}",
    usage_bar(ratio(b.tokens_used as f64, b.max_tokens as f64), BAR_WIDTH),
    b.tokens_used,
    b.max_tokens
  );
  log_info!(
    "  cost     {} ${:.2}/${:.2}",
    usage_bar(ratio(b.cost_usd, b.max_cost_usd), BAR_WIDTH),
    b.cost_usd,
    b.max_cost_usd
  );
  log_info!(
    "  healing  {} {}/{}",
    usage_bar(
      ratio(f64::from(b.healing_attempts), f64::from(b.max_total_heal_attempts)),
      BAR_WIDTH
    ),
    b.healing_attempts,
    b.max_total_heal_attempts
  );
  if let Some(trip) = &b.tripped {
    log_info!("  breaker  {}", t::err(format!("tripped: {trip}")));
  }

  if let Some(team) = &s.team {
    log_info!("");
    let mut header = format!("Team {} ({}, {}s old", t::role(&team.id), team.status, team.age_secs);
    if team.reruns > 0 {
      header.push_str(&format!(", {} reruns", team.reruns));
    }
    if let Some(confidence) = team.confidence {
      header.push_str(&format!(", confidence {confidence:.2}"));
    }
    if team.degraded {
      header.push_str(", degraded");
    }
    header.push(')');
    log_info!("{}", header);
    let mut rows = Vec::new();
    for role in &team.reported {
      rows.push(vec![t::role(role), t::ok("reported"), String::new()]);
    }
    for role in &team.pending {
      let finding = team.health.iter().find(|f| &f.subject == role);
      let (status, detail) = match finding {
        Some(f) => (t::warn(&f.status), f.detail.clone()),
        None => ("pending".to_string(), String::new()),
      };
      rows.push(vec![t::role(role), status, detail]);
    }
    print_table(&["ROLE", "STATUS", "DETAIL"], &rows);
  }

  if !s.findings.is_empty() {
    log_info!("");
    log_info!("Findings");
    for (label, items) in &s.findings {
      for item in items {
        log_info!("  {} {}", t::warn(label), item);
      }
    }
  }

  if s.kills > 0 {
    log_info!("");
    log_info!("Killed processes: {}", s.kills);
  }

  if !s.recent_events.is_empty() {
    log_info!("");
    log_info!("Recent events");
    for event in &s.recent_events {
      log_info!("  {}", event);
    }
  }

  for issue in &s.integrity {
    log_warn!("Integrity: {}", issue);
  }
  log_info!("");
  log_info!("Next: {}", s.next_action);
}
