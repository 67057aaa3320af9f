use std::io::Read as _;

use anyhow::{Context, Result};

use crate::config::AppContext;
use crate::hooks::{AgentEnv, HookKind, run_hook};
use crate::log_warn;

pub fn run(ctx: &AppContext, kind: HookKind) -> Result<()> {
  let mut raw = String::new();
  std::io::stdin()
    .read_to_string(&mut raw)
    .context("failed to read hook input from stdin")?;
  let verdict = run_hook(ctx, kind, &raw, &AgentEnv::from_env())?;
  for warning in &verdict.warnings {
    log_warn!("overseer: {}", warning);
  }
  let doc = serde_json::to_string(&verdict.decision).context("failed to encode hook decision")?;
  anstream::println!("{doc}");
  Ok(())
}
