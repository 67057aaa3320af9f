use anyhow::Result;

use crate::commands::finish_step;
use crate::config::AppContext;
use crate::orchestrator::Orchestrator;

pub fn run(ctx: &AppContext, confirm: bool) -> Result<()> {
  let step = Orchestrator::new(ctx)?.next(confirm)?;
  finish_step(&step)
}
