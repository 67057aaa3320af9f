use std::io::Read as _;
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::commands::finish_step;
use crate::config::AppContext;
use crate::orchestrator::Orchestrator;

fn error_text(error: Option<&str>, from_file: Option<&Path>) -> Result<String> {
  if let Some(text) = error {
    return Ok(text.to_string());
  }
  if let Some(path) = from_file {
    return std::fs::read_to_string(path)
      .with_context(|| format!("failed to read {}", path.display()));
  }
  let mut buf = String::new();
  std::io::stdin()
    .read_to_string(&mut buf)
    .context("failed to read error text from stdin")?;
  Ok(buf)
}

pub fn run(ctx: &AppContext, error: Option<&str>, from_file: Option<&Path>) -> Result<()> {
  let text = error_text(error, from_file)?;
  if text.trim().is_empty() {
    bail!("no error text; pass --error, --from-file or pipe it on stdin");
  }
  let step = Orchestrator::new(ctx)?.heal(&text)?;
  finish_step(&step)
}
