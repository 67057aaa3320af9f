#![allow(dead_code)]
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use assert_cmd::Command;
use temp_env::with_vars;
use tempfile::TempDir;

/// A throwaway project directory with its own XDG config home.
#[derive(Debug)]
pub struct TestEnv {
  temp: TempDir,
  xdg_home: TempDir,
}

impl TestEnv {
  pub fn run<F, R>(f: F) -> R
  where
    F: FnOnce(&TestEnv) -> R,
  {
    let env = TestEnv::new();
    with_vars(
      [
        (
          "XDG_CONFIG_HOME",
          Some(env.xdg_home_dir().display().to_string()),
        ),
        ("OVERSEER_AGENT_CMD", None),
        ("OVERSEER_OUTPUT", None),
        ("OVERSEER_ROLE", None),
      ],
      || f(&env),
    )
  }

  pub fn new() -> Self {
    Self {
      temp: tempfile::Builder::new()
        .prefix("overseer-test-")
        .tempdir()
        .expect("temp dir"),
      xdg_home: tempfile::Builder::new()
        .prefix("overseer-xdg-")
        .tempdir()
        .expect("xdg dir"),
    }
  }

  pub fn path(&self) -> &Path {
    self.temp.path()
  }

  pub fn xdg_home_dir(&self) -> &Path {
    self.xdg_home.path()
  }

  pub fn overseer(&self) -> Result<Command> {
    let mut cmd = Command::cargo_bin("overseer")?;
    cmd.current_dir(self.path());
    Ok(cmd)
  }

  /// `overseer status --json`, parsed.
  pub fn status(&self) -> Result<serde_json::Value> {
    let out = self.overseer()?.args(["status", "--json"]).output()?;
    anyhow::ensure!(
      out.status.success(),
      "status failed: {}",
      String::from_utf8_lossy(&out.stderr)
    );
    serde_json::from_slice(&out.stdout).context("status is not JSON")
  }

  /// Result file of `role` in the active team.
  pub fn result_path(&self, role: &str) -> Result<PathBuf> {
    let status = self.status()?;
    let team = &status["team"];
    let id = team["id"].as_str().context("no active team")?;
    let phase = team["phase"].as_str().context("team without phase")?;
    Ok(
      self
        .path()
        .join(".overseer/phases")
        .join(phase)
        .join(id)
        .join(format!("{role}.result.json")),
    )
  }

  /// Write `body` as the result of `role` in the active team.
  pub fn report(&self, role: &str, body: &str) -> Result<()> {
    let path = self.result_path(role)?;
    std::fs::write(&path, body).with_context(|| format!("write {}", path.display()))
  }

  pub fn phase(&self) -> Result<String> {
    let status = self.status()?;
    Ok(status["phase"].as_str().unwrap_or_default().to_string())
  }

  /// Run `next` (optionally confirmed) and require success.
  pub fn next(&self, confirm: bool) -> Result<()> {
    let mut cmd = self.overseer()?;
    cmd.arg("next");
    if confirm {
      cmd.arg("--confirm");
    }
    cmd.assert().success();
    Ok(())
  }

  /// Init a coding project and walk it to the executing phase.
  pub fn start_executing(&self) -> Result<()> {
    self
      .overseer()?
      .args(["init", "--mode", "coding", "add a health endpoint"])
      .assert()
      .success();
    self.next(false)?;
    self.next(true)?;
    self.report("planner", r#"{"status":"success","summary":"plan ready"}"#)?;
    self.next(false)?;
    self.next(true)?;
    anyhow::ensure!(self.phase()? == "executing", "not executing");
    Ok(())
  }
}
