mod common;

use anyhow::Result;
use predicates::prelude::*;

use crate::common::TestEnv;

#[test]
fn sweep_without_registry_has_nothing_to_do() -> Result<()> {
  TestEnv::run(|env| -> Result<()> {
    env
      .overseer()?
      .arg("sweep")
      .assert()
      .success()
      .stdout(predicate::str::contains("No registered processes").from_utf8());
    Ok(())
  })
}

#[test]
fn register_requires_a_project() -> Result<()> {
  TestEnv::run(|env| -> Result<()> {
    env
      .overseer()?
      .args(["register", "4242"])
      .assert()
      .code(1)
      .stderr(predicate::str::contains("no project here").from_utf8());
    Ok(())
  })
}

#[test]
fn exited_processes_are_reaped_by_sweep() -> Result<()> {
  TestEnv::run(|env| -> Result<()> {
    env.overseer()?.args(["init", "build it"]).assert().success();
    let mut child = std::process::Command::new("true").spawn()?;
    let pid = child.id();
    child.wait()?;

    env
      .overseer()?
      .args(["register", &pid.to_string(), "--role", "linter"])
      .assert()
      .success()
      .stdout(predicate::str::contains("Registered").from_utf8());
    let registry = std::fs::read_to_string(env.path().join(".overseer/processes.json"))?;
    assert!(registry.contains("linter"), "{registry}");

    env
      .overseer()?
      .arg("sweep")
      .assert()
      .success()
      .stdout(predicate::str::contains("reaped").from_utf8());
    env
      .overseer()?
      .args(["unregister", &pid.to_string()])
      .assert()
      .success()
      .stderr(predicate::str::contains("was not registered").from_utf8());
    Ok(())
  })
}

#[test]
fn live_process_can_be_unregistered() -> Result<()> {
  TestEnv::run(|env| -> Result<()> {
    env.overseer()?.args(["init", "build it"]).assert().success();
    let mut child = std::process::Command::new("sleep").arg("30").spawn()?;
    let pid = child.id().to_string();

    env.overseer()?.args(["register", &pid]).assert().success();
    env
      .overseer()?
      .arg("sweep")
      .assert()
      .success()
      .stdout(predicate::str::contains("No registered processes").from_utf8());
    env
      .overseer()?
      .args(["unregister", &pid])
      .assert()
      .success()
      .stdout(predicate::str::contains("Unregistered").from_utf8());

    child.kill()?;
    child.wait()?;
    Ok(())
  })
}
