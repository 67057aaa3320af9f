mod common;

use anyhow::Result;
use predicates::prelude::*;

use crate::common::TestEnv;

#[test]
fn pre_tool_use_blocks_writes_to_the_state_file() -> Result<()> {
  TestEnv::run(|env| -> Result<()> {
    env.overseer()?.args(["init", "build it"]).assert().success();
    env
      .overseer()?
      .args(["hook", "pre-tool-use"])
      .write_stdin(r#"{"tool_name":"Write","tool_input":{"file_path":".overseer/state.json","content":"{}"}}"#)
      .assert()
      .success()
      .stdout(predicate::str::contains(r#""decision":"block""#).from_utf8());

    env
      .overseer()?
      .args(["hook", "pre-tool-use"])
      .write_stdin(r#"{"tool_name":"Write","tool_input":{"file_path":"src/main.rs"}}"#)
      .assert()
      .success()
      .stdout(predicate::str::diff("{\"decision\":\"allow\"}\n").from_utf8());
    Ok(())
  })
}

#[test]
fn hooks_never_touch_the_state() -> Result<()> {
  TestEnv::run(|env| -> Result<()> {
    env.overseer()?.args(["init", "build it"]).assert().success();
    let before = std::fs::read(env.path().join(".overseer/state.json"))?;
    for kind in ["pre-tool-use", "post-tool-use", "stop"] {
      env
        .overseer()?
        .args(["hook", kind])
        .write_stdin("{}")
        .assert()
        .success();
    }
    assert_eq!(std::fs::read(env.path().join(".overseer/state.json"))?, before);
    Ok(())
  })
}

#[test]
fn stop_blocks_until_the_result_is_written() -> Result<()> {
  TestEnv::run(|env| -> Result<()> {
    env
      .overseer()?
      .args(["hook", "stop"])
      .env("OVERSEER_OUTPUT", "out/planner.result.json")
      .write_stdin(r#"{"stop_hook_active":false}"#)
      .assert()
      .success()
      .stdout(predicate::str::contains("write your result").from_utf8());

    std::fs::create_dir_all(env.path().join("out"))?;
    std::fs::write(
      env.path().join("out/planner.result.json"),
      r#"{"status":"partial","errors":["one step left"]}"#,
    )?;
    env
      .overseer()?
      .args(["hook", "stop"])
      .env("OVERSEER_OUTPUT", "out/planner.result.json")
      .write_stdin("{}")
      .assert()
      .success()
      .stdout(predicate::str::contains(r#""decision":"allow""#).from_utf8());
    Ok(())
  })
}

#[test]
fn invalid_hook_input_is_an_error() -> Result<()> {
  TestEnv::run(|env| -> Result<()> {
    env
      .overseer()?
      .args(["hook", "pre-tool-use"])
      .write_stdin("not json")
      .assert()
      .code(1)
      .stderr(predicate::str::contains("not valid JSON").from_utf8());
    Ok(())
  })
}
