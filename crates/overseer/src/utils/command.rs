use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
  pub program: String,
  pub args: Vec<String>,
  pub cwd: PathBuf,
  pub env: Vec<(String, String)>,
}

impl Command {
  /// Construct from argv-like vector: first element is the program, rest are args.
  pub fn new(argv: &[String]) -> Result<Self> {
    let Some((program, args)) = argv.split_first() else {
      bail!("command is empty");
    };
    if program.trim().is_empty() {
      bail!("command program is empty");
    }
    let cwd = std::env::current_dir()?;
    Ok(Self {
      program: program.clone(),
      args: args.to_vec(),
      cwd,
      env: Vec::new(),
    })
  }

  #[must_use]
  pub fn in_dir(mut self, cwd: &Path) -> Self {
    self.cwd = cwd.to_path_buf();
    self
  }

  #[must_use]
  pub fn with_env(mut self, key: &str, value: impl Into<String>) -> Self {
    self.env.push((key.to_string(), value.into()));
    self
  }

  /// Start the command detached from our stdio. Agent output belongs in its
  /// result file, not in our terminal.
  pub fn spawn_detached(&self) -> Result<Child> {
    let mut cmd = std::process::Command::new(&self.program);
    cmd
      .current_dir(&self.cwd)
      .args(&self.args)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null());
    for (key, value) in &self.env {
      cmd.env(key, value);
    }
    cmd
      .spawn()
      .with_context(|| format!("failed to spawn {}", self.program))
  }
}

/// Expand "$VAR" references in argv using the given env map. Does not support ${} forms.
/// Unknown variables expand to nothing.
#[must_use]
pub fn expand_vars_in_argv(argv: &[String], env: &HashMap<String, String>) -> Vec<String> {
  argv.iter().map(|s| expand_vars(s, env)).collect()
}

fn expand_vars(s: &str, env: &HashMap<String, String>) -> String {
  let mut out = String::with_capacity(s.len());
  let mut rest = s;
  while let Some(pos) = rest.find('$') {
    out.push_str(&rest[..pos]);
    let after = &rest[pos + 1..];
    let name_len = after
      .char_indices()
      .take_while(|(i, c)| c.is_ascii_alphabetic() || *c == '_' || (*i > 0 && c.is_ascii_digit()))
      .count();
    if name_len == 0 {
      out.push('$');
      rest = after;
      continue;
    }
    if let Some(val) = env.get(&after[..name_len]) {
      out.push_str(val);
    }
    rest = &after[name_len..];
  }
  out.push_str(rest);
  out
}
