use std::fmt;
use std::io::{self, IsTerminal as _, Read, Write};

use anyhow::{Context, Result, anyhow};
use inquire::{Confirm, Select};
use owo_colors::OwoColorize as _;

use crate::{log_info, log_warn};

/// Choice item that renders nicely in interactive lists while retaining an
/// associated value.
#[derive(Clone, Debug)]
pub struct Choice {
  pub value: String,
  pub label: String,
  pub detail: Option<String>,
}

impl fmt::Display for Choice {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.detail {
      Some(detail) => write!(f, "{} {}", self.label.cyan().bold(), detail.dimmed()),
      None => write!(f, "{}", self.label.cyan().bold()),
    }
  }
}

/// Prompts backed by `inquire` on a TTY and by plain line input otherwise
/// (tests, piped stdin). Closed stdin yields the default.
#[derive(Clone, Debug)]
pub struct Wizard {
  is_tty: bool,
}

impl Default for Wizard {
  fn default() -> Self {
    Self::new()
  }
}

impl Wizard {
  #[must_use]
  pub fn new() -> Self {
    Self {
      is_tty: io::stdin().is_terminal() && io::stdout().is_terminal(),
    }
  }

  pub fn select(
    &self,
    prompt: &str,
    options: &[Choice],
    default_value: Option<&str>,
  ) -> Result<String> {
    if options.is_empty() {
      anyhow::bail!("cannot prompt for selection without any options");
    }
    let default_idx = default_value
      .and_then(|value| options.iter().position(|opt| opt.value == value))
      .unwrap_or(0);
    if self.is_tty {
      return Select::new(prompt, options.to_vec())
        .with_starting_cursor(default_idx)
        .prompt()
        .map(|choice| choice.value)
        .map_err(|err| anyhow!(err));
    }
    Self::fallback_select(prompt, options, default_idx)
  }

  pub fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
    if self.is_tty {
      return Confirm::new(prompt)
        .with_default(default)
        .prompt()
        .map_err(|err| anyhow!(err));
    }
    Self::fallback_confirm(prompt, default)
  }

  fn fallback_select(prompt: &str, options: &[Choice], default_idx: usize) -> Result<String> {
    log_info!("{}", prompt);
    for (idx, opt) in options.iter().enumerate() {
      match &opt.detail {
        Some(detail) => log_info!("  {}. {} {}", idx + 1, opt.label, detail),
        None => log_info!("  {}. {}", idx + 1, opt.label),
      }
    }
    log_info!("  (Press Enter to keep {})", options[default_idx].label);
    prompt_arrow();

    let input = read_line()?;
    let trimmed = input.trim();
    if trimmed.is_empty() {
      return Ok(options[default_idx].value.clone());
    }
    if let Ok(idx) = trimmed.parse::<usize>()
      && (1..=options.len()).contains(&idx)
    {
      return Ok(options[idx - 1].value.clone());
    }
    if let Some(found) = options.iter().find(|opt| {
      opt.value.eq_ignore_ascii_case(trimmed) || opt.label.eq_ignore_ascii_case(trimmed)
    }) {
      return Ok(found.value.clone());
    }
    log_warn!("Invalid selection: {}", trimmed);
    anyhow::bail!("invalid selection")
  }

  fn fallback_confirm(prompt: &str, default: bool) -> Result<bool> {
    let suffix = if default { "[Y/n]" } else { "[y/N]" };
    log_info!("{} {}", prompt, suffix);
    prompt_arrow();

    let input = read_line()?;
    Ok(parse_yes(&input, default))
  }
}

fn prompt_arrow() {
  anstream::print!("{}", "-> ".bright_cyan());
  io::stdout().flush().ok();
}

fn parse_yes(input: &str, default: bool) -> bool {
  match input.trim().chars().next() {
    None => default,
    Some(first) => matches!(first, 'y' | 'Y'),
  }
}

fn read_line() -> Result<String> {
  let mut target = String::new();
  let mut stdin = io::stdin().lock();
  loop {
    let mut buf = [0u8; 1];
    match stdin.read(&mut buf) {
      Ok(0) => break,
      Ok(_) => {
        let ch = buf[0] as char;
        if ch == '\n' || ch == '\r' {
          break;
        }
        target.push(ch);
        if target.len() > 200 {
          break;
        }
      }
      Err(err) => {
        return Err(err).context("failed to read from stdin");
      }
    }
  }
  Ok(target)
}
