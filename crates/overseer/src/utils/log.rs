/// Token styling helpers.
///
/// `t` is short for "tokens": phase names, PIDs, roles and paths are
/// highlighted the same way in every command's output.
pub mod t {
  use std::fmt::Display;

  use owo_colors::OwoColorize as _;

  pub fn phase(value: impl Display) -> String {
    format!("{}", value.to_string().magenta())
  }

  pub fn pid(value: impl Display) -> String {
    format!("{}", value.to_string().blue())
  }

  pub fn path(p: impl Display) -> String {
    format!("{}", p.to_string().cyan())
  }

  pub fn role(value: impl Display) -> String {
    format!("{}", value.to_string().bold())
  }

  pub fn ok(s: impl Display) -> String {
    format!("{}", s.to_string().green())
  }

  pub fn warn(s: impl Display) -> String {
    format!("{}", s.to_string().yellow())
  }

  pub fn err(s: impl Display) -> String {
    format!("{}", s.to_string().red())
  }
}

// User-facing output. info stays neutral, success/warn/error tint the line.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
  Info,
  Success,
  Warn,
  Error,
}

pub(crate) fn emit(level: LogLevel, text: String) {
  // Warnings and errors go to stderr so that `status --json` and hook
  // decisions on stdout stay parseable.
  match level {
    LogLevel::Info | LogLevel::Success => anstream::println!("{}", text),
    LogLevel::Warn | LogLevel::Error => anstream::eprintln!("{}", text),
  }
}

#[macro_export]
macro_rules! log_info {
  ($fmt:literal $(, $args:expr )* $(,)?) => {{
    $crate::utils::log::emit(
      $crate::utils::log::LogLevel::Info,
      format!($fmt $(, $args )*)
    );
  }};
}

#[macro_export]
macro_rules! log_success {
  ($fmt:literal $(, $args:expr )* $(,)?) => {{
    $crate::utils::log::emit(
      $crate::utils::log::LogLevel::Success,
      $crate::utils::log::t::ok(format!($fmt $(, $args )*))
    );
  }};
}

#[macro_export]
macro_rules! log_warn {
  ($fmt:literal $(, $args:expr )* $(,)?) => {{
    $crate::utils::log::emit(
      $crate::utils::log::LogLevel::Warn,
      $crate::utils::log::t::warn(format!($fmt $(, $args )*))
    );
  }};
}

#[macro_export]
macro_rules! log_error {
  ($fmt:literal $(, $args:expr )* $(,)?) => {{
    $crate::utils::log::emit(
      $crate::utils::log::LogLevel::Error,
      $crate::utils::log::t::err(format!($fmt $(, $args )*))
    );
  }};
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tokens_are_tinted() {
    assert!(t::err("aborted").contains("\u{1b}["));
    assert!(t::phase("planning").contains("planning"));
    assert_ne!(t::ok("done"), "done");
  }

  #[test]
  fn macros_print() {
    crate::log_info!("A {}", 1);
    crate::log_success!("B");
    crate::log_warn!("C");
    crate::log_error!("D");
  }
}
