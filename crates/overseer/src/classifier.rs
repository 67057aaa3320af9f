use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::healing::{AttemptOutcome, HealingAttempt};

/// Closed set of failure kinds, in matching order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
  Syntax,
  Type,
  MissingDependency,
  TestFailure,
  Timeout,
  Permission,
  Network,
  Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
  Low,
  Medium,
  High,
  Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
  Retry,
  EscalateModel,
  Abort,
}

impl Category {
  #[must_use]
  pub fn as_str(self) -> &'static str {
    match self {
      Category::Syntax => "syntax",
      Category::Type => "type",
      Category::MissingDependency => "missing_dependency",
      Category::TestFailure => "test_failure",
      Category::Timeout => "timeout",
      Category::Permission => "permission",
      Category::Network => "network",
      Category::Unknown => "unknown",
    }
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Severity::Low => "low",
      Severity::Medium => "medium",
      Severity::High => "high",
      Severity::Critical => "critical",
    })
  }
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Action::Retry => "retry",
      Action::EscalateModel => "escalate_model",
      Action::Abort => "abort",
    })
  }
}

fn rules() -> &'static [(Category, Regex)] {
  static RULES: OnceLock<Vec<(Category, Regex)>> = OnceLock::new();
  RULES.get_or_init(|| {
    [
      (
        Category::Syntax,
        r"syntax ?error|unexpected (token|end of|eof|indent)|parse error|parseerror|unterminated|expected one of|invalid syntax|indentationerror",
      ),
      (
        Category::Type,
        r"type ?error|mismatched types|is not assignable|cannot assign|expected type|has no attribute|is not a function|undefined is not|no method named|cannot be applied to|incompatible types",
      ),
      (
        Category::MissingDependency,
        r"cannot find module|module ?not ?found|no module named|unresolved import|(could not|can't) find crate|package [^ ]+ (is )?not found|command not found|missing dependency|importerror|cannot find package|no matching (package|version)",
      ),
      (
        Category::TestFailure,
        r"tests? failed|failing tests?|assertion ?(error|failed)|assert(_eq|_ne)?!? failed|\d+ failed|panicked at|expected .* (but (got|was|received)|to (equal|be))",
      ),
      (
        Category::Timeout,
        r"timed? ?out|timeout|deadline exceeded|took too long",
      ),
      (
        Category::Permission,
        r"permission denied|eacces|eperm|operation not permitted|access denied|unauthori[sz]ed|forbidden|\b40[13]\b",
      ),
      (
        Category::Network,
        r"econnrefused|econnreset|enotfound|connection (refused|reset|closed|aborted)|network|dns|getaddrinfo|socket hang up|rate limit|\b(429|502|503|504)\b",
      ),
    ]
    .into_iter()
    .map(|(cat, pat)| (cat, Regex::new(pat).expect("valid classifier regex")))
    .collect()
  })
}

/// Classify raw failure text; the first matching category wins.
#[must_use]
pub fn classify(text: &str) -> Category {
  let lowered = text.to_lowercase();
  rules()
    .iter()
    .find(|(_, re)| re.is_match(&lowered))
    .map_or(Category::Unknown, |(cat, _)| *cat)
}

#[must_use]
pub fn severity(category: Category) -> Severity {
  match category {
    Category::Syntax | Category::Network => Severity::Low,
    Category::Type | Category::TestFailure | Category::Timeout => Severity::Medium,
    Category::MissingDependency | Category::Unknown => Severity::High,
    Category::Permission => Severity::Critical,
  }
}

#[must_use]
pub fn action_for_severity(severity: Severity) -> Action {
  match severity {
    Severity::Low | Severity::Medium => Action::Retry,
    Severity::High => Action::EscalateModel,
    Severity::Critical => Action::Abort,
  }
}

#[must_use]
pub fn suggested_fix(category: Category) -> &'static str {
  match category {
    Category::Syntax => {
      "Re-read the reported file around the failing location and fix the malformed construct before changing anything else."
    }
    Category::Type => {
      "Check the declared types at the failing call site and adapt either the value or the signature so they agree."
    }
    Category::MissingDependency => {
      "Install or declare the missing dependency in the project manifest, or correct the import path if it was misspelled."
    }
    Category::TestFailure => {
      "Run the failing tests in isolation, compare expected and actual values and fix the implementation rather than the assertion."
    }
    Category::Timeout => {
      "Reduce the scope of the step, split long-running work, or look for a blocking call that never returns."
    }
    Category::Permission => {
      "A permission boundary was hit. This needs a human to grant access or change the target location."
    }
    Category::Network => {
      "Retry after a short pause; if the service stays unreachable, work offline or stub the remote call."
    }
    Category::Unknown => {
      "Read the full error output, identify the first failing step and address that before anything downstream."
    }
  }
}

/// Attempts made at `signature` since the last time it was resolved.
///
/// Only `pending` and `skipped` records open an attempt. `failed` and
/// `rolled_back` records report on an attempt that is already counted.
#[must_use]
pub fn count_similar(history: &[HealingAttempt], signature: &str) -> usize {
  let mut count = 0;
  for attempt in history.iter().filter(|a| a.signature == signature) {
    match attempt.outcome {
      AttemptOutcome::Resolved => count = 0,
      AttemptOutcome::Pending | AttemptOutcome::Skipped => count += 1,
      AttemptOutcome::Failed | AttemptOutcome::RolledBack => {}
    }
  }
  count
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;

  #[test]
  fn classifies_common_failures() {
    let cases = [
      ("SyntaxError: Unexpected token '}'", Category::Syntax),
      ("error[E0308]: mismatched types", Category::Type),
      ("Error: Cannot find module 'lodash'", Category::MissingDependency),
      ("ModuleNotFoundError: No module named 'requests'", Category::MissingDependency),
      ("test result: FAILED. 3 passed; 2 failed", Category::TestFailure),
      ("thread 'main' panicked at src/lib.rs:4:5", Category::TestFailure),
      ("operation timed out after 30s", Category::Timeout),
      ("EACCES: permission denied, open '/etc/x'", Category::Permission),
      ("connect ECONNREFUSED 127.0.0.1:5432", Category::Network),
      ("something odd happened", Category::Unknown),
    ];
    for (text, expected) in cases {
      assert_eq!(classify(text), expected, "{text}");
    }
  }

  #[test]
  fn first_match_wins() {
    // Mentions both a syntax problem and a timeout.
    assert_eq!(
      classify("parse error in config, then the build timed out"),
      Category::Syntax
    );
  }

  #[test]
  fn severity_maps_to_actions() {
    assert_eq!(action_for_severity(severity(Category::Syntax)), Action::Retry);
    assert_eq!(action_for_severity(severity(Category::TestFailure)), Action::Retry);
    assert_eq!(
      action_for_severity(severity(Category::MissingDependency)),
      Action::EscalateModel
    );
    assert_eq!(action_for_severity(severity(Category::Permission)), Action::Abort);
    assert!(!suggested_fix(Category::Unknown).is_empty());
  }

  fn attempt(sig: &str, outcome: AttemptOutcome) -> HealingAttempt {
    HealingAttempt {
      project_id: "p".to_string(),
      signature: sig.to_string(),
      category: Category::Unknown,
      attempt: 1,
      tier: "small".into(),
      outcome,
      timestamp: Utc::now(),
    }
  }

  #[test]
  fn count_similar_restarts_after_resolution() {
    let history = vec![
      attempt("a", AttemptOutcome::Pending),
      attempt("b", AttemptOutcome::Pending),
      attempt("a", AttemptOutcome::Skipped),
      attempt("a", AttemptOutcome::Resolved),
      attempt("a", AttemptOutcome::Pending),
      attempt("a", AttemptOutcome::RolledBack),
    ];
    assert_eq!(count_similar(&history, "a"), 1);
    assert_eq!(count_similar(&history, "b"), 1);
    assert_eq!(count_similar(&history, "c"), 0);
  }

  #[test]
  fn follow_up_records_do_not_count_as_attempts() {
    let history = vec![
      attempt("a", AttemptOutcome::Pending),
      attempt("a", AttemptOutcome::Failed),
      attempt("a", AttemptOutcome::Skipped),
      attempt("a", AttemptOutcome::Failed),
    ];
    assert_eq!(count_similar(&history, "a"), 2);
  }
}
