use std::path::Path;

use serde::{Deserialize, Serialize};

use super::state::Priority;
use crate::store::json::{JsonDoc, read_json_doc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
  Success,
  Partial,
  Failed,
  InProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Usage {
  #[serde(default)]
  pub tokens: u64,
  #[serde(default)]
  pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedFinding {
  pub priority: Priority,
  pub message: String,
}

/// The single result file an agent writes: `<role>.result.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
  pub status: ResultStatus,
  #[serde(default)]
  pub completed: Vec<String>,
  #[serde(default)]
  pub failed: Vec<String>,
  #[serde(default)]
  pub outputs: Vec<String>,
  #[serde(default)]
  pub summary: String,
  #[serde(default)]
  pub errors: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub confidence: Option<f64>,
  #[serde(default)]
  pub findings: Vec<ReportedFinding>,
  #[serde(default)]
  pub usage: Usage,
}

impl AgentResult {
  #[must_use]
  pub fn is_finished(&self) -> bool {
    self.status != ResultStatus::InProgress
  }

  #[must_use]
  pub fn is_failure(&self) -> bool {
    self.status == ResultStatus::Failed
  }

  /// Declared confidence clamped to `0..=1`, or the share of completed
  /// sub-agents when the agent did not declare one. An agent that reports
  /// nothing either way counts as fully confident unless it failed.
  #[must_use]
  pub fn effective_confidence(&self) -> f64 {
    if let Some(c) = self.confidence
      && c.is_finite()
    {
      return c.clamp(0.0, 1.0);
    }
    let done = self.completed.len();
    let total = done + self.failed.len();
    if total == 0 {
      return if self.is_failure() { 0.0 } else { 1.0 };
    }
    done as f64 / total as f64
  }

  /// Text fed to the healing engine when this result counts as a failure.
  #[must_use]
  pub fn failure_text(&self) -> String {
    if self.errors.is_empty() {
      if self.summary.trim().is_empty() {
        "agent reported failure without details".to_string()
      } else {
        self.summary.trim().to_string()
      }
    } else {
      self.errors.join("\n")
    }
  }
}

/// Read an agent's result file, distinguishing absent, unreadable and valid.
pub fn read_result(path: &Path) -> anyhow::Result<JsonDoc<AgentResult>> {
  read_json_doc(path)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(raw: &str) -> AgentResult {
    serde_json::from_str(raw).unwrap()
  }

  #[test]
  fn minimal_document_parses_with_defaults() {
    let res = parse(r#"{"status":"success"}"#);
    assert!(res.completed.is_empty());
    assert_eq!(res.usage, Usage::default());
    assert!((res.effective_confidence() - 1.0).abs() < f64::EPSILON);
  }

  #[test]
  fn declared_confidence_wins_and_is_clamped() {
    let res = parse(r#"{"status":"partial","completed":["a"],"failed":["b"],"confidence":1.7}"#);
    assert!((res.effective_confidence() - 1.0).abs() < f64::EPSILON);
    let res = parse(r#"{"status":"partial","completed":["a"],"failed":["b"]}"#);
    assert!((res.effective_confidence() - 0.5).abs() < f64::EPSILON);
  }

  #[test]
  fn failure_text_prefers_errors() {
    let res = parse(r#"{"status":"failed","summary":"broke","errors":["E1","E2"]}"#);
    assert_eq!(res.failure_text(), "E1\nE2");
    let res = parse(r#"{"status":"failed","summary":" broke "}"#);
    assert_eq!(res.failure_text(), "broke");
    assert!((res.effective_confidence()).abs() < f64::EPSILON);
  }

  #[test]
  fn unknown_status_is_rejected() {
    assert!(serde_json::from_str::<AgentResult>(r#"{"status":"done"}"#).is_err());
  }
}
