//! Cumulative resource ceilings for one project.
//!
//! Token, cost, total healing and orphan-kill ceilings are hard stops.
//! Repetition of one error signature is soft: it ends that particular fix and
//! forces escalation, but the project keeps going.

use std::sync::OnceLock;

use regex::Regex;

use crate::config::Limits;
use crate::domain::{CircuitBreakers, ProjectState, TripReason};

/// Prefix of the `error_counts` key that counts orphan kills per project.
pub const ORPHAN_KILL_PREFIX: &str = "orphan_kill:";

const SIGNATURE_MAX_CHARS: usize = 160;

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerCheck {
  pub tripped: bool,
  pub hard: bool,
  pub reason: Option<TripReason>,
}

impl BreakerCheck {
  fn ok() -> Self {
    Self {
      tripped: false,
      hard: false,
      reason: None,
    }
  }

  fn trip(reason: TripReason) -> Self {
    Self {
      tripped: true,
      hard: reason.is_hard(),
      reason: Some(reason),
    }
  }
}

/// Evaluate ceilings in order: latched trip, tokens, cost, total healing
/// attempts, orphan kills, then same-signature repetition.
#[must_use]
pub fn check(state: &ProjectState, limits: &Limits) -> BreakerCheck {
  let cb = &state.circuit_breakers;
  if let Some(reason) = &cb.tripped {
    return BreakerCheck::trip(reason.clone());
  }
  if let Some(reason) = hard_reason(state, limits) {
    return BreakerCheck::trip(reason);
  }
  cb.error_counts
    .keys()
    .filter(|sig| !sig.starts_with(ORPHAN_KILL_PREFIX))
    .find_map(|sig| repeated(cb, limits, sig))
    .map_or_else(BreakerCheck::ok, BreakerCheck::trip)
}

fn hard_reason(state: &ProjectState, limits: &Limits) -> Option<TripReason> {
  let cb = &state.circuit_breakers;
  if cb.tokens_used > limits.max_tokens {
    return Some(TripReason::TokenCeiling {
      used: cb.tokens_used,
      limit: limits.max_tokens,
    });
  }
  if cb.cost_usd > limits.max_cost_usd {
    return Some(TripReason::CostCeiling {
      used: cb.cost_usd,
      limit: limits.max_cost_usd,
    });
  }
  if state.healing_attempts > limits.max_total_heal_attempts {
    return Some(TripReason::HealingBudget {
      used: state.healing_attempts,
      limit: limits.max_total_heal_attempts,
    });
  }
  let kills = cb
    .error_counts
    .get(&orphan_kill_key(&state.project_id))
    .copied()
    .unwrap_or(0);
  if kills > limits.max_same_error {
    return Some(TripReason::OrphanKills {
      count: kills,
      limit: limits.max_same_error,
    });
  }
  None
}

/// Soft trip for `signature` when it occurred more often than allowed.
#[must_use]
pub fn repeated(cb: &CircuitBreakers, limits: &Limits, signature: &str) -> Option<TripReason> {
  let count = cb.error_counts.get(signature).copied().unwrap_or(0);
  (count > limits.max_same_error).then(|| TripReason::RepeatedError {
    signature: signature.to_string(),
    count,
    limit: limits.max_same_error,
  })
}

/// Add usage to the counters. Counters saturate and never decrease; negative
/// or non-finite cost is ignored.
#[must_use]
pub fn update(
  cb: &CircuitBreakers,
  tokens: u64,
  cost_usd: f64,
  signature: Option<&str>,
) -> CircuitBreakers {
  let mut next = cb.clone();
  next.tokens_used = next.tokens_used.saturating_add(tokens);
  if cost_usd.is_finite() && cost_usd > 0.0 {
    next.cost_usd += cost_usd;
  }
  if let Some(sig) = signature {
    let slot = next.error_counts.entry(sig.to_string()).or_insert(0);
    *slot = slot.saturating_add(1);
  }
  next
}

#[must_use]
pub fn orphan_kill_key(project_id: &str) -> String {
  format!("{ORPHAN_KILL_PREFIX}{project_id}")
}

/// Share of the tightest of the token and cost ceilings already used.
#[must_use]
pub fn usage_ratios(cb: &CircuitBreakers, limits: &Limits) -> (f64, f64) {
  #[allow(clippy::cast_precision_loss)]
  let tokens = if limits.max_tokens == 0 {
    f64::INFINITY
  } else {
    cb.tokens_used as f64 / limits.max_tokens as f64
  };
  let cost = if limits.max_cost_usd <= 0.0 {
    f64::INFINITY
  } else {
    cb.cost_usd / limits.max_cost_usd
  };
  (tokens, cost)
}

struct SignaturePatterns {
  timestamp: Regex,
  clock: Regex,
  path: Regex,
  location: Regex,
  hex: Regex,
  number: Regex,
  space: Regex,
}

fn patterns() -> &'static SignaturePatterns {
  static PATTERNS: OnceLock<SignaturePatterns> = OnceLock::new();
  PATTERNS.get_or_init(|| SignaturePatterns {
    timestamp: Regex::new(
      r"\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:z|[+-]\d{2}:?\d{2})?",
    )
    .expect("valid timestamp regex"),
    clock: Regex::new(r"\b\d{2}:\d{2}:\d{2}(?:\.\d+)?\b").expect("valid clock regex"),
    path: Regex::new(r"(?:[a-z]:)?(?:[\w.~-]*[/\\])+[\w.-]*(?::\d+){0,2}")
      .expect("valid path regex"),
    location: Regex::new(r"\b[\w-]+\.[a-z]{1,5}:\d+(?::\d+)?").expect("valid location regex"),
    hex: Regex::new(r"\b(?:0x[0-9a-f]+|[0-9a-f]{12,})\b").expect("valid hex regex"),
    number: Regex::new(r"\b\d+(?:\.\d+)?\b").expect("valid number regex"),
    space: Regex::new(r"\s+").expect("valid whitespace regex"),
  })
}

/// Reduce an error message to the part that identifies its root cause, so
/// cosmetically different reports of one failure are counted together.
#[must_use]
pub fn normalize_signature(text: &str) -> String {
  let p = patterns();
  let lowered = text.to_lowercase();
  let s = p.timestamp.replace_all(&lowered, "<ts>");
  let s = p.clock.replace_all(&s, "<ts>");
  let s = p.path.replace_all(&s, "<path>");
  let s = p.location.replace_all(&s, "<loc>");
  let s = p.hex.replace_all(&s, "<hex>");
  let s = p.number.replace_all(&s, "<n>");
  let s = p.space.replace_all(&s, " ");
  s.trim().chars().take(SIGNATURE_MAX_CHARS).collect()
}
