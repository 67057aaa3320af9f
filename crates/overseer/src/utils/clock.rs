use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Source of the current time for every component that compares ages or
/// deadlines. Commands use [`SystemClock`]; tests pass a [`FixedClock`].
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Manually advanced clock.
#[derive(Debug, Clone)]
pub struct FixedClock {
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
  #[must_use]
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Arc::new(Mutex::new(start)),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock();
    *now += by;
  }

  pub fn set(&self, to: DateTime<Utc>) {
    *self.now.lock() = to;
  }
}

impl Clock for FixedClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock()
  }
}

pub type SharedClock = Arc<dyn Clock>;

#[must_use]
pub fn system_clock() -> SharedClock {
  Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fixed_clock_advances_only_when_told() {
    let start = Utc::now();
    let clock = FixedClock::new(start);
    assert_eq!(clock.now(), start);
    clock.advance(Duration::seconds(90));
    assert_eq!(clock.now(), start + Duration::seconds(90));
    let shared: SharedClock = Arc::new(clock.clone());
    clock.advance(Duration::seconds(10));
    assert_eq!(shared.now(), start + Duration::seconds(100));
  }
}
