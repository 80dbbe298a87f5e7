//! Time source for sleeps and wake-up checks.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Where the engine reads the current time from.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
  now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
  pub fn new(now: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(now),
    }
  }

  pub fn set(&self, now: DateTime<Utc>) {
    *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
    *now = add_duration(*now, by);
  }
}

impl Clock for FixedClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// `at + by`, saturating at the latest representable instant.
pub(crate) fn add_duration(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
  TimeDelta::from_std(by)
    .ok()
    .and_then(|delta| at.checked_add_signed(delta))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
