use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond wall-clock source. Injected into queues and pools so tests
/// can pin timestamps and drive age-based lifecycle rules by hand.
pub trait Clock: Send + Sync + fmt::Debug {
  fn now_ms(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_ms(&self) -> u64 {
    SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_millis() as u64)
      .unwrap_or(0)
  }
}

/// A hand-advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
  ms: AtomicU64,
}

impl ManualClock {
  pub fn new(start_ms: u64) -> Self {
    Self {
      ms: AtomicU64::new(start_ms),
    }
  }

  pub fn advance(&self, ms: u64) {
    self.ms.fetch_add(ms, Ordering::SeqCst);
  }

  pub fn set(&self, ms: u64) {
    self.ms.store(ms, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now_ms(&self) -> u64 {
    self.ms.load(Ordering::SeqCst)
  }
}
