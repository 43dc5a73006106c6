//! Time source injected into every component that compares timestamps.

use std::sync::{Arc, Mutex};

use time::{OffsetDateTime, PrimitiveDateTime};

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<OffsetDateTime>>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, t: OffsetDateTime) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = t;
        }
    }

    pub fn advance(&self, by: time::Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        self.now
            .lock()
            .map(|g| *g)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }
}

/// `t - by`, clamped to the earliest representable instant.
pub fn saturating_before(t: OffsetDateTime, by: time::Duration) -> OffsetDateTime {
    t.checked_sub(by)
        .unwrap_or_else(|| PrimitiveDateTime::MIN.assume_utc())
}

/// `t + by`, clamped to the latest representable instant.
pub fn saturating_after(t: OffsetDateTime, by: time::Duration) -> OffsetDateTime {
    t.checked_add(by)
        .unwrap_or_else(|| PrimitiveDateTime::MAX.assume_utc())
}
