//! Manually advanced clock

use chrono::{DateTime, Duration, TimeZone, Utc};
use keri_core::Clock;
use parking_lot::Mutex;
use std::sync::Arc;

/// Clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one handle while the
/// dispatcher owns another.
#[derive(Debug, Clone)]
pub struct ControllableClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ControllableClock {
    /// Clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Clock frozen at 2024-01-01T00:00:00Z
    pub fn epoch() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();
        Self::new(start)
    }

    /// Move forward by `seconds`
    pub fn advance_secs(&self, seconds: i64) {
        let mut now = self.now.lock();
        *now += Duration::seconds(seconds);
    }

    /// Jump to `time`
    pub fn set(&self, time: DateTime<Utc>) {
        *self.now.lock() = time;
    }
}

impl Default for ControllableClock {
    fn default() -> Self {
        Self::epoch()
    }
}

impl Clock for ControllableClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
