//! Injected wall-clock source
//!
//! Nothing in the KEL core reads the system clock directly. First-seen
//! timestamps and escrow ages come from a [`Clock`] handed in by the caller,
//! which lets tests drive time explicitly.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Wall-clock time source
pub trait Clock: Send + Sync {
    /// Current UTC time
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}
