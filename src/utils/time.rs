//! Time and timestamp utilities

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;

/// Layout of the `CreatedAtDate` partition key.
pub const ISO8601_DATE_FORMAT: &str = "%Y-%m-%d";

/// Source of the current time.
///
/// Injected into the audit log so tests can pin and advance time.
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

/// Manually driven clock for deterministic tests.
#[derive(Debug, Clone)]
pub struct FakeClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl FakeClock {
    /// Create a fake clock frozen at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        // 2021-04-10T08:05:00Z
        Self::new(Utc.with_ymd_and_hms(2021, 4, 10, 8, 5, 0).single().unwrap_or_default())
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Format a Unix timestamp (seconds) as its UTC calendar day.
///
/// Returns `None` for timestamps outside chrono's representable range.
pub fn format_date(unix_secs: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(unix_secs, 0)
        .map(|t| t.format(ISO8601_DATE_FORMAT).to_string())
}

/// Convert a Unix timestamp (seconds) to a UTC datetime
pub fn from_unix(unix_secs: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(unix_secs, 0)
}
