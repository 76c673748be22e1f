//! Utility functions and helpers
//!
//! Clocks, identifier generators, date formatting and the retry policy.

pub mod retry;
pub mod time;
pub mod uid;

pub use retry::{retry_transient, RetryPolicy};
pub use time::{format_date, from_unix, Clock, FakeClock, SystemClock, ISO8601_DATE_FORMAT};
pub use uid::{FakeUid, RandomUid, UidGenerator};
