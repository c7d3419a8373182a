//! Millisecond timestamps and clocks

use chrono::{Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::DomainError;

/// Wall-clock instant in milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Current wall-clock time
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Wrap raw epoch milliseconds
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    /// Raw epoch milliseconds
    #[inline(always)]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Shift by a signed number of milliseconds (saturating)
    pub const fn add_millis(&self, ms: i64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    /// Shift by calendar months, clamping to the end of shorter months
    pub fn add_months(&self, months: u32) -> Result<Self, DomainError> {
        Utc.timestamp_millis_opt(self.0)
            .single()
            .and_then(|dt| dt.checked_add_months(Months::new(months)))
            .map(|dt| Self(dt.timestamp_millis()))
            .ok_or(DomainError::TimestampOutOfRange)
    }

    /// Shift back by calendar months
    pub fn sub_months(&self, months: u32) -> Result<Self, DomainError> {
        Utc.timestamp_millis_opt(self.0)
            .single()
            .and_then(|dt| dt.checked_sub_months(Months::new(months)))
            .map(|dt| Self(dt.timestamp_millis()))
            .ok_or(DomainError::TimestampOutOfRange)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Utc.timestamp_millis_opt(self.0).single() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// Source of "now" for anything time-dependent
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> Timestamp;
}

/// Clock backed by the system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually driven clock for tests and replays
#[derive(Debug)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    /// Start at the given instant
    pub fn new(start: Timestamp) -> Self {
        Self(AtomicI64::new(start.as_millis()))
    }

    /// Jump to an instant
    pub fn set(&self, at: Timestamp) {
        self.0.store(at.as_millis(), Ordering::SeqCst);
    }

    /// Move forward by `ms`
    pub fn advance_millis(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.0.load(Ordering::SeqCst))
    }
}
