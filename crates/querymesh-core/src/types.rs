//! Core type definitions for querymesh

use serde::{Deserialize, Serialize};
use std::fmt;

/// The minimum time advertised by a backend whose TSDB has not initialized
/// yet. Such a backend is still eligible if its maximum time overlaps the
/// queried range.
pub const UNINITIALIZED_MIN_TIME: i64 = i64::MAX;

/// A closed time interval in milliseconds since epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub min_time: i64,
    pub max_time: i64,
}

impl TimeRange {
    /// The widest possible range
    pub const FULL: TimeRange = TimeRange {
        min_time: i64::MIN,
        max_time: i64::MAX,
    };

    pub fn new(min_time: i64, max_time: i64) -> Self {
        Self { min_time, max_time }
    }

    /// Check whether the range intersects `[min_time, max_time]`.
    pub fn overlaps(&self, min_time: i64, max_time: i64) -> bool {
        min_time <= self.max_time && max_time >= self.min_time
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::FULL
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.min_time, self.max_time)
    }
}
