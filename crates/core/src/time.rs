//! Time units used across the sensor and timer subsystems.

use std::fmt;
use std::time::Duration;

/// A span of time in nanoseconds.
///
/// Sensor request intervals and latencies are expressed in this unit. The
/// all-ones value doubles as the "default" sentinel so that a plain `min`
/// treats it as the identity when merging requests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nanoseconds(pub u64);

impl Nanoseconds {
    pub const ZERO: Nanoseconds = Nanoseconds(0);
    pub const MAX: Nanoseconds = Nanoseconds(u64::MAX);

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1_000_000)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros * 1_000)
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_nanos(self.0)
    }
}

impl From<Duration> for Nanoseconds {
    fn from(value: Duration) -> Self {
        Self(value.as_nanos().min(u64::MAX as u128) as u64)
    }
}

impl fmt::Display for Nanoseconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}
