use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};
use std::time::Duration;

/// Simulation time: microseconds since the server's epoch.
///
/// `SimTime` is a plain counter, not a wall clock. The server derives it from
/// a monotonic clock at the edge; everything inside the engine receives it as
/// a parameter so tests can drive time by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimTime(u64);

impl SimTime {
    /// The server epoch.
    pub const ZERO: SimTime = SimTime(0);

    /// Builds a time from a microsecond count.
    #[must_use]
    pub fn from_micros(us: u64) -> Self {
        SimTime(us)
    }

    /// Microseconds since the epoch.
    #[must_use]
    pub fn as_micros(self) -> u64 {
        self.0
    }

    /// Elapsed duration since `earlier`, saturating to zero if `earlier` is
    /// in the future.
    #[must_use]
    pub fn since(self, earlier: SimTime) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    #[allow(clippy::cast_possible_truncation)]
    fn add(self, rhs: Duration) -> SimTime {
        SimTime(self.0.saturating_add(rhs.as_micros() as u64))
    }
}

impl Sub<SimTime> for SimTime {
    type Output = Duration;

    fn sub(self, rhs: SimTime) -> Duration {
        self.since(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_since_round_trip() {
        let t0 = SimTime::from_micros(1_000);
        let t1 = t0 + Duration::from_millis(5);
        assert_eq!(t1.as_micros(), 6_000);
        assert_eq!(t1.since(t0), Duration::from_millis(5));
    }

    #[test]
    fn since_saturates_for_future_times() {
        let t0 = SimTime::from_micros(10);
        let t1 = SimTime::from_micros(20);
        assert_eq!(t0.since(t1), Duration::ZERO);
    }
}
