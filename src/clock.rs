//! Monotonic millisecond timestamps.
//!
//! Timestamps are measured against a process-wide epoch taken from the tokio
//! clock, so paused test runtimes can advance them deterministically.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::Instant;

/// Millisecond value assigned to the epoch instant. Keeps instants taken
/// slightly before the epoch was captured representable.
const EPOCH_MILLIS: u64 = 1 << 32;

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// An opaque monotonic instant in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Sentinel for "never happened". Sorts before every real timestamp.
    pub const NEVER: Timestamp = Timestamp(0);

    pub fn now() -> Self {
        Self::from_instant(Instant::now())
    }

    pub fn from_instant(instant: Instant) -> Self {
        let epoch = epoch();
        let millis = match instant.checked_duration_since(epoch) {
            Some(after) => EPOCH_MILLIS.saturating_add(after.as_millis() as u64),
            // Round away from the epoch so millisecond flooring is consistent on both sides
            None => {
                let before = epoch.duration_since(instant).as_nanos().div_ceil(1_000_000);
                EPOCH_MILLIS.saturating_sub(before as u64)
            }
        };
        Timestamp(millis)
    }

    /// Convert back to a tokio instant, for use with `sleep_until`.
    pub fn to_instant(self) -> Instant {
        let epoch = epoch();
        if self.0 >= EPOCH_MILLIS {
            epoch + Duration::from_millis(self.0 - EPOCH_MILLIS)
        } else {
            epoch
                .checked_sub(Duration::from_millis(EPOCH_MILLIS - self.0))
                .unwrap_or(epoch)
        }
    }

    pub const fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    pub fn is_never(self) -> bool {
        self.0 == 0
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// Time elapsed since this timestamp.
    pub fn elapsed(self) -> Duration {
        Timestamp::now().saturating_duration_since(self)
    }

    /// The wall-clock time this instant corresponds to.
    pub fn to_utc(self) -> DateTime<Utc> {
        let offset = Timestamp::now().0 as i64 - self.0 as i64;
        Utc::now() - ChronoDuration::milliseconds(offset)
    }

    /// Map a wall-clock time onto the monotonic scale.
    pub fn from_utc(wall: DateTime<Utc>) -> Self {
        let offset = (Utc::now() - wall).num_milliseconds();
        let now = Timestamp::now();
        if offset >= 0 {
            now - Duration::from_millis(offset as u64)
        } else {
            now + Duration::from_millis(offset.unsigned_abs())
        }
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl AddAssign<Duration> for Timestamp {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(rhs.as_millis() as u64))
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        self.saturating_duration_since(rhs)
    }
}

impl fmt::Display for Timestamp {
    /// Formats as the wall-clock time this instant corresponds to.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            return f.write_str("never");
        }
        write!(f, "{}", self.to_utc().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        let t = Timestamp::from_millis(10_000);
        assert_eq!((t + Duration::from_millis(500)).as_millis(), 10_500);
        assert_eq!((t - Duration::from_millis(500)).as_millis(), 9_500);
        assert_eq!(t + Duration::from_millis(500) - t, Duration::from_millis(500));

        // Subtraction saturates in both directions
        assert_eq!(t - (t + Duration::from_secs(1)), Duration::ZERO);
        assert_eq!(Timestamp::NEVER - Duration::from_secs(1), Timestamp::NEVER);
    }

    #[test]
    fn test_ordering_and_never() {
        let now = Timestamp::now();
        assert!(Timestamp::NEVER < now);
        assert!(now < now + Duration::from_millis(1));
        assert_eq!(Timestamp::NEVER.to_string(), "never");
        assert!(!now.to_string().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_follows_tokio_clock() {
        let start = Timestamp::now();
        tokio::time::advance(Duration::from_millis(1500)).await;
        let end = Timestamp::now();
        assert_eq!(end - start, Duration::from_millis(1500));

        let instant = end.to_instant();
        assert_eq!(Timestamp::from_instant(instant), end);
    }

    #[test]
    fn test_wall_clock_round_trip() {
        let past = Timestamp::now() - Duration::from_secs(30);
        let wall = past.to_utc();
        let back = Timestamp::from_utc(wall);
        // Two clock reads separate the conversions
        assert!(back.as_millis().abs_diff(past.as_millis()) < 50);
    }
}
