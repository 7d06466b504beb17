use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{TdbError, TdbResult};

pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// Microseconds since the Unix epoch, always UTC.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as i64;
        Self(micros)
    }

    pub fn from_seconds(seconds: i64) -> Self {
        Self(seconds.saturating_mul(MICROS_PER_SECOND))
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }

    pub fn epoch_seconds(self) -> f64 {
        self.0 as f64 / MICROS_PER_SECOND as f64
    }

    pub fn plus(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_micros() as i64))
    }

    pub fn minus(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_micros() as i64))
    }

    pub fn to_offset_datetime(self) -> TdbResult<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000)
            .map_err(|err| TdbError::invalid(format!("timestamp {} out of range: {err}", self.0)))
    }

    pub fn from_offset_datetime(value: OffsetDateTime) -> Self {
        Self((value.unix_timestamp_nanos() / 1_000) as i64)
    }
}

impl From<OffsetDateTime> for Timestamp {
    fn from(value: OffsetDateTime) -> Self {
        Self::from_offset_datetime(value)
    }
}

/// Source of "now" for date stamping and cache expiration.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct FixedClock {
    micros: AtomicI64,
}

impl FixedClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            micros: AtomicI64::new(start.0),
        }
    }

    pub fn set(&self, at: Timestamp) {
        self.micros.store(at.0, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.micros
            .fetch_add(by.as_micros() as i64, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.micros.load(Ordering::SeqCst))
    }
}

/// A span such as `"2 days"`, used by `timeago` predicates.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Interval(pub Duration);

impl Interval {
    pub fn parse(raw: &str) -> TdbResult<Self> {
        let mut parts = raw.split_whitespace();
        let (Some(amount), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(TdbError::invalid(format!("interval '{raw}' must be '<n> <unit>'")));
        };
        let amount: u64 = amount
            .parse()
            .map_err(|err| TdbError::invalid(format!("interval amount '{amount}': {err}")))?;
        let unit = unit.to_ascii_lowercase();
        let seconds = match unit.trim_end_matches('s') {
            "second" | "sec" => 1,
            "minute" | "min" => 60,
            "hour" => 3_600,
            "day" => 86_400,
            "week" => 604_800,
            "month" => 2_592_000,
            "year" => 31_536_000,
            _ => return Err(TdbError::invalid(format!("unknown interval unit '{unit}'"))),
        };
        Ok(Self(Duration::from_secs(amount.saturating_mul(seconds))))
    }

    pub fn as_micros(self) -> i64 {
        self.0.as_micros() as i64
    }
}

impl From<Duration> for Interval {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Clock, FixedClock, Interval, Timestamp};

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::new(Timestamp::from_seconds(100));
        clock.advance(Duration::from_secs(6));
        assert_eq!(clock.now(), Timestamp::from_seconds(106));
    }

    #[test]
    fn interval_parses_units() {
        assert_eq!(
            Interval::parse("2 days").expect("days").0,
            Duration::from_secs(172_800)
        );
        assert_eq!(
            Interval::parse("1 hour").expect("hour").0,
            Duration::from_secs(3_600)
        );
        assert!(Interval::parse("soon").is_err());
        assert!(Interval::parse("3 fortnights").is_err());
    }

    #[test]
    fn offset_datetime_roundtrip() {
        let ts = Timestamp(1_134_028_003_123_456);
        let dt = ts.to_offset_datetime().expect("datetime");
        assert_eq!(Timestamp::from(dt), ts);
        assert_eq!(dt.year(), 2005);
    }
}
