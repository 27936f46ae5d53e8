use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta};
use std::fmt::{self, Display};
use std::ops::{Add, AddAssign, Sub};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/* ───────────────────── Engine time ─────────────────────
Engine time is a signed microsecond count since the Unix epoch.
MIN_TIME is the "never modified / invalid" sentinel, MAX_TIME is
"after end of evaluation". Both sentinels are excluded from
normal arithmetic: adding a step to MAX_TIME saturates.
------------------------------------------------------- */

/// A point in engine time, microseconds since 1970-01-01T00:00:00Z.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineTime(i64);

/// A signed span of engine time in microseconds.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineDelta(i64);

/// Sentinel for "never modified"; also the time of an invalid value.
pub const MIN_TIME: EngineTime = EngineTime(i64::MIN);

/// Sentinel for "after the end of evaluation".
pub const MAX_TIME: EngineTime = EngineTime(i64::MAX);

/// The smallest addressable step of engine time: one microsecond.
pub const MIN_STEP: EngineDelta = EngineDelta(1);

/// The zero-length span.
pub const ZERO_DELTA: EngineDelta = EngineDelta(0);

impl EngineTime {
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    #[inline]
    pub const fn micros(self) -> i64 {
        self.0
    }

    /// Current wall-clock time at microsecond resolution.
    pub fn wall_clock_now() -> Self {
        let now: DateTime<chrono::Utc> = chrono::Utc::now();
        Self(now.timestamp_micros())
    }

    pub fn from_datetime(dt: NaiveDateTime) -> Self {
        Self(dt.and_utc().timestamp_micros())
    }

    pub fn from_date(d: NaiveDate) -> Self {
        Self::from_datetime(d.and_hms_opt(0, 0, 0).unwrap())
    }

    /// Render back to a chrono datetime; sentinels have no rendering.
    pub fn to_datetime(self) -> Option<NaiveDateTime> {
        if self == MIN_TIME || self == MAX_TIME {
            return None;
        }
        DateTime::from_timestamp_micros(self.0).map(|dt| dt.naive_utc())
    }

    #[inline]
    pub fn is_sentinel(self) -> bool {
        self == MIN_TIME || self == MAX_TIME
    }

    /// Saturating add that never wraps a sentinel into the normal range.
    #[inline]
    pub fn saturating_add(self, delta: EngineDelta) -> Self {
        Self(self.0.saturating_add(delta.0))
    }

    #[inline]
    pub fn max(self, other: Self) -> Self {
        if self.0 >= other.0 { self } else { other }
    }

    #[inline]
    pub fn min(self, other: Self) -> Self {
        if self.0 <= other.0 { self } else { other }
    }
}

impl EngineDelta {
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000)
    }

    #[inline]
    pub const fn micros(self) -> i64 {
        self.0
    }

    pub fn from_chrono(delta: TimeDelta) -> Option<Self> {
        delta.num_microseconds().map(Self)
    }

    pub fn to_chrono(self) -> TimeDelta {
        TimeDelta::microseconds(self.0)
    }

    #[inline]
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn min(self, other: Self) -> Self {
        if self.0 <= other.0 { self } else { other }
    }
}

impl Add<EngineDelta> for EngineTime {
    type Output = EngineTime;

    #[inline]
    fn add(self, rhs: EngineDelta) -> EngineTime {
        EngineTime(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign<EngineDelta> for EngineTime {
    #[inline]
    fn add_assign(&mut self, rhs: EngineDelta) {
        *self = *self + rhs;
    }
}

impl Sub<EngineTime> for EngineTime {
    type Output = EngineDelta;

    #[inline]
    fn sub(self, rhs: EngineTime) -> EngineDelta {
        EngineDelta(self.0.saturating_sub(rhs.0))
    }
}

impl Sub<EngineDelta> for EngineTime {
    type Output = EngineTime;

    #[inline]
    fn sub(self, rhs: EngineDelta) -> EngineTime {
        EngineTime(self.0.saturating_sub(rhs.0))
    }
}

impl Add for EngineDelta {
    type Output = EngineDelta;

    #[inline]
    fn add(self, rhs: EngineDelta) -> EngineDelta {
        EngineDelta(self.0.saturating_add(rhs.0))
    }
}

impl Display for EngineTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == MIN_TIME {
            return f.write_str("<never>");
        }
        if *self == MAX_TIME {
            return f.write_str("<end-of-time>");
        }
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.6f")),
            None => write!(f, "{}us", self.0),
        }
    }
}

impl Display for EngineDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_step_advances_time() {
        let t = EngineTime::from_micros(1_000);
        assert_eq!((t + MIN_STEP).micros(), 1_001);
        assert_eq!(t + ZERO_DELTA, t);
    }

    #[test]
    fn sentinels_saturate() {
        assert_eq!(MAX_TIME + MIN_STEP, MAX_TIME);
        assert_eq!(MIN_TIME - MIN_STEP, MIN_TIME);
        assert!(MIN_TIME.is_sentinel());
        assert!(MAX_TIME.is_sentinel());
        assert!(!EngineTime::from_micros(0).is_sentinel());
    }

    #[test]
    fn datetime_round_trip() {
        let dt = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_micro_opt(9, 30, 0, 250)
            .unwrap();
        let t = EngineTime::from_datetime(dt);
        assert_eq!(t.to_datetime(), Some(dt));
        assert_eq!(MIN_TIME.to_datetime(), None);
    }

    #[test]
    fn subtraction_yields_delta() {
        let a = EngineTime::from_micros(5_000);
        let b = EngineTime::from_micros(2_000);
        assert_eq!(a - b, EngineDelta::from_micros(3_000));
        assert_eq!(b + (a - b), a);
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(MIN_TIME < EngineTime::from_micros(0));
        assert!(EngineTime::from_micros(0) < MAX_TIME);
        assert_eq!(
            EngineTime::from_micros(7).max(EngineTime::from_micros(3)),
            EngineTime::from_micros(7)
        );
    }
}
