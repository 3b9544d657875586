// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Monotonic clock and duration arithmetic for the runtime.
//!
//! [`Time`] is a monotonic high-resolution instant in nanoseconds with an
//! undefined base (not wall-clock time). It is compatible with
//! [`DurationNs`]: to make a time in the future, simply add to a [`Time`],
//! i.e. "10 seconds from now" is `Time::now() + 10 * SECOND`.
//!
//! [`Time::NONE`] is reserved as the "no deadline / dead timer" sentinel.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::sync::OnceLock;
use std::time::Instant;

/// Signed duration in nanoseconds, like 134ms or -1.2h.
pub type DurationNs = i64;

pub const NANOSECOND: DurationNs = 1;
pub const MICROSECOND: DurationNs = 1_000;
pub const MILLISECOND: DurationNs = 1_000_000;
pub const SECOND: DurationNs = 1_000_000_000;
pub const MINUTE: DurationNs = 60 * SECOND;
pub const HOUR: DurationNs = 60 * MINUTE;

/// Monotonic high-resolution clock value with an undefined base.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(u64);

static ANCHOR: OnceLock<Instant> = OnceLock::new();

impl Time {
    /// Sentinel meaning "no deadline" (for the poller) or "dead timer"
    /// (for heap entries).
    pub const NONE: Time = Time(u64::MAX);

    /// Current monotonic clock value.
    #[must_use]
    pub fn now() -> Time {
        let anchor = ANCHOR.get_or_init(Instant::now);
        // Anchored well away from zero so that subtracting small leeways or
        // the sleep bias can never underflow.
        Time(u64::try_from(anchor.elapsed().as_nanos()).unwrap_or(u64::MAX - 1) + SECOND as u64)
    }

    #[must_use]
    pub fn is_none(self) -> bool { self == Time::NONE }

    #[must_use]
    pub fn as_nanos(self) -> u64 { self.0 }

    #[must_use]
    pub fn from_nanos(nanos: u64) -> Time { Time(nanos) }

    /// Time delta between now and a point in time in the past.
    #[must_use]
    pub fn since(past: Time) -> DurationNs { Time::between(Time::now(), past) }

    /// Time delta between now and a point in time in the future.
    #[must_use]
    pub fn until(future: Time) -> DurationNs { Time::between(future, Time::now()) }

    /// Delta between `a` and `b`, i.e. `between(3, 1) == 2`.
    #[must_use]
    pub fn between(a: Time, b: Time) -> DurationNs {
        let delta = i128::from(a.0) - i128::from(b.0);
        i64::try_from(delta).unwrap_or(if delta > 0 { i64::MAX } else { i64::MIN })
    }

    /// `self + d`, clamped so the result never collides with [`Time::NONE`].
    #[must_use]
    pub fn saturating_add(self, d: DurationNs) -> Time {
        if d < 0 {
            Time(self.0.saturating_sub(d.unsigned_abs()))
        } else {
            Time(self.0.saturating_add(d as u64).min(u64::MAX - 1))
        }
    }
}

impl Add<DurationNs> for Time {
    type Output = Time;
    fn add(self, d: DurationNs) -> Time { self.saturating_add(d) }
}

impl AddAssign<DurationNs> for Time {
    fn add_assign(&mut self, d: DurationNs) { *self = *self + d; }
}

impl Sub<Time> for Time {
    type Output = DurationNs;
    fn sub(self, other: Time) -> DurationNs { Time::between(self, other) }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "<none>")
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}

/// Formats a duration as a short human-readable string like `"1.6s"` or
/// `"250ms"`. Used by trace output.
#[must_use]
pub fn format_duration(d: DurationNs) -> String {
    let (sign, d) = if d < 0 { ("-", d.unsigned_abs()) } else { ("", d.unsigned_abs()) };
    let (val, unit, div): (u64, &str, u64) = if d >= HOUR as u64 {
        (d, "h", HOUR as u64)
    } else if d >= MINUTE as u64 {
        (d, "min", MINUTE as u64)
    } else if d >= SECOND as u64 {
        (d, "s", SECOND as u64)
    } else if d >= MILLISECOND as u64 {
        (d, "ms", MILLISECOND as u64)
    } else if d >= MICROSECOND as u64 {
        (d, "µs", MICROSECOND as u64)
    } else {
        (d, "ns", 1)
    };
    let whole = val / div;
    let frac = (val % div) * 10 / div;
    if frac == 0 || div == 1 {
        format!("{sign}{whole}{unit}")
    } else {
        format!("{sign}{whole}.{frac}{unit}")
    }
}
