//! Monotonic bus time with microsecond resolution.
//!
//! All line timing in this crate (break, mark-after-break, slot timestamps) is expressed in these
//! types.  On hardware, the platform glue derives an [`Instant`] from a free-running timer; on the
//! host, the simulator owns the clock.

/// A point in time, counted in microseconds from an arbitrary epoch (usually boot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant {
    micros: i64,
}

/// A span of time in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration {
    micros: u64,
}

impl Instant {
    pub const ZERO: Instant = Instant { micros: 0 };

    #[inline(always)]
    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    #[inline(always)]
    pub const fn from_millis(millis: i64) -> Self {
        Self {
            micros: millis * 1000,
        }
    }

    #[inline(always)]
    pub const fn total_micros(self) -> i64 {
        self.micros
    }

    #[inline(always)]
    pub const fn total_millis(self) -> i64 {
        self.micros / 1000
    }

    /// Time since the process started.
    ///
    /// Only available with `std`.
    #[cfg(feature = "std")]
    pub fn now() -> Self {
        use std::sync::OnceLock;
        static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();
        let epoch = *EPOCH.get_or_init(std::time::Instant::now);
        Self {
            micros: i64::try_from(epoch.elapsed().as_micros()).unwrap_or(i64::MAX),
        }
    }

    /// Duration elapsed between `earlier` and `self`, saturating at zero.
    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        Duration::from_micros(u64::try_from(self.micros - earlier.micros).unwrap_or(0))
    }
}

impl Duration {
    pub const ZERO: Duration = Duration { micros: 0 };
    pub const MAX: Duration = Duration { micros: u64::MAX };

    #[inline(always)]
    pub const fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    #[inline(always)]
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            micros: millis * 1000,
        }
    }

    #[inline(always)]
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            micros: secs * 1_000_000,
        }
    }

    #[inline(always)]
    pub const fn total_micros(self) -> u64 {
        self.micros
    }

    #[inline(always)]
    pub const fn total_millis(self) -> u64 {
        self.micros / 1000
    }
}

impl core::ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant {
            micros: self.micros + i64::try_from(rhs.micros).unwrap_or(i64::MAX),
        }
    }
}

impl core::ops::AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl core::ops::Sub<Instant> for Instant {
    type Output = Duration;

    /// Panics in debug builds when `rhs` lies after `self`.
    fn sub(self, rhs: Instant) -> Duration {
        debug_assert!(self >= rhs, "subtracting a later instant");
        self.saturating_duration_since(rhs)
    }
}

impl core::ops::Add for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration {
            micros: self.micros.saturating_add(rhs.micros),
        }
    }
}

impl core::ops::Mul<u32> for Duration {
    type Output = Duration;

    fn mul(self, rhs: u32) -> Duration {
        Duration {
            micros: self.micros.saturating_mul(u64::from(rhs)),
        }
    }
}

#[cfg(feature = "std")]
impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        std::time::Duration::from_micros(d.micros)
    }
}
