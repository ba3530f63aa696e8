//! # Ticks and Timeouts
//!
//! The scheduler's notion of time is a 32-bit tick counter that advances
//! once per SysTick and wraps around. Deadlines are compared by signed
//! difference, so every comparison stays correct across the wrap as long as
//! the two instants are less than 2³¹ ticks apart.

use crate::config::ms_to_ticks;

/// A point on the scheduler's tick timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tick(u32);

impl Tick {
    pub const ZERO: Tick = Tick(0);

    pub const fn new(raw: u32) -> Self {
        Tick(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The instant `ticks` after `self`, wrapping around the counter.
    #[inline]
    pub const fn wrapping_add(self, ticks: u32) -> Tick {
        Tick(self.0.wrapping_add(ticks))
    }

    /// `true` once `self` is at or past `deadline`.
    #[inline]
    pub const fn has_reached(self, deadline: Tick) -> bool {
        (self.0.wrapping_sub(deadline.0) as i32) >= 0
    }

    /// Ticks elapsed from `earlier` to `self`.
    #[inline]
    pub const fn since(self, earlier: Tick) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }
}

/// Longest finite wait. Longer requests are clamped so that the signed
/// deadline comparison stays valid.
pub const MAX_TIMEOUT_TICKS: u32 = i32::MAX as u32;

/// How long a blocking operation may wait for its condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Do not block; report `Error::Timeout` if the condition does not hold.
    Immediate,
    /// Block for at most this many ticks.
    Ticks(u32),
    /// Block until the condition holds.
    Forever,
}

impl Timeout {
    pub const fn from_ms(ms: u32) -> Self {
        Timeout::Ticks(ms_to_ticks(ms))
    }

    /// The tick at which a wait started at `now` gives up, or `None` for
    /// an unbounded wait.
    pub(crate) fn deadline(self, now: Tick) -> Option<Tick> {
        match self {
            Timeout::Immediate => Some(now),
            Timeout::Ticks(ticks) => Some(now.wrapping_add(ticks.min(MAX_TIMEOUT_TICKS))),
            Timeout::Forever => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_reached() {
        let deadline = Tick::new(100);
        assert!(!Tick::new(99).has_reached(deadline));
        assert!(Tick::new(100).has_reached(deadline));
        assert!(Tick::new(101).has_reached(deadline));
    }

    #[test]
    fn test_has_reached_across_wrap() {
        let start = Tick::new(u32::MAX - 2);
        let deadline = start.wrapping_add(5);
        assert_eq!(deadline.raw(), 2);

        // A naive `>=` would call this reached immediately
        assert!(!start.has_reached(deadline));
        assert!(!Tick::new(u32::MAX).has_reached(deadline));
        assert!(!Tick::new(1).has_reached(deadline));
        assert!(Tick::new(2).has_reached(deadline));
        assert_eq!(Tick::new(2).since(start), 5);
    }

    #[test]
    fn test_deadline() {
        let now = Tick::new(10);
        assert_eq!(Timeout::Immediate.deadline(now), Some(now));
        assert_eq!(Timeout::Ticks(5).deadline(now), Some(Tick::new(15)));
        assert_eq!(Timeout::Forever.deadline(now), None);

        let far = Timeout::Ticks(u32::MAX).deadline(now).unwrap();
        assert!(!now.has_reached(far));
    }
}
