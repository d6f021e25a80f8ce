//! Hourly versus interval cycle selection.

use std::fmt;
use std::time::Duration;

/// Which check set a cycle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    Hourly,
    Interval,
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleKind::Hourly => write!(f, "Hourly"),
            CycleKind::Interval => write!(f, "Interval"),
        }
    }
}

/// Tracks the next hourly deadline of a daemon run.
///
/// The watermark starts at the daemon's start time, so the first cycle is
/// always hourly. Each hourly cycle moves it forward by the hourly period,
/// or by the interval when the interval is the longer of the two.
#[derive(Debug, Clone)]
pub struct Cadence {
    interval_minutes: u64,
    hourly_minutes: u64,
    next_hourly: i64,
}

impl Cadence {
    pub fn new(interval_minutes: u64, hourly_minutes: u64, start: i64) -> Self {
        Self {
            interval_minutes,
            hourly_minutes,
            next_hourly: start,
        }
    }

    /// Kind of the cycle starting at `now` (epoch seconds).
    pub fn next(&mut self, now: i64) -> CycleKind {
        if self.next_hourly > now {
            return CycleKind::Interval;
        }
        let advance = self.interval_minutes.max(self.hourly_minutes) as i64 * 60;
        self.next_hourly = now + advance;
        CycleKind::Hourly
    }

    pub fn next_hourly(&self) -> i64 {
        self.next_hourly
    }

    /// Pause between cycles, whatever kind ran.
    pub fn sleep(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }

    /// `"N minute(s)"` wording of the pause.
    pub fn sleep_text(&self) -> String {
        let unit = if self.interval_minutes == 1 { "minute" } else { "minutes" };
        format!("{} {}", self.interval_minutes, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: i64 = 1_700_000_000;

    #[test]
    fn test_first_cycle_is_hourly() {
        let mut cadence = Cadence::new(15, 60, START);
        assert_eq!(cadence.next(START), CycleKind::Hourly);
        assert_eq!(cadence.next_hourly(), START + 3600);
    }

    #[test]
    fn test_interval_cycles_until_deadline() {
        let mut cadence = Cadence::new(15, 60, START);
        let kinds: Vec<CycleKind> = (0..9).map(|i| cadence.next(START + i * 900)).collect();
        assert_eq!(
            kinds,
            vec![
                CycleKind::Hourly,
                CycleKind::Interval,
                CycleKind::Interval,
                CycleKind::Interval,
                CycleKind::Hourly,
                CycleKind::Interval,
                CycleKind::Interval,
                CycleKind::Interval,
                CycleKind::Hourly,
            ]
        );
    }

    #[test]
    fn test_long_interval_advances_by_interval() {
        let mut cadence = Cadence::new(90, 60, START);
        cadence.next(START);
        assert_eq!(cadence.next_hourly(), START + 90 * 60);
        // Every cycle is hourly when the interval exceeds the hourly period.
        assert_eq!(cadence.next(START + 90 * 60), CycleKind::Hourly);
    }

    #[test]
    fn test_sleep_wording() {
        assert_eq!(Cadence::new(1, 60, START).sleep_text(), "1 minute");
        assert_eq!(Cadence::new(15, 60, START).sleep(), Duration::from_secs(900));
        assert_eq!(Cadence::new(15, 60, START).sleep_text(), "15 minutes");
    }
}
