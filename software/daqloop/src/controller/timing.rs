//! Cycle timing and the sampling-rate degradation policy

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Working sampling rate of a session.
///
/// Each input buffer overflow halves the rate, down to a fixed floor.
/// This is a degraded mode for the rest of the session, not a retry:
/// the rate never climbs back up on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplingRate {
    hz: u32,
    floor_hz: u32,
}

impl SamplingRate {
    pub fn new(hz: u32, floor_hz: u32) -> Self {
        let floor_hz = floor_hz.max(1);
        Self {
            hz: hz.max(floor_hz),
            floor_hz,
        }
    }

    pub fn hz(&self) -> u32 {
        self.hz
    }

    pub fn floor_hz(&self) -> u32 {
        self.floor_hz
    }

    /// Target time between cycle starts
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.hz as f64)
    }

    /// Apply the overflow policy. Returns the new rate if it changed.
    pub fn degrade(&mut self) -> Option<u32> {
        let next = (self.hz / 2).max(self.floor_hz);
        if next == self.hz {
            return None;
        }
        self.hz = next;
        Some(next)
    }
}

/// Counters kept by the loop thread over one session
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct LoopMetrics {
    /// Cycles that computed and wrote an output
    pub cycles: u64,

    /// Cycles whose read returned no samples
    pub empty_batches: u64,

    /// Input buffer overflows recovered by lowering the rate
    pub overflows: u64,

    /// Cycles that ran past their period
    pub overruns: u64,

    /// Smallest slack observed between the end of a cycle's work
    /// and its deadline, in nanoseconds. Negative on overrun.
    pub min_cycle_time_margin_ns: f64,
}

impl Default for LoopMetrics {
    fn default() -> Self {
        Self {
            cycles: 0,
            empty_batches: 0,
            overflows: 0,
            overruns: 0,
            min_cycle_time_margin_ns: f64::INFINITY,
        }
    }
}

impl LoopMetrics {
    /// Record how much of the period a cycle's work used.
    /// Returns the time left until the deadline.
    pub fn record_cycle_time(&mut self, cycle_start: Instant, period: Duration) -> Duration {
        let elapsed = cycle_start.elapsed();
        let margin_ns = (period.as_secs_f64() - elapsed.as_secs_f64()) * 1e9;
        self.min_cycle_time_margin_ns = self.min_cycle_time_margin_ns.min(margin_ns);
        if elapsed > period {
            self.overruns += 1;
        }
        period.saturating_sub(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_halves_rate() {
        let mut rate = SamplingRate::new(40, 10);
        assert_eq!(rate.degrade(), Some(20));
        assert_eq!(rate.hz(), 20);
        assert_eq!(rate.period(), Duration::from_millis(50));
    }

    #[test]
    fn overflow_floors_at_minimum() {
        let mut rate = SamplingRate::new(15, 10);
        assert_eq!(rate.degrade(), Some(10));
        assert_eq!(rate.hz(), 10);

        // Already at the floor
        assert_eq!(rate.degrade(), None);
        assert_eq!(rate.hz(), 10);
    }

    #[test]
    fn repeated_overflows_walk_down_to_floor() {
        let mut rate = SamplingRate::new(1000, 10);
        let mut seen = vec![];
        while let Some(hz) = rate.degrade() {
            seen.push(hz);
        }
        assert_eq!(seen, vec![500, 250, 125, 62, 31, 15, 10]);
    }

    #[test]
    fn starting_rate_below_floor_is_raised() {
        let rate = SamplingRate::new(5, 10);
        assert_eq!(rate.hz(), 10);
        assert_eq!(SamplingRate::new(5, 0).floor_hz(), 1);
    }

    #[test]
    fn overrun_is_counted() {
        let mut m = LoopMetrics::default();
        let start = Instant::now() - Duration::from_millis(20);
        let left = m.record_cycle_time(start, Duration::from_millis(10));
        assert_eq!(left, Duration::ZERO);
        assert_eq!(m.overruns, 1);
        assert!(m.min_cycle_time_margin_ns < 0.0);

        let left = m.record_cycle_time(Instant::now(), Duration::from_secs(10));
        assert!(left > Duration::from_secs(9));
        assert_eq!(m.overruns, 1);
    }
}
