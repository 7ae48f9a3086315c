//! Property tests for the controller and the overflow policy.

use std::time::{Duration, Instant};

use daqloop::calc::{MIN_DT, OutputBounds, Pid, PidConfig, PidGains};
use daqloop::controller::SamplingRate;
use proptest::prelude::*;

fn arb_config() -> impl Strategy<Value = PidConfig> {
    (
        -10.0..10.0f64,
        -10.0..10.0f64,
        -1.0..1.0f64,
        -10.0..10.0f64,
        0.0..10.0f64,
        0.01..5.0f64,
    )
        .prop_map(|(kp, ki, kd, min, span, integral_limit)| PidConfig {
            gains: PidGains::new(kp, ki, kd),
            output_bounds: OutputBounds::new(min, min + span).unwrap(),
            integral_limit,
        })
}

/// Measurements paired with the time since the previous update, in microseconds
fn arb_samples() -> impl Strategy<Value = Vec<(f64, u64)>> {
    proptest::collection::vec(
        (
            prop_oneof![
                8 => -1e3..1e3f64,
                1 => Just(f64::NAN),
                1 => Just(f64::INFINITY),
            ],
            0u64..50_000,
        ),
        1..64,
    )
}

proptest! {
    /// Whatever the gains, measurements, or timing, the output stays in range.
    #[test]
    fn output_is_always_within_bounds(
        cfg in arb_config(),
        setpoint in -100.0..100.0f64,
        samples in arb_samples(),
    ) {
        let t0 = Instant::now();
        let mut pid = Pid::new_at(cfg, t0).unwrap();
        pid.set_setpoint_at(setpoint, t0);

        let mut t = t0;
        for (measurement, dt_us) in samples {
            t += Duration::from_micros(dt_us);
            let out = pid.compute(measurement, t);
            prop_assert!(out.is_finite());
            prop_assert!(cfg.output_bounds.contains(out), "{out} outside {:?}", cfg.output_bounds);
        }
    }

    /// The integral term never exceeds the configured limit in magnitude,
    /// while the accumulator keeps the full running sum.
    #[test]
    fn integral_term_is_saturated(
        cfg in arb_config(),
        setpoint in -100.0..100.0f64,
        samples in proptest::collection::vec((-100.0..100.0f64, 1u64..100_000), 1..64),
    ) {
        let t0 = Instant::now();
        let mut pid = Pid::new_at(cfg, t0).unwrap();
        pid.set_setpoint_at(setpoint, t0);

        let mut t = t0;
        let mut sum = 0.0;
        for (measurement, dt_us) in samples {
            t += Duration::from_micros(dt_us);
            pid.compute(measurement, t);
            sum += (setpoint - measurement) * (dt_us as f64 * 1e-6);
            prop_assert!(pid.last_terms().integral.abs() <= cfg.integral_limit + 1e-12);
            prop_assert!((pid.integral_accumulator() - sum).abs() < 1e-6 * (1.0 + sum.abs()));
        }
    }

    /// A setpoint change clears history: the next update sees no derivative
    /// kick and an integral built from that update alone.
    #[test]
    fn setpoint_change_resets_history(
        cfg in arb_config(),
        before in proptest::collection::vec(-100.0..100.0f64, 1..16),
        setpoint in -100.0..100.0f64,
        measurement in -100.0..100.0f64,
    ) {
        let t0 = Instant::now();
        let mut pid = Pid::new_at(cfg, t0).unwrap();
        let mut t = t0;
        for m in before {
            t += Duration::from_millis(5);
            pid.compute(m, t);
        }

        pid.set_setpoint_at(setpoint, t);
        prop_assert_eq!(pid.integral_accumulator(), 0.0);
        prop_assert_eq!(pid.previous_error(), 0.0);
        prop_assert!(pid.previous_measurement().is_none());

        pid.compute(measurement, t + Duration::from_millis(10));
        let terms = pid.last_terms();
        prop_assert_eq!(terms.derivative, 0.0);

        let expected = (setpoint - measurement) * 0.010;
        prop_assert!((pid.integral_accumulator() - expected).abs() < 1e-9);
    }

    /// Any positive step is used exactly; only a timestamp that does not
    /// advance falls back to the minimum interval.
    #[test]
    fn positive_time_step_is_used_exactly(
        cfg in arb_config(),
        dt_us in 0u64..2_000,
    ) {
        let t0 = Instant::now();
        let mut pid = Pid::new_at(cfg, t0).unwrap();
        let dt = Duration::from_micros(dt_us);
        pid.compute(0.5, t0 + dt);

        let expected = if dt.is_zero() { MIN_DT } else { dt };
        prop_assert_eq!(pid.last_terms().dt_s, expected.as_secs_f64());
    }

    /// Each overflow halves the rate, never dropping below the floor,
    /// and at the floor the rate stays put.
    #[test]
    fn overflow_policy_halves_down_to_floor(
        hz in 1u32..100_000,
        floor in 1u32..1_000,
        overflows in 1usize..40,
    ) {
        let mut rate = SamplingRate::new(hz, floor);
        for _ in 0..overflows {
            let before = rate.hz();
            let changed = rate.degrade();
            let expected = (before / 2).max(rate.floor_hz());
            prop_assert_eq!(rate.hz(), expected);
            prop_assert!(rate.hz() >= rate.floor_hz());
            prop_assert_eq!(changed.is_some(), expected != before);
        }
    }
}
