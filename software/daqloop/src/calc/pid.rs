//! A PID controller with derivative-on-measurement
//! and simple saturation of the integral term for anti-windup

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::LoopError;

/// Time step used by an update whose timestamp does not advance
/// past the previous one. Any positive elapsed time is used as-is.
pub const MIN_DT: Duration = Duration::from_millis(1);

/// Proportional, integral, and derivative gains
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 0.85,
            ki: 0.9,
            kd: 0.03,
        }
    }
}

/// Fixed actuator range. `min <= max` is guaranteed for any value
/// built with [`OutputBounds::new`] or validated through [`PidConfig::validate`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct OutputBounds {
    pub min: f64,
    pub max: f64,
}

impl OutputBounds {
    pub fn new(min: f64, max: f64) -> Result<Self, LoopError> {
        let bounds = Self { min, max };
        bounds.validate()?;
        Ok(bounds)
    }

    fn validate(&self) -> Result<(), LoopError> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(LoopError::Configuration(format!(
                "Output bounds must be finite, got [{}, {}]",
                self.min, self.max
            )));
        }
        if self.min > self.max {
            return Err(LoopError::Configuration(format!(
                "Output bound min {} exceeds max {}",
                self.min, self.max
            )));
        }
        Ok(())
    }

    /// Saturate a value to the actuator range
    pub fn clamp(&self, v: f64) -> f64 {
        v.max(self.min).min(self.max)
    }

    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && v <= self.max
    }
}

impl Default for OutputBounds {
    fn default() -> Self {
        Self { min: 0.0, max: 5.0 }
    }
}

/// Controller settings, fixed for the duration of a session.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct PidConfig {
    pub gains: PidGains,
    pub output_bounds: OutputBounds,

    /// Symmetric limit on the integral term's contribution to the output.
    /// Independent of `output_bounds`.
    pub integral_limit: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            gains: PidGains::default(),
            output_bounds: OutputBounds::default(),
            integral_limit: 1.0,
        }
    }
}

impl PidConfig {
    pub fn validate(&self) -> Result<(), LoopError> {
        let PidGains { kp, ki, kd } = self.gains;
        if !(kp.is_finite() && ki.is_finite() && kd.is_finite()) {
            return Err(LoopError::Configuration(format!(
                "PID gains must be finite, got kp={kp}, ki={ki}, kd={kd}"
            )));
        }
        if !(self.integral_limit.is_finite() && self.integral_limit > 0.0) {
            return Err(LoopError::Configuration(format!(
                "Integral limit must be positive and finite, got {}",
                self.integral_limit
            )));
        }
        self.output_bounds.validate()
    }
}

/// Breakdown of the most recent update
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PidTerms {
    pub dt_s: f64,
    pub error: f64,
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
    pub output: f64,
}

/// PID controller driving a single actuator toward a setpoint.
///
/// The derivative is taken on the measurement rather than the error,
/// so a setpoint change does not produce a derivative kick.
/// The integral term is saturated to `integral_limit`; the accumulator
/// behind it is the plain running sum of error * dt.
///
/// The controller does no I/O and keeps no clock of its own;
/// every update takes the caller's timestamp.
#[derive(Debug, Clone)]
pub struct Pid {
    cfg: PidConfig,
    setpoint: f64,

    // Internal state
    integral: f64,
    prev_error: f64,
    prev_measurement: Option<f64>,
    last_update: Instant,
    last: PidTerms,
}

impl Pid {
    /// Build a controller with a zero setpoint, timestamped now.
    pub fn new(cfg: PidConfig) -> Result<Self, LoopError> {
        Self::new_at(cfg, Instant::now())
    }

    /// Build a controller with a zero setpoint and an explicit start time.
    pub fn new_at(cfg: PidConfig, now: Instant) -> Result<Self, LoopError> {
        cfg.validate()?;
        let output = cfg.output_bounds.clamp(0.0);
        Ok(Self {
            cfg,
            setpoint: 0.0,
            integral: 0.0,
            prev_error: 0.0,
            prev_measurement: None,
            last_update: now,
            last: PidTerms {
                output,
                ..Default::default()
            },
        })
    }

    pub fn config(&self) -> &PidConfig {
        &self.cfg
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    /// Running sum of error * dt
    pub fn integral_accumulator(&self) -> f64 {
        self.integral
    }

    pub fn previous_error(&self) -> f64 {
        self.prev_error
    }

    pub fn previous_measurement(&self) -> Option<f64> {
        self.prev_measurement
    }

    /// Terms computed by the latest call to [`Pid::compute`]
    pub fn last_terms(&self) -> PidTerms {
        self.last
    }

    /// Replace the setpoint and clear integral and derivative history.
    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.set_setpoint_at(setpoint, Instant::now());
    }

    /// Replace the setpoint and clear history, restarting the time base at `now`.
    pub fn set_setpoint_at(&mut self, setpoint: f64, now: Instant) {
        self.setpoint = setpoint;
        self.integral = 0.0;
        self.prev_error = 0.0;
        self.prev_measurement = None;
        self.last_update = now;
    }

    /// Run one update and return the saturated output.
    ///
    /// Never fails. The result is always inside the output bounds;
    /// a non-finite measurement leaves the state untouched and repeats
    /// the previous output.
    pub fn compute(&mut self, measurement: f64, now: Instant) -> f64 {
        if !measurement.is_finite() {
            return self.last.output;
        }

        let elapsed = now.saturating_duration_since(self.last_update);
        let dt_s = if elapsed.is_zero() { MIN_DT } else { elapsed }.as_secs_f64();
        let PidGains { kp, ki, kd } = self.cfg.gains;
        let limit = self.cfg.integral_limit;

        let error = self.setpoint - measurement;
        let proportional = kp * error;

        // Anti-windup saturation
        self.integral += error * dt_s;
        let integral = (ki * self.integral).max(-limit).min(limit);

        let derivative = match self.prev_measurement {
            Some(prev) => -kd * (measurement - prev) / dt_s,
            None => 0.0,
        };

        let raw = proportional + integral + derivative;
        let output = if raw.is_nan() {
            self.last.output
        } else {
            self.cfg.output_bounds.clamp(raw)
        };

        self.prev_error = error;
        self.prev_measurement = Some(measurement);
        self.last_update = now;
        self.last = PidTerms {
            dt_s,
            error,
            proportional,
            integral,
            derivative,
            output,
        };

        output
    }
}
