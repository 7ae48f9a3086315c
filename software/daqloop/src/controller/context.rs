//! Settings for a control session
//! that may be used by the controller's appendages.

use std::default::Default;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

use serde::{Deserialize, Serialize};

use crate::LoopError;
use crate::calc::PidConfig;
use crate::peripheral::{ChannelId, InputTiming};

/// Largest batch read in one cycle. The loop preallocates a buffer this size.
pub const MAX_SAMPLES_PER_CYCLE: usize = 100_000;

/// Configuration supplied once per session.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
#[non_exhaustive]
pub struct LoopConfig {
    /// Analog input sampled for the measured value
    pub input_channel: ChannelId,

    /// Analog output driven with the controller output
    pub output_channel: ChannelId,

    /// Input sample clock and control cycle rate at the start of the session.
    /// The loop halves its working copy on input buffer overflow.
    pub sampling_rate_hz: u32,

    /// Floor for the overflow-degraded sampling rate
    pub min_sampling_rate_hz: u32,

    /// Number of samples requested per read
    pub samples_per_cycle: usize,

    /// Device-side input buffer size in samples
    pub input_buffer_size: usize,

    /// Controller gains, output range, and integral limit
    pub pid: PidConfig,

    /// Target for the measured value when the session starts
    pub initial_setpoint: f64,

    /// A name for this session, used for the log file
    pub op_name: String,

    /// A directory to place outputs
    pub op_dir: PathBuf,

    /// Pin the loop thread to a core and raise its priority
    /// (requires the `affinity` feature)
    pub pin_thread: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        // Use current time with seconds as op name and use working directory as op dir,
        // replacing characters in the name that would be invalid on Windows.
        let op_name = DateTime::<Utc>::from(SystemTime::now())
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            .replace(":", "");
        Self {
            input_channel: ChannelId::default(),
            output_channel: ChannelId::default(),
            sampling_rate_hz: 1000,
            min_sampling_rate_hz: 10,
            samples_per_cycle: 1,
            input_buffer_size: 1000,
            pid: PidConfig::default(),
            initial_setpoint: 0.0,
            op_name,
            op_dir: std::fs::canonicalize("./").unwrap_or_default(),
            pin_thread: false,
        }
    }
}

impl LoopConfig {
    /// Default settings for a pair of channels
    pub fn new(input_channel: &str, output_channel: &str, sampling_rate_hz: u32) -> Self {
        Self {
            input_channel: input_channel.into(),
            output_channel: output_channel.into(),
            sampling_rate_hz,
            ..Default::default()
        }
    }

    pub fn with_pid(mut self, pid: PidConfig) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_setpoint(mut self, setpoint: f64) -> Self {
        self.initial_setpoint = setpoint;
        self
    }

    pub fn with_samples_per_cycle(mut self, n: usize) -> Self {
        self.samples_per_cycle = n;
        self
    }

    pub fn with_min_sampling_rate_hz(mut self, hz: u32) -> Self {
        self.min_sampling_rate_hz = hz;
        self
    }

    /// Check everything that can be checked without touching hardware
    pub fn validate(&self) -> Result<(), LoopError> {
        let err = |msg: String| Err(LoopError::Configuration(msg));

        if self.input_channel.is_empty() {
            return err("Input channel is not set".to_owned());
        }
        if self.output_channel.is_empty() {
            return err("Output channel is not set".to_owned());
        }
        if self.sampling_rate_hz == 0 {
            return err("Sampling rate must be positive".to_owned());
        }
        if self.min_sampling_rate_hz == 0 {
            return err("Minimum sampling rate must be positive".to_owned());
        }
        if self.min_sampling_rate_hz > self.sampling_rate_hz {
            return err(format!(
                "Minimum sampling rate {} Hz exceeds sampling rate {} Hz",
                self.min_sampling_rate_hz, self.sampling_rate_hz
            ));
        }
        if self.samples_per_cycle == 0 {
            return err("Samples per cycle must be positive".to_owned());
        }
        if self.samples_per_cycle > MAX_SAMPLES_PER_CYCLE {
            return err(format!(
                "Batch of {} samples exceeds the limit of {MAX_SAMPLES_PER_CYCLE}",
                self.samples_per_cycle
            ));
        }
        if !self.initial_setpoint.is_finite() {
            return err(format!("Setpoint {} is not finite", self.initial_setpoint));
        }
        if self.input_buffer_size < self.samples_per_cycle {
            return err(format!(
                "Input buffer of {} samples cannot hold a batch of {}",
                self.input_buffer_size, self.samples_per_cycle
            ));
        }
        self.pid.validate()
    }

    /// Input timing at a given sampling rate
    pub fn input_timing(&self, sampling_rate_hz: u32) -> InputTiming {
        InputTiming {
            sampling_rate_hz,
            samples_per_cycle: self.samples_per_cycle,
            buffer_size: self.input_buffer_size,
        }
    }

    /// Cycle period at the configured starting rate
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.sampling_rate_hz.max(1) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_once_channels_are_set() {
        let cfg = LoopConfig::default();
        assert!(matches!(cfg.validate(), Err(LoopError::Configuration(_))));

        let cfg = LoopConfig::new("Dev1/ai0", "Dev1/ao0", 1000);
        cfg.validate().unwrap();
        assert_eq!(cfg.samples_per_cycle, 1);
        assert_eq!(cfg.min_sampling_rate_hz, 10);
        assert_eq!(cfg.period(), Duration::from_millis(1));
        assert!(!cfg.op_name.contains(':'));
    }

    #[test]
    fn rejects_bad_rates_and_batches() {
        let base = LoopConfig::new("Dev1/ai0", "Dev1/ao0", 100);

        let mut cfg = base.clone();
        cfg.sampling_rate_hz = 0;
        assert!(cfg.validate().is_err());

        let cfg = base.clone().with_min_sampling_rate_hz(200);
        assert!(cfg.validate().is_err());

        let cfg = base.clone().with_samples_per_cycle(0);
        assert!(cfg.validate().is_err());

        let mut cfg = base.clone().with_samples_per_cycle(10);
        cfg.input_buffer_size = 5;
        assert!(cfg.validate().is_err());

        // Oversized batches are refused before any buffer is allocated
        let mut cfg = base.clone().with_samples_per_cycle(MAX_SAMPLES_PER_CYCLE + 1);
        cfg.input_buffer_size = usize::MAX;
        assert!(cfg.validate().is_err());
        let mut cfg = base.clone().with_samples_per_cycle(MAX_SAMPLES_PER_CYCLE);
        cfg.input_buffer_size = MAX_SAMPLES_PER_CYCLE;
        cfg.validate().unwrap();

        let mut cfg = base;
        cfg.pid.output_bounds.min = 10.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_json_takes_defaults() {
        let cfg: LoopConfig = serde_json::from_str(
            r#"{
                "input_channel": "Dev1/ai0",
                "output_channel": "Dev1/ao0",
                "sampling_rate_hz": 40
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.input_channel, ChannelId::from("Dev1/ai0"));
        assert_eq!(cfg.sampling_rate_hz, 40);
        assert_eq!(cfg.input_buffer_size, 1000);
        cfg.validate().unwrap();

        let s = serde_json::to_string(&cfg).unwrap();
        let back: LoopConfig = serde_json::from_str(&s).unwrap();
        assert_eq!(back.pid, cfg.pid);
        assert_eq!(back.op_name, cfg.op_name);
    }
}
