//! Peripherals are the external analog I/O hardware, usually a DAQ.
//!
//! The control loop only sees a [`HardwarePort`]. Device drivers implement
//! the trait outside this crate; [`hootl::HootlDaq`] implements it in software
//! so that the loop can run with no hardware in the loop.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::calc::OutputBounds;

pub mod hootl;
pub use hootl::{HootlDaq, HootlFault, HootlProbe, PlantModel, ProbeCounts};

/// Device name as reported by the driver, like `Dev1`
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct DeviceId(pub String);

/// Physical channel name as reported by the driver, like `Dev1/ai0`
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of physical channel
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    AnalogInput,
    AnalogOutput,
}

/// Failures reported by a hardware port
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum PortError {
    /// The input buffer filled before it was drained
    #[error("input buffer overflow")]
    Overflow,

    /// Any other read or write failure
    #[error("{0}")]
    Hardware(String),

    /// The port rejected a channel or timing setting
    #[error("{0}")]
    Configuration(String),
}

/// Sample-clock settings for the input channel
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputTiming {
    pub sampling_rate_hz: u32,

    /// Number of samples requested per read
    pub samples_per_cycle: usize,

    /// Device-side buffer size in samples
    pub buffer_size: usize,
}

/// Object-safe boundary between the control loop and the acquisition hardware.
///
/// A port is owned by one loop thread at a time.
pub trait HardwarePort: Send {
    /// Names of attached devices
    fn list_devices(&self) -> Result<Vec<DeviceId>, PortError>;

    /// Physical channels of a device in one direction
    fn list_channels(
        &self,
        device: &DeviceId,
        direction: Direction,
    ) -> Result<Vec<ChannelId>, PortError>;

    /// Set up continuous sampling on an input channel.
    /// May be called again on a configured port to change the timing.
    fn configure_input(&mut self, channel: &ChannelId, timing: InputTiming)
    -> Result<(), PortError>;

    /// Set up an on-demand output channel with its voltage range
    fn configure_output(
        &mut self,
        _channel: &ChannelId,
        _bounds: OutputBounds,
    ) -> Result<(), PortError> {
        Ok(())
    }

    /// Replace the contents of `buf` with the next batch of input samples,
    /// oldest first. The batch may be empty.
    fn read_batch(&mut self, buf: &mut Vec<f64>) -> Result<(), PortError>;

    /// Write a single value to an output channel
    fn write_one(&mut self, channel: &ChannelId, value: f64) -> Result<(), PortError>;

    /// Stop and clear any tasks. Idempotent.
    fn release(&mut self);
}

/// Check that a channel is offered by one of the port's devices.
pub fn find_channel(
    port: &dyn HardwarePort,
    channel: &ChannelId,
    direction: Direction,
) -> Result<DeviceId, PortError> {
    let devices = port.list_devices()?;
    if devices.is_empty() {
        return Err(PortError::Configuration("No devices available".to_owned()));
    }

    for device in devices {
        if port.list_channels(&device, direction)?.contains(channel) {
            return Ok(device);
        }
    }

    Err(PortError::Configuration(format!(
        "Channel `{channel}` is not an available {direction:?} channel"
    )))
}

/// Input and output channels held for one session.
///
/// Dropping the guard releases the port, on every exit path.
pub struct AcquiredChannels<'a> {
    port: &'a mut dyn HardwarePort,
    input: ChannelId,
    output: ChannelId,
}

impl<'a> AcquiredChannels<'a> {
    /// Validate the channels and configure them for a session.
    /// If any step fails, the port is released before returning.
    pub fn acquire(
        port: &'a mut dyn HardwarePort,
        input: &ChannelId,
        output: &ChannelId,
        timing: InputTiming,
        bounds: OutputBounds,
    ) -> Result<Self, PortError> {
        let mut guard = Self {
            port,
            input: input.clone(),
            output: output.clone(),
        };

        let in_dev = find_channel(&*guard.port, input, Direction::AnalogInput)?;
        let out_dev = find_channel(&*guard.port, output, Direction::AnalogOutput)?;
        debug!("Found input `{input}` on {in_dev} and output `{output}` on {out_dev}");

        guard.port.configure_input(input, timing)?;
        guard.port.configure_output(output, bounds)?;
        info!(
            "Acquired `{input}` at {} Hz ({} samples per read) and `{output}` in [{}, {}] V",
            timing.sampling_rate_hz, timing.samples_per_cycle, bounds.min, bounds.max
        );

        Ok(guard)
    }

    pub fn input(&self) -> &ChannelId {
        &self.input
    }

    pub fn output(&self) -> &ChannelId {
        &self.output
    }

    pub fn read_batch(&mut self, buf: &mut Vec<f64>) -> Result<(), PortError> {
        self.port.read_batch(buf)
    }

    pub fn write(&mut self, value: f64) -> Result<(), PortError> {
        self.port.write_one(&self.output, value)
    }

    /// Change the input sample clock mid-session
    pub fn reconfigure_input(&mut self, timing: InputTiming) -> Result<(), PortError> {
        self.port.configure_input(&self.input, timing)
    }
}

impl Drop for AcquiredChannels<'_> {
    fn drop(&mut self) {
        self.port.release();
        info!("Released `{}` and `{}`", self.input, self.output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> InputTiming {
        InputTiming {
            sampling_rate_hz: 100,
            samples_per_cycle: 1,
            buffer_size: 1000,
        }
    }

    #[test]
    fn acquire_and_drop_releases_once() {
        let mut daq = HootlDaq::new();
        let probe = daq.probe();
        {
            let mut ch = AcquiredChannels::acquire(
                &mut daq,
                &"SimDev1/ai0".into(),
                &"SimDev1/ao0".into(),
                timing(),
                OutputBounds::default(),
            )
            .unwrap();
            ch.write(1.0).unwrap();
            assert_eq!(probe.snapshot().releases, 0);
        }
        let counts = probe.snapshot();
        assert_eq!(counts.releases, 1);
        assert_eq!(counts.last_written, Some(1.0));
    }

    #[test]
    fn unknown_channel_is_a_configuration_error_and_releases() {
        let mut daq = HootlDaq::new();
        let probe = daq.probe();
        let res = AcquiredChannels::acquire(
            &mut daq,
            &"SimDev1/ai9".into(),
            &"SimDev1/ao0".into(),
            timing(),
            OutputBounds::default(),
        );
        assert!(matches!(res, Err(PortError::Configuration(_))));
        assert_eq!(probe.snapshot().releases, 1);
    }

    #[test]
    fn output_channel_must_be_an_output() {
        let daq = HootlDaq::new();
        let res = find_channel(&daq, &"SimDev1/ai0".into(), Direction::AnalogOutput);
        assert!(res.is_err());
        let dev = find_channel(&daq, &"SimDev1/ai0".into(), Direction::AnalogInput).unwrap();
        assert_eq!(dev, DeviceId::from("SimDev1"));
    }

    #[test]
    fn no_devices_is_a_configuration_error() {
        let daq = HootlDaq::new().offline();
        let res = find_channel(&daq, &"SimDev1/ai0".into(), Direction::AnalogInput);
        assert!(matches!(res, Err(PortError::Configuration(_))));
    }
}
