//! Closed-loop PID control of a single analog output from a single analog input
//! on a data-acquisition device.
//!
//! A [`ControlLoop`] owns a [`HardwarePort`] and runs each control session on
//! its own thread, publishing telemetry to any number of [`Dispatcher`]s.

pub mod calc;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod peripheral;

pub use calc::{OutputBounds, Pid, PidConfig, PidGains};
pub use controller::{
    ControlLoop, LoopConfig, RunState, SessionExit, SessionSummary, SetpointHandle,
};
pub use dispatcher::{Dispatcher, TelemetryEvent, TelemetryKind};
pub use error::LoopError;
pub use peripheral::{ChannelId, DeviceId, Direction, HardwarePort, PortError};
