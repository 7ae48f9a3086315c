//! Dispatchers send telemetry from the control loop to an outside consumer,
//! usually a display.
//!
//! Delivery is fire-and-forget. A sink must return quickly and must not
//! block the loop thread; if a consumer cannot keep up, events are dropped.

use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod channel;
pub use channel::ChannelDispatcher;
mod latest;
pub use latest::{LatestValueDispatcher, LatestValueHandle, Snapshot};

/// What happened during a cycle, or to the session
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum TelemetryKind {
    /// Most recent sample of the input channel, in volts
    Measured(f64),

    /// Value written to the output channel, in volts
    Output(f64),

    /// Sampling rate lowered after an input buffer overflow
    RateChanged { from_hz: u32, to_hz: u32 },

    /// The session ended on a fatal hardware error
    SessionTerminated { reason: String },
}

/// A timestamped telemetry event.
///
/// Within a session, `Measured` is always published before the
/// `Output` computed from it, and both share a cycle number.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TelemetryEvent {
    pub system_time: String,
    pub cycle: u64,
    pub kind: TelemetryKind,
}

impl TelemetryEvent {
    pub fn new(time: SystemTime, cycle: u64, kind: TelemetryKind) -> Self {
        Self {
            system_time: fmt_time(time),
            cycle,
            kind,
        }
    }
}

/// A telemetry consumer fed by the control loop one event at a time.
pub trait Dispatcher: Send {
    /// Set up the dispatcher at the start of a session
    fn init(&mut self, op_name: &str) -> Result<(), String> {
        let _ = op_name;
        Ok(())
    }

    /// Ingest an event. Must not block.
    fn consume(&mut self, event: &TelemetryEvent);

    /// Shut down the dispatcher and reset internal state for the next session
    fn terminate(&mut self) -> Result<(), String> {
        Ok(())
    }
}

/// Fixed-width ISO-8601 UTC timestamp with zero-padded sub-second nanoseconds and Z-suffix
pub fn fmt_time(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}
