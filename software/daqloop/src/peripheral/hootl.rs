//! Hardware-out-of-the-loop DAQ: a software port with a simulated plant.
//!
//! The analog output drives a first-order plant whose voltage is sampled
//! by the analog input. Faults can be scheduled on specific reads or writes,
//! and a shared [`HootlProbe`] lets a test observe the port after it has been
//! moved into the control loop thread.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ChannelId, DeviceId, Direction, HardwarePort, InputTiming, PortError};
use crate::calc::OutputBounds;

const N_INPUTS: usize = 4;
const N_OUTPUTS: usize = 2;

/// First-order response of the simulated plant.
/// The measured voltage relaxes toward `gain * output + offset`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct PlantModel {
    pub gain: f64,
    pub time_constant_s: f64,
    pub offset: f64,
}

impl Default for PlantModel {
    fn default() -> Self {
        Self {
            gain: 1.0,
            time_constant_s: 0.05,
            offset: 0.0,
        }
    }
}

impl PlantModel {
    /// Advance the plant state by `dt_s` with a constant drive
    fn step(&self, v: f64, drive: f64, dt_s: f64) -> f64 {
        let target = self.gain * drive + self.offset;
        if self.time_constant_s <= 0.0 {
            return target;
        }
        let alpha = 1.0 - (-dt_s / self.time_constant_s).exp();
        v + (target - v) * alpha
    }
}

/// A fault to return from a scheduled read or write
#[derive(Clone, Debug, PartialEq)]
pub enum HootlFault {
    Overflow,
    Hardware(String),
}

impl From<HootlFault> for PortError {
    fn from(f: HootlFault) -> Self {
        match f {
            HootlFault::Overflow => PortError::Overflow,
            HootlFault::Hardware(msg) => PortError::Hardware(msg),
        }
    }
}

/// Counters and last-seen values of a simulated port
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProbeCounts {
    pub reads: u64,
    pub writes: u64,
    pub releases: u64,

    /// Every input sample rate the port was configured with, in order
    pub configured_rates_hz: Vec<u32>,
    pub last_written: Option<f64>,
    pub last_sample: Option<f64>,
}

/// Cloneable view of a [`HootlDaq`]'s counters
#[derive(Clone, Debug, Default)]
pub struct HootlProbe {
    inner: Arc<Mutex<ProbeCounts>>,
}

impl HootlProbe {
    /// Copy of the current counters
    pub fn snapshot(&self) -> ProbeCounts {
        self.inner
            .lock()
            .map(|c| c.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn update<T>(&self, f: impl FnOnce(&mut ProbeCounts) -> T) -> T {
        let mut counts = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut counts)
    }
}

/// Increment a counter, returning its previous value
fn next_index(counter: &mut u64) -> u64 {
    let index = *counter;
    *counter += 1;
    index
}

/// Run-time state that only exists while the input is configured
#[derive(Debug)]
struct SimState {
    timing: InputTiming,
    voltage: f64,
    last_step: Instant,
}

/// Software DAQ with one device, `SimDev1`, offering `ai0..ai3` and `ao0..ao1`.
#[derive(Debug)]
pub struct HootlDaq {
    device: DeviceId,
    online: bool,
    plant: PlantModel,

    /// Output voltages, one per output channel
    drive: [f64; N_OUTPUTS],
    sim: Option<SimState>,

    read_faults: BTreeMap<u64, HootlFault>,
    write_faults: BTreeMap<u64, HootlFault>,
    empty_reads: BTreeSet<u64>,
    probe: HootlProbe,
}

impl Default for HootlDaq {
    fn default() -> Self {
        Self::new()
    }
}

impl HootlDaq {
    pub fn new() -> Self {
        Self {
            device: DeviceId::from("SimDev1"),
            online: true,
            plant: PlantModel::default(),
            drive: [0.0; N_OUTPUTS],
            sim: None,
            read_faults: BTreeMap::new(),
            write_faults: BTreeMap::new(),
            empty_reads: BTreeSet::new(),
            probe: HootlProbe::default(),
        }
    }

    /// Use a different plant response
    pub fn with_plant(mut self, plant: PlantModel) -> Self {
        self.plant = plant;
        self
    }

    /// Fail the read with this 0-based index (counted over the port's lifetime)
    pub fn with_read_fault(mut self, read_index: u64, fault: HootlFault) -> Self {
        self.read_faults.insert(read_index, fault);
        self
    }

    /// Fail the write with this 0-based index (counted over the port's lifetime)
    pub fn with_write_fault(mut self, write_index: u64, fault: HootlFault) -> Self {
        self.write_faults.insert(write_index, fault);
        self
    }

    /// Return no samples from the read with this 0-based index
    pub fn with_empty_read(mut self, read_index: u64) -> Self {
        self.empty_reads.insert(read_index);
        self
    }

    /// Report no attached devices
    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    /// Handle for observing the port from another thread
    pub fn probe(&self) -> HootlProbe {
        self.probe.clone()
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    fn channel_names(&self, direction: Direction) -> Vec<ChannelId> {
        let (prefix, n) = match direction {
            Direction::AnalogInput => ("ai", N_INPUTS),
            Direction::AnalogOutput => ("ao", N_OUTPUTS),
        };
        (0..n)
            .map(|i| ChannelId(format!("{}/{prefix}{i}", self.device)))
            .collect()
    }

    fn output_index(&self, channel: &ChannelId) -> Option<usize> {
        self.channel_names(Direction::AnalogOutput)
            .iter()
            .position(|c| c == channel)
    }
}

impl HardwarePort for HootlDaq {
    fn list_devices(&self) -> Result<Vec<DeviceId>, PortError> {
        if self.online {
            Ok(vec![self.device.clone()])
        } else {
            Ok(Vec::new())
        }
    }

    fn list_channels(
        &self,
        device: &DeviceId,
        direction: Direction,
    ) -> Result<Vec<ChannelId>, PortError> {
        if !self.online || device != &self.device {
            return Err(PortError::Configuration(format!("Unknown device `{device}`")));
        }
        Ok(self.channel_names(direction))
    }

    fn configure_input(
        &mut self,
        channel: &ChannelId,
        timing: InputTiming,
    ) -> Result<(), PortError> {
        if !self
            .channel_names(Direction::AnalogInput)
            .contains(channel)
        {
            return Err(PortError::Configuration(format!(
                "Unknown input channel `{channel}`"
            )));
        }
        if timing.sampling_rate_hz == 0 || timing.samples_per_cycle == 0 {
            return Err(PortError::Configuration(format!(
                "Invalid input timing {timing:?}"
            )));
        }

        // Reconfiguring keeps the plant where it is
        let voltage = self.sim.as_ref().map_or(self.plant.offset, |s| s.voltage);
        self.sim = Some(SimState {
            timing,
            voltage,
            last_step: Instant::now(),
        });
        self.probe
            .update(|c| c.configured_rates_hz.push(timing.sampling_rate_hz));
        debug!("HOOTL DAQ sampling `{channel}` at {} Hz", timing.sampling_rate_hz);
        Ok(())
    }

    fn configure_output(
        &mut self,
        channel: &ChannelId,
        _bounds: OutputBounds,
    ) -> Result<(), PortError> {
        match self.output_index(channel) {
            Some(_) => Ok(()),
            None => Err(PortError::Configuration(format!(
                "Unknown output channel `{channel}`"
            ))),
        }
    }

    fn read_batch(&mut self, buf: &mut Vec<f64>) -> Result<(), PortError> {
        buf.clear();
        let index = self.probe.update(|c| next_index(&mut c.reads));

        if let Some(fault) = self.read_faults.remove(&index) {
            return Err(fault.into());
        }

        let drive = self.drive[0];
        let plant = self.plant;
        let sim = self
            .sim
            .as_mut()
            .ok_or_else(|| PortError::Hardware("Input task is not configured".to_owned()))?;

        if self.empty_reads.remove(&index) {
            return Ok(());
        }

        // Spread the elapsed time over the requested samples
        let now = Instant::now();
        let n = sim.timing.samples_per_cycle;
        let dt_s = now.duration_since(sim.last_step).as_secs_f64() / n as f64;
        for _ in 0..n {
            sim.voltage = plant.step(sim.voltage, drive, dt_s);
            buf.push(sim.voltage);
        }
        sim.last_step = now;

        let last = buf.last().copied();
        self.probe.update(|c| c.last_sample = last);
        Ok(())
    }

    fn write_one(&mut self, channel: &ChannelId, value: f64) -> Result<(), PortError> {
        let index = self.probe.update(|c| next_index(&mut c.writes));

        if let Some(fault) = self.write_faults.remove(&index) {
            return Err(fault.into());
        }

        let i = self.output_index(channel).ok_or_else(|| {
            PortError::Hardware(format!("Write to unknown output channel `{channel}`"))
        })?;
        self.drive[i] = value;
        self.probe.update(|c| c.last_written = Some(value));
        Ok(())
    }

    fn release(&mut self) {
        if self.sim.take().is_some() {
            info!("HOOTL DAQ stopped input task");
        }
        self.drive = [0.0; N_OUTPUTS];
        self.probe.update(|c| c.releases += 1);
    }
}
