//! Control loop: session lifecycle, the loop thread, and overflow recovery.
//!
//! A [`ControlLoop`] owns one hardware port. `start` moves the port onto a
//! dedicated thread which acquires the channels, then repeatedly reads a batch
//! of input samples, runs the PID controller on the newest sample, publishes
//! telemetry, and writes the output. `stop` joins the thread and takes the
//! port back for the next session.

mod context;
mod nonblocking;
mod timing;

pub use context::{LoopConfig, MAX_SAMPLES_PER_CYCLE};
pub use timing::{LoopMetrics, SamplingRate};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::LoopError;
use crate::calc::{Pid, PidTerms};
use crate::dispatcher::{Dispatcher, TelemetryEvent, TelemetryKind};
use crate::peripheral::{AcquiredChannels, HardwarePort, PortError};
use nonblocking::{ReadyFinishGuard, RunSignal, default_run_signal};

/// Lifecycle of a control session
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunState {
    /// No session. Hardware is released.
    #[default]
    Idle,

    /// Hardware is acquired and the loop is cycling.
    Running,

    /// A stop was requested or a fatal error occurred;
    /// the loop is finishing its current cycle and releasing hardware.
    Stopping,
}

/// How a session ended
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum SessionExit {
    /// Ended by a call to `stop`
    Stopped,

    /// Ended by a fatal hardware error
    Faulted(LoopError),
}

/// Report for one session, returned by [`ControlLoop::stop`]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionSummary {
    pub op_name: String,
    pub metrics: LoopMetrics,

    /// Sampling rate in effect when the session ended
    pub final_sampling_rate_hz: u32,

    /// Setpoint in effect when the session ended
    pub final_setpoint: f64,

    pub exit: SessionExit,
}

/// What the loop thread hands back when it exits
struct SessionEnd {
    port: Box<dyn HardwarePort>,
    dispatchers: Vec<Box<dyn Dispatcher>>,
    outcome: Result<SessionSummary, LoopError>,
}

/// Handles to a session that reached `Running`
struct Session {
    setpoint: SetpointHandle,
    join: JoinHandle<SessionEnd>,
}

/// Lock the controller, recovering from a panic on another thread.
/// The controller has no invariants that a partial update can break.
fn lock(pid: &Mutex<Pid>) -> MutexGuard<'_, Pid> {
    pid.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle for changing the setpoint of one session from another
/// thread, such as a user interface.
///
/// Goes inert when its session ends; a handle never reaches a later session.
#[derive(Clone)]
pub struct SetpointHandle {
    pid: Arc<Mutex<Pid>>,
    signal: Arc<RunSignal>,
}

impl SetpointHandle {
    /// Change the controller's setpoint.
    /// The next cycle runs against the new target with cleared history.
    ///
    /// Returns `false` and does nothing if the session is no longer running.
    pub fn set(&self, setpoint: f64) -> bool {
        if !self.signal.is_running() {
            debug!("Ignoring setpoint {setpoint} with no running session");
            return false;
        }
        lock(&self.pid).set_setpoint(setpoint);
        debug!("Setpoint changed to {setpoint}");
        true
    }

    pub fn get(&self) -> f64 {
        lock(&self.pid).setpoint()
    }
}

/// Owner of a hardware port and the thread that runs control sessions on it.
///
/// Start and stop are driven from one thread (`&mut self`); the setpoint may
/// be changed from any thread through a [`SetpointHandle`].
pub struct ControlLoop {
    /// Present whenever no session is running
    port: Option<Box<dyn HardwarePort>>,

    /// Telemetry sinks, lent to the loop thread for the duration of a session
    dispatchers: Vec<Box<dyn Dispatcher>>,

    signal: Arc<RunSignal>,
    session: Option<Session>,

    /// Report of a session that faulted and was joined before `stop`
    ended: Option<SessionSummary>,
}

impl ControlLoop {
    pub fn new<P: HardwarePort + 'static>(port: P) -> Self {
        Self::from_boxed(Box::new(port))
    }

    pub fn from_boxed(port: Box<dyn HardwarePort>) -> Self {
        Self {
            port: Some(port),
            dispatchers: Vec::new(),
            signal: default_run_signal(),
            session: None,
            ended: None,
        }
    }

    /// Register a telemetry sink for subsequent sessions.
    pub fn add_dispatcher(&mut self, dispatcher: Box<dyn Dispatcher>) -> Result<(), LoopError> {
        self.reclaim_finished();
        if self.session.is_some() {
            return Err(LoopError::AlreadyRunning);
        }
        self.dispatchers.push(dispatcher);
        Ok(())
    }

    pub fn state(&self) -> RunState {
        self.signal.run_state()
    }

    pub fn is_running(&self) -> bool {
        self.signal.is_running()
    }

    /// The hardware port, for listing devices and channels between sessions.
    /// `None` while a session holds it.
    pub fn port(&self) -> Option<&dyn HardwarePort> {
        if self.session.is_some() {
            return None;
        }
        self.port.as_deref()
    }

    /// Start a session with a controller built from `cfg.pid`.
    pub fn start(&mut self, cfg: LoopConfig) -> Result<(), LoopError> {
        let pid = Pid::new(cfg.pid)?;
        self.start_with_controller(cfg, pid)
    }

    /// Start a session driven by an existing controller.
    /// The controller's setpoint is replaced by `cfg.initial_setpoint`.
    ///
    /// Blocks until the loop thread has acquired the channels, so that an
    /// unknown channel or a device that is not present is returned here.
    pub fn start_with_controller(&mut self, cfg: LoopConfig, pid: Pid) -> Result<(), LoopError> {
        if self.state() != RunState::Idle {
            return Err(LoopError::AlreadyRunning);
        }

        self.reclaim_finished();
        if let Some(summary) = self.ended.take() {
            info!("Previous session ended: {:?}", summary.exit);
        }

        cfg.validate()?;
        let port = self.port.take().ok_or_else(|| {
            LoopError::Configuration("Hardware port was lost by a previous session".to_owned())
        })?;
        let dispatchers = std::mem::take(&mut self.dispatchers);

        info!(
            "Starting session {} with `{}` -> `{}` at {} Hz",
            cfg.op_name, cfg.input_channel, cfg.output_channel, cfg.sampling_rate_hz
        );

        let pid = Arc::new(Mutex::new(pid));
        self.signal = default_run_signal();
        let join = {
            let pid = pid.clone();
            let signal = self.signal.clone();
            std::thread::Builder::new()
                .name("daqloop-control".to_owned())
                .spawn(move || run_session(port, dispatchers, cfg, pid, signal))
                .map_err(|e| {
                    LoopError::Configuration(format!("Failed to spawn control loop thread: {e}"))
                })?
        };

        let ready = self.signal.wait_ready_or_finished();
        if ready.ready {
            let setpoint = SetpointHandle {
                pid,
                signal: self.signal.clone(),
            };
            self.session = Some(Session { setpoint, join });
            return Ok(());
        }

        // Acquisition failed and the thread has already released the port
        match join.join() {
            Ok(end) => {
                self.port = Some(end.port);
                self.dispatchers = end.dispatchers;
                match end.outcome {
                    Err(e) => Err(e),
                    Ok(_) => Err(LoopError::Configuration(
                        "Control loop exited during startup".to_owned(),
                    )),
                }
            }
            Err(_) => Err(LoopError::Configuration(
                "Control loop thread panicked during startup".to_owned(),
            )),
        }
    }

    /// Stop the running session, wait for the hardware to be released,
    /// and return the session's summary.
    ///
    /// A session that already ended on a fault returns its report here.
    /// Returns `None` if there was no session to stop.
    pub fn stop(&mut self) -> Option<SessionSummary> {
        let Some(session) = self.session.take() else {
            return self.ended.take();
        };
        self.signal.request_stop();
        let summary = self.reclaim(session.join)?;
        info!(
            "Session {} stopped after {} cycles ({} empty, {} overflows) at {} Hz",
            summary.op_name,
            summary.metrics.cycles,
            summary.metrics.empty_batches,
            summary.metrics.overflows,
            summary.final_sampling_rate_hz
        );
        Some(summary)
    }

    /// Change the setpoint of the running session.
    /// Returns `false` and does nothing if no session is running.
    pub fn set_setpoint(&self, setpoint: f64) -> bool {
        match &self.session {
            Some(s) => s.setpoint.set(setpoint),
            None => {
                debug!("Ignoring setpoint {setpoint} with no active session");
                false
            }
        }
    }

    /// Handle for changing the setpoint of the active session from another thread
    pub fn setpoint_handle(&self) -> Option<SetpointHandle> {
        self.session.as_ref().map(|s| s.setpoint.clone())
    }

    /// Setpoint of the active session
    pub fn setpoint(&self) -> Option<f64> {
        self.session.as_ref().map(|s| s.setpoint.get())
    }

    /// Controller terms from the most recent cycle of the active session
    pub fn last_terms(&self) -> Option<PidTerms> {
        self.session
            .as_ref()
            .map(|s| lock(&s.setpoint.pid).last_terms())
    }

    /// Join a session that ended on its own, which still holds the port,
    /// and keep its report for `stop`.
    fn reclaim_finished(&mut self) {
        if self.state() != RunState::Idle {
            return;
        }
        if let Some(prev) = self.session.take() {
            self.ended = self.reclaim(prev.join);
        }
    }

    /// Join the loop thread and take back the port and dispatchers.
    fn reclaim(&mut self, join: JoinHandle<SessionEnd>) -> Option<SessionSummary> {
        match join.join() {
            Ok(end) => {
                self.port = Some(end.port);
                self.dispatchers = end.dispatchers;
                match end.outcome {
                    Ok(summary) => Some(summary),
                    Err(e) => {
                        error!("Session ended without a summary: {e}");
                        None
                    }
                }
            }
            Err(_) => {
                error!("Control loop thread panicked; hardware port is lost");
                None
            }
        }
    }
}

impl Drop for ControlLoop {
    fn drop(&mut self) {
        // Never leave a loop thread driving hardware with no owner
        let _ = self.stop();
    }
}

/// Body of the loop thread.
fn run_session(
    mut port: Box<dyn HardwarePort>,
    mut dispatchers: Vec<Box<dyn Dispatcher>>,
    cfg: LoopConfig,
    pid: Arc<Mutex<Pid>>,
    signal: Arc<RunSignal>,
) -> SessionEnd {
    let outcome = {
        // Declared first so that it drops last, after the hardware is released
        let _finished = ReadyFinishGuard {
            ready: signal.clone(),
        };
        run_cycles(&mut *port, &mut dispatchers, &cfg, &pid, &signal)
    };

    SessionEnd {
        port,
        dispatchers,
        outcome,
    }
}

fn run_cycles(
    port: &mut dyn HardwarePort,
    dispatchers: &mut [Box<dyn Dispatcher>],
    cfg: &LoopConfig,
    pid: &Mutex<Pid>,
    signal: &RunSignal,
) -> Result<SessionSummary, LoopError> {
    if cfg.pin_thread {
        pin_current_thread();
    }

    let mut rate = SamplingRate::new(cfg.sampling_rate_hz, cfg.min_sampling_rate_hz);
    let bounds = lock(pid).config().output_bounds;

    // Released when this goes out of scope, on every path
    let mut channels = AcquiredChannels::acquire(
        port,
        &cfg.input_channel,
        &cfg.output_channel,
        cfg.input_timing(rate.hz()),
        bounds,
    )
    .map_err(|e| match LoopError::from(e) {
        // Anything that stops acquisition is a start-time configuration failure
        err @ LoopError::Configuration(_) => err,
        other => LoopError::Configuration(format!("Failed to acquire hardware: {other}")),
    })?;

    for d in dispatchers.iter_mut() {
        d.init(&cfg.op_name).map_err(LoopError::Configuration)?;
    }

    // Start the controller's time base at the first cycle
    lock(pid).set_setpoint_at(cfg.initial_setpoint, Instant::now());
    signal.mark_ready();
    info!("Entering control loop");

    let mut metrics = LoopMetrics::default();
    let mut batch = Vec::with_capacity(cfg.samples_per_cycle);
    let mut cycle: u64 = 0;

    let exit = loop {
        if !signal.is_running() {
            break SessionExit::Stopped;
        }
        let cycle_start = Instant::now();

        let fatal = match run_cycle(
            &mut channels,
            &mut batch,
            pid,
            dispatchers,
            cycle,
            &mut metrics,
        )
        .map_err(LoopError::from)
        {
            Ok(()) => None,
            Err(LoopError::Overflow) => {
                metrics.overflows += 1;
                let from_hz = rate.hz();
                match rate.degrade() {
                    Some(to_hz) => {
                        warn!(
                            "Input buffer overflow; lowering sampling rate \
                             from {from_hz} Hz to {to_hz} Hz"
                        );
                        publish(
                            dispatchers,
                            cycle,
                            TelemetryKind::RateChanged { from_hz, to_hz },
                        );
                        channels
                            .reconfigure_input(cfg.input_timing(to_hz))
                            .err()
                            .map(|e| {
                                LoopError::Hardware(format!(
                                    "Failed to reconfigure input at {to_hz} Hz: {e}"
                                ))
                            })
                    }
                    None => {
                        warn!(
                            "Input buffer overflow at the minimum sampling rate of {from_hz} Hz"
                        );
                        None
                    }
                }
            }
            Err(e) => Some(e),
        };

        if let Some(err) = fatal {
            error!("Terminating session: {err}");
            publish(
                dispatchers,
                cycle,
                TelemetryKind::SessionTerminated {
                    reason: err.to_string(),
                },
            );
            signal.request_stop();
            break SessionExit::Faulted(err);
        }

        cycle += 1;
        let remaining = metrics.record_cycle_time(cycle_start, rate.period());
        signal.wait_while_running(remaining);
    };

    for d in dispatchers.iter_mut() {
        if let Err(e) = d.terminate() {
            warn!("Failed to terminate dispatcher: {e}");
        }
    }

    Ok(SessionSummary {
        op_name: cfg.op_name.clone(),
        metrics,
        final_sampling_rate_hz: rate.hz(),
        final_setpoint: lock(pid).setpoint(),
        exit,
    })
}

/// One read-compute-publish-write pass.
fn run_cycle(
    channels: &mut AcquiredChannels<'_>,
    batch: &mut Vec<f64>,
    pid: &Mutex<Pid>,
    dispatchers: &mut [Box<dyn Dispatcher>],
    cycle: u64,
    metrics: &mut LoopMetrics,
) -> Result<(), PortError> {
    channels.read_batch(batch)?;

    // Only the newest sample of a batch is controlled on
    let Some(&measured) = batch.last() else {
        metrics.empty_batches += 1;
        trace!("Cycle {cycle}: empty batch");
        return Ok(());
    };

    let output = lock(pid).compute(measured, Instant::now());
    trace!("Cycle {cycle}: measured {measured}, output {output}");

    publish(dispatchers, cycle, TelemetryKind::Measured(measured));
    publish(dispatchers, cycle, TelemetryKind::Output(output));

    channels.write(output)?;
    metrics.cycles += 1;
    Ok(())
}

#[cfg(feature = "affinity")]
fn pin_current_thread() {
    use thread_priority::{ThreadPriority, set_current_thread_priority};

    match core_affinity::get_core_ids().and_then(|ids| ids.first().copied()) {
        Some(core) => {
            if core_affinity::set_for_current(core) {
                info!("Pinned control loop to core {}", core.id);
            } else {
                warn!("Failed to pin control loop to core {}", core.id);
            }
        }
        None => warn!("Unable to list cores for pinning"),
    }

    if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
        warn!("Failed to raise control loop priority: {e:?}");
    }
}

#[cfg(not(feature = "affinity"))]
fn pin_current_thread() {
    warn!("Thread pinning requested, but daqloop was built without the `affinity` feature");
}

fn publish(dispatchers: &mut [Box<dyn Dispatcher>], cycle: u64, kind: TelemetryKind) {
    let event = TelemetryEvent::new(SystemTime::now(), cycle, kind);
    for d in dispatchers.iter_mut() {
        d.consume(&event);
    }
}
