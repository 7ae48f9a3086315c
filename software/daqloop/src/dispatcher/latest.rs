use std::sync::{Arc, RwLock};

use super::{Dispatcher, TelemetryEvent, TelemetryKind};

/// Latest values seen by a [`LatestValueDispatcher`].
/// Values are NaN until the first corresponding event of a session.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub system_time: String,
    pub cycle: u64,
    pub measured: f64,
    pub output: f64,
    pub sampling_rate_hz: Option<u32>,
    pub terminated: Option<String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            system_time: String::new(),
            cycle: 0,
            measured: f64::NAN,
            output: f64::NAN,
            sampling_rate_hz: None,
            terminated: None,
        }
    }
}

/// Cloneable handle for reading the latest snapshot from another thread.
#[derive(Clone, Default, Debug)]
pub struct LatestValueHandle {
    inner: Arc<RwLock<Arc<Snapshot>>>,
}

impl LatestValueHandle {
    /// Get the latest snapshot.
    pub fn latest(&self) -> Arc<Snapshot> {
        self.inner
            .read()
            .map(|r| Arc::clone(&*r))
            .unwrap_or_else(|_| Arc::new(Snapshot::default()))
    }

    fn store(&self, snapshot: Snapshot) {
        if let Ok(mut w) = self.inner.write() {
            *w = Arc::new(snapshot);
        }
    }
}

/// Dispatcher that always keeps the latest values available via a shared handle.
#[derive(Default, Debug)]
pub struct LatestValueDispatcher {
    handle: LatestValueHandle,
    current: Snapshot,
}

impl LatestValueDispatcher {
    pub fn new() -> (Self, LatestValueHandle) {
        let d = Self::default();
        let handle = d.handle.clone();
        (d, handle)
    }
}

impl Dispatcher for LatestValueDispatcher {
    fn init(&mut self, _op_name: &str) -> Result<(), String> {
        // Reset to a placeholder at the start of each session
        self.current = Snapshot::default();
        self.handle.store(self.current.clone());
        Ok(())
    }

    fn consume(&mut self, event: &TelemetryEvent) {
        let s = &mut self.current;
        s.system_time.clone_from(&event.system_time);
        s.cycle = event.cycle;
        match &event.kind {
            TelemetryKind::Measured(v) => s.measured = *v,
            TelemetryKind::Output(v) => s.output = *v,
            TelemetryKind::RateChanged { to_hz, .. } => s.sampling_rate_hz = Some(*to_hz),
            TelemetryKind::SessionTerminated { reason } => s.terminated = Some(reason.clone()),
        }
        self.handle.store(self.current.clone());
    }
}
