//! Dispatcher that forwards events on a bounded thread channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use tracing::warn;

use super::{Dispatcher, TelemetryEvent};

/// Forwards each event to a bounded multi-consumer channel.
///
/// When the buffer is full the event is dropped and counted rather than
/// waiting for a consumer, so a stalled display never slows the loop.
#[derive(Debug)]
pub struct ChannelDispatcher {
    tx: Sender<TelemetryEvent>,
    dropped: Arc<AtomicU64>,
    disconnected: bool,
}

impl ChannelDispatcher {
    /// Build a dispatcher and the receiving end of its channel
    pub fn new(capacity: usize) -> (Self, Receiver<TelemetryEvent>) {
        let (tx, rx) = bounded(capacity);
        let dispatcher = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            disconnected: false,
        };
        (dispatcher, rx)
    }

    /// Shared count of events dropped because the channel was full
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }
}

impl Dispatcher for ChannelDispatcher {
    fn consume(&mut self, event: &TelemetryEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {
                if !self.disconnected {
                    warn!("Telemetry receiver disconnected; dropping further events");
                    self.disconnected = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::dispatcher::TelemetryKind;

    fn event(v: f64) -> TelemetryEvent {
        TelemetryEvent::new(SystemTime::now(), 0, TelemetryKind::Measured(v))
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (mut d, rx) = ChannelDispatcher::new(2);
        let dropped = d.dropped_counter();

        for i in 0..5 {
            d.consume(&event(i as f64));
        }

        assert_eq!(dropped.load(Ordering::Relaxed), 3);
        let got: Vec<_> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(
            got,
            vec![TelemetryKind::Measured(0.0), TelemetryKind::Measured(1.0)]
        );
    }

    #[test]
    fn disconnected_receiver_is_tolerated() {
        let (mut d, rx) = ChannelDispatcher::new(2);
        drop(rx);
        d.consume(&event(1.0));
        d.consume(&event(2.0));
        assert!(d.disconnected);
    }
}
