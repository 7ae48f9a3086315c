//! Components to support nonblocking operation.
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::RunState;

/// Boolean predicates to support the RunSignal condvar
/// because condvars can generate spurious wake signals.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct ReadyState {
    pub(super) ready: bool,
    pub(super) finished: bool,
    pub(super) run: RunState,
}

/// Predicate-signal pair shared between the caller and the loop thread
/// using OS-scheduled condition variable.
///
/// Carries the session's `RunState` so that a stop request can wake
/// the loop out of its between-cycle wait.
#[derive(Debug, Default)]
pub(super) struct RunSignal {
    state: Mutex<ReadyState>,
    cvar: Condvar,
}

impl RunSignal {
    fn lock(&self) -> MutexGuard<'_, ReadyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn run_state(&self) -> RunState {
        self.lock().run
    }

    pub(super) fn is_running(&self) -> bool {
        self.run_state() == RunState::Running
    }

    /// Hardware is acquired; Idle -> Running.
    pub(super) fn mark_ready(&self) {
        let mut state = self.lock();
        if !state.ready && !state.finished {
            state.ready = true;
            state.run = RunState::Running;
            self.cvar.notify_all();
        }
    }

    /// Running -> Stopping. No effect in any other state.
    pub(super) fn request_stop(&self) {
        let mut state = self.lock();
        if state.run == RunState::Running {
            state.run = RunState::Stopping;
            self.cvar.notify_all();
        }
    }

    /// Loop has exited and released hardware; -> Idle.
    pub(super) fn mark_finished(&self) {
        let mut state = self.lock();
        state.finished = true;
        state.run = RunState::Idle;
        self.cvar.notify_all();
    }

    /// Wait for signal indicating the thread is either ready or already finished.
    pub(super) fn wait_ready_or_finished(&self) -> ReadyState {
        let mut state = self.lock();
        while !state.ready && !state.finished {
            state = self
                .cvar
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *state
    }

    /// Sleep for up to `timeout`, returning early if the session
    /// leaves `Running`. Returns whether the session is still running.
    pub(super) fn wait_while_running(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .cvar
            .wait_timeout_while(state, timeout, |s| s.run == RunState::Running)
            .unwrap_or_else(PoisonError::into_inner);
        state.run == RunState::Running
    }
}

/// Drop-guard to guarantee that the signal is marked
/// finished if the loop exits for any reason.
pub(super) struct ReadyFinishGuard {
    pub(super) ready: Arc<RunSignal>,
}

impl Drop for ReadyFinishGuard {
    fn drop(&mut self) {
        self.ready.mark_finished();
    }
}

pub(super) fn default_run_signal() -> Arc<RunSignal> {
    Arc::new(RunSignal::default())
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let s = default_run_signal();
        assert_eq!(s.run_state(), RunState::Idle);

        // Stop before start does nothing
        s.request_stop();
        assert_eq!(s.run_state(), RunState::Idle);

        s.mark_ready();
        assert!(s.is_running());
        s.request_stop();
        assert_eq!(s.run_state(), RunState::Stopping);
        s.mark_finished();
        assert_eq!(s.run_state(), RunState::Idle);

        // Finished sessions do not come back to life
        s.mark_ready();
        assert_eq!(s.run_state(), RunState::Idle);
    }

    #[test]
    fn stop_request_wakes_waiter() {
        let s = default_run_signal();
        s.mark_ready();

        let s2 = s.clone();
        let waiter = std::thread::spawn(move || {
            let t = Instant::now();
            let running = s2.wait_while_running(Duration::from_secs(10));
            (running, t.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        s.request_stop();

        let (running, waited) = waiter.join().unwrap();
        assert!(!running);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn guard_marks_finished_on_panic() {
        let s = default_run_signal();
        let s2 = s.clone();
        let res = std::thread::spawn(move || {
            let _guard = ReadyFinishGuard { ready: s2 };
            panic!("loop body failed");
        })
        .join();
        assert!(res.is_err());

        let st = s.wait_ready_or_finished();
        assert!(st.finished);
        assert_eq!(st.run, RunState::Idle);
    }
}
