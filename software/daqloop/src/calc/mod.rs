//! Calculations that are run at each cycle during operation.
//!
//! Calcs hold numerical state only. They do no I/O and take their
//! notion of time from the caller, so they can be driven from the control
//! loop or stepped directly in tests.

mod pid;

pub use pid::{MIN_DT, OutputBounds, Pid, PidConfig, PidGains, PidTerms};
