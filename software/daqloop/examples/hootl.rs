//! Run a control session against the software DAQ with no hardware in the loop.
//!
//! Demonstrated here:
//!   * Enumerating devices and channels through the hardware port
//!   * Starting a session and changing the setpoint from another thread
//!   * Watching telemetry through a latest-value dispatcher
//!   * Recovering from an input buffer overflow by lowering the sampling rate

use std::time::Duration;

use daqloop::{
    dispatcher::LatestValueDispatcher,
    logging::init_logging,
    peripheral::{HootlDaq, HootlFault, PlantModel},
    *,
};

use tracing::info;

fn main() -> Result<(), String> {
    let mut cfg = LoopConfig::new("SimDev1/ai0", "SimDev1/ao0", 200).with_setpoint(1.0);
    cfg.op_name = format!("hootl_example_{}", cfg.op_name);
    cfg.op_dir = std::env::temp_dir();
    let log_file = init_logging(&cfg.op_dir, &cfg.op_name)?;
    info!("Logging to {}", log_file.display());

    // A plant that settles in about a quarter second,
    // with one overflow partway through the run
    let daq = HootlDaq::new()
        .with_plant(PlantModel {
            gain: 1.0,
            time_constant_s: 0.05,
            offset: 0.0,
        })
        .with_read_fault(100, HootlFault::Overflow);

    let mut control = ControlLoop::new(daq);
    let (latest, snapshot) = LatestValueDispatcher::new();
    control
        .add_dispatcher(Box::new(latest))
        .map_err(|e| e.to_string())?;

    if let Some(port) = control.port() {
        for device in port.list_devices().map_err(|e| e.to_string())? {
            let inputs = port
                .list_channels(&device, Direction::AnalogInput)
                .map_err(|e| e.to_string())?;
            let outputs = port
                .list_channels(&device, Direction::AnalogOutput)
                .map_err(|e| e.to_string())?;
            info!("{device}: inputs {inputs:?}, outputs {outputs:?}");
        }
    }

    control.start(cfg).map_err(|e| e.to_string())?;

    // Step the setpoint from a separate thread, the way a UI would
    let setpoint = control
        .setpoint_handle()
        .ok_or("Session is not running")?;
    let stepper = std::thread::spawn(move || {
        for target in [2.0, 0.5, 1.5] {
            std::thread::sleep(Duration::from_millis(500));
            setpoint.set(target);
        }
    });

    for _ in 0..10 {
        std::thread::sleep(Duration::from_millis(200));
        let s = snapshot.latest();
        info!(
            "cycle {}: measured {:.3} V, output {:.3} V, setpoint {:?}, rate {:?} Hz",
            s.cycle,
            s.measured,
            s.output,
            control.setpoint(),
            s.sampling_rate_hz
        );
    }
    let _ = stepper.join();

    let summary = control.stop().ok_or("No session to stop")?;
    info!("{summary:?}");

    Ok(())
}
