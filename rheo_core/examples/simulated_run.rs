//! Run a short squeeze-flow test against the simulated rig and print the
//! report. No hardware required:
//!
//! ```sh
//! cargo run -p rheo_core --example simulated_run
//! ```

use std::sync::Arc;
use std::time::Duration;

use rheo_core::controller::ControlCfg;
use rheo_core::estimator::{Geometry, YieldStressPolicy};
use rheo_core::pid::PidTuning;
use rheo_core::runner::{SessionParams, run_session};
use rheo_core::sensor::SensorCfg;
use rheo_core::telemetry::TelemetryCfg;
use rheo_hardware::{SimRigCfg, sim_rig};
use rheo_traits::clock::MonotonicClock;

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let clock = MonotonicClock::new();
    let rig = SimRigCfg {
        start_gap_mm: 10.0,
        sample_height_mm: 9.0,
        stiffness: 10.0,
        sample_period: Duration::from_millis(5),
        noise_amp: 0.02,
        ..SimRigCfg::default()
    };
    let (sensor, drive) = sim_rig(rig, Arc::new(clock));

    let params = SessionParams {
        targets: vec![2.0, 4.0],
        sample_volume_m3: 0.5e-6,
        tuning: PidTuning::default(),
        control: ControlCfg {
            approach_velocity_mms: -1.0,
            start_gap_mm: 10.0,
            min_position_mm: 0.2,
            step_duration: Duration::from_secs(3),
            ..ControlCfg::default()
        },
        sensor: SensorCfg::default(),
        telemetry: TelemetryCfg {
            start_gap_mm: 10.0,
            sample_volume_m3: 0.5e-6,
            ..TelemetryCfg::default()
        },
        geometry: Geometry::default(),
        yield_policy: YieldStressPolicy::GapRatio,
    };

    let sink = std::fs::File::create("simulated_run-data.csv")?;
    let report = run_session(sensor, drive, clock, params, sink, None)?;
    println!(
        "final force {:.2} g at gap {:.2} mm (yield stress {:.1} Pa, steps {})",
        report.final_force,
        report.final_gap_mm,
        report.yield_stress,
        report.steps_completed + 1
    );
    Ok(())
}
