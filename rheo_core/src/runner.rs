//! Session orchestration: wires the three tasks over one shared state and
//! maps the controller's outcome to a typed result.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use rheo_traits::clock::Clock;
use rheo_traits::{Actuator, ForceSensor};

use crate::controller::{ControlCfg, Controller, RunOutcome};
use crate::error::{BuildError, Result, RheoError};
use crate::estimator::{Geometry, PropertyEstimator, YieldStressPolicy};
use crate::pid::PidTuning;
use crate::sensor::{SensorCfg, SensorTask};
use crate::state::SharedState;
use crate::telemetry::{TelemetryCfg, TelemetryTask};

/// Everything a session needs beyond the hardware handles.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Strictly increasing force targets, one tracking step each.
    pub targets: Vec<f64>,
    pub sample_volume_m3: f64,
    pub tuning: PidTuning,
    pub control: ControlCfg,
    pub sensor: SensorCfg,
    pub telemetry: TelemetryCfg,
    pub geometry: Geometry,
    pub yield_policy: YieldStressPolicy,
}

impl SessionParams {
    /// Reject configurations that must never reach the control loop.
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(eyre::Report::new(BuildError::MissingTargets));
        }
        if !self.targets.iter().all(|t| t.is_finite() && *t > 0.0) {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "targets must be finite and > 0",
            )));
        }
        if !self.targets.windows(2).all(|w| w[0] < w[1]) {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "targets must be strictly increasing",
            )));
        }
        if self.sample_volume_m3 <= 0.0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "sample volume must be > 0",
            )));
        }
        if self.control.start_gap_mm <= 0.0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "start gap must be > 0",
            )));
        }
        if self.control.approach_velocity_mms >= 0.0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "approach velocity must be < 0",
            )));
        }
        if self.control.force_threshold <= 0.0
            || self.control.max_force <= self.control.force_threshold
        {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "force threshold must be > 0 and below max force",
            )));
        }
        // The drive safety-stops after 1 s without a heartbeat; the tick is
        // also the heartbeat cadence.
        if self.control.tick.is_zero() || self.control.tick.as_millis() > 100 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "controller tick must be in (0, 100ms]",
            )));
        }
        if self.tuning.decay_rate >= 0.0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "integral decay rate must be < 0",
            )));
        }
        if self.tuning.int_clamp <= 0.0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "integral clamp must be > 0",
            )));
        }
        if self.control.schedule.a <= 0.0 || self.control.schedule.b <= 0.0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "schedule gains must be > 0",
            )));
        }
        if self.geometry.hammer_radius_m <= 0.0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "hammer radius must be > 0",
            )));
        }
        if self.sensor.force_up_sign != 1.0 && self.sensor.force_up_sign != -1.0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "force up sign must be +1 or -1",
            )));
        }
        Ok(())
    }
}

/// Final state of a completed run, read back out of shared state.
#[derive(Debug, Clone, Copy)]
pub struct SessionReport {
    pub final_force: f64,
    pub final_gap_mm: f64,
    pub viscosity: f64,
    pub yield_stress: f64,
    pub steps_completed: usize,
    pub spread_beyond_hammer: bool,
}

fn report_from(shared: &SharedState) -> SessionReport {
    SessionReport {
        final_force: shared.force.load(),
        final_gap_mm: shared.gap_m.load() * 1000.0,
        viscosity: shared.viscosity.load(),
        yield_stress: shared.yield_stress.load(),
        steps_completed: shared
            .step_index
            .load(std::sync::atomic::Ordering::Relaxed),
        spread_beyond_hammer: shared
            .spread_beyond_hammer
            .load(std::sync::atomic::Ordering::Relaxed),
    }
}

/// Run one full test: spawn the sensor and telemetry tasks, drive the
/// controller on the current thread, and always leave the actuator homed
/// and de-energized before returning.
///
/// A clean completion returns the report; a safety trip returns
/// `RheoError::Abort` after the shutdown sequence has run.
pub fn run_session<S, A, C, W>(
    sensor: S,
    drive: A,
    clock: C,
    params: SessionParams,
    sink: W,
    interrupt: Option<Arc<AtomicBool>>,
) -> Result<SessionReport>
where
    S: ForceSensor + Send + 'static,
    A: Actuator,
    C: Clock + Clone + Send + Sync + 'static,
    W: Write + Send + 'static,
{
    params.validate()?;

    let shared = Arc::new(SharedState::new(clock.now(), params.targets[0]));
    tracing::info!(
        targets = ?params.targets,
        start_gap_mm = params.control.start_gap_mm,
        sample_volume_m3 = params.sample_volume_m3,
        "test start"
    );

    let sensor_task = SensorTask::spawn(
        sensor,
        shared.clone(),
        params.tuning.clone(),
        params.sensor.clone(),
        clock.clone(),
    );
    let telemetry_task = TelemetryTask::spawn(
        shared.clone(),
        sink,
        params.telemetry.clone(),
        clock.clone(),
    );

    let estimator = PropertyEstimator::new(
        params.geometry,
        params.yield_policy,
        params.sample_volume_m3,
    );
    let mut controller = Controller::new(
        drive,
        clock,
        shared.clone(),
        params.control.clone(),
        params.targets.clone(),
        estimator,
        interrupt,
    );
    let outcome = controller.run();

    // Joins; the controller has already raised the stop flag.
    drop(sensor_task);
    drop(telemetry_task);

    let report = report_from(&shared);
    match outcome? {
        RunOutcome::Completed => {
            tracing::info!(final_force = report.final_force, "test complete");
            Ok(report)
        }
        RunOutcome::Aborted(reason) => {
            tracing::error!(%reason, "test aborted");
            Err(eyre::Report::new(RheoError::Abort(reason)))
        }
    }
}
