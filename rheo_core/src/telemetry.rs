//! Telemetry task: fixed-cadence recorder over the shared state.
//!
//! Owns the CSV sink exclusively (no other task ever writes a row), so the
//! append path can never contend with the control loop. Also maintains the
//! bounded live-view ring buffer in shared state.

use std::io::Write;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rheo_traits::clock::Clock;

use crate::state::{LivePoint, SharedState};

#[derive(Debug, Clone)]
pub struct TelemetryCfg {
    /// Recorder cadence; independent of (and typically faster than) the
    /// control loop's tick.
    pub cadence: Duration,
    /// Live-view ring buffer keeps points younger than this.
    pub live_window_s: f64,
    /// Units string for the force column headers.
    pub units: String,
    /// Starting gap (mm), recorded per row.
    pub start_gap_mm: f64,
    /// Sample volume (m^3), recorded per row.
    pub sample_volume_m3: f64,
    /// Gains recorded alongside the error terms.
    pub k_i: f64,
    pub k_d: f64,
    /// Dead-man ceiling shared by all tasks.
    pub max_test_duration: Duration,
}

impl Default for TelemetryCfg {
    fn default() -> Self {
        Self {
            cadence: Duration::from_millis(20),
            live_window_s: 30.0,
            units: "g".into(),
            start_gap_mm: 10.0,
            sample_volume_m3: 0.5e-6,
            k_i: 0.005,
            k_d: 0.000167,
            max_test_duration: Duration::from_secs(2000),
        }
    }
}

/// One recorded row. Field order matches the CSV schema.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRow {
    pub unix_time_s: f64,
    pub elapsed_s: f64,
    pub position_mm: f64,
    pub position_steps: i64,
    pub target_position_steps: i64,
    pub velocity_mms: f64,
    pub velocity_raw: i64,
    pub target_velocity_raw: i64,
    pub max_speed_raw: i64,
    pub max_decel_raw: i64,
    pub max_accel_raw: i64,
    pub step_mode: u8,
    pub vin_voltage_mv: u32,
    pub force: f64,
    pub target_force: f64,
    pub start_gap_m: f64,
    pub gap_m: f64,
    pub viscosity: f64,
    pub yield_stress: f64,
    pub sample_volume_m3: f64,
    pub visc_volume_m3: f64,
    pub test_active: bool,
    pub spread_beyond_hammer: bool,
    pub error: f64,
    pub kp_used: f64,
    pub int_error: f64,
    pub k_i: f64,
    pub der_error: f64,
    pub k_d: f64,
}

pub fn header(units: &str) -> Vec<String> {
    [
        "Current Time",
        "Elapsed Time",
        "Current Position (mm)",
        "Current Position",
        "Target Position",
        "Current Velocity (mm/s)",
        "Current Velocity",
        "Target Velocity",
        "Max Speed",
        "Max Decel",
        "Max Accel",
        "Step Mode",
        "Voltage In (mV)",
    ]
    .into_iter()
    .map(str::to_string)
    .chain([
        format!("Current Force ({units})"),
        format!("Target Force ({units})"),
    ])
    .chain(
        [
            "Start Gap (m)",
            "Current Gap (m)",
            "Viscosity (Pa.s)",
            "Yield Stress (Pa)",
            "Sample Volume (m^3)",
            "Viscosity Volume (m^3)",
            "Test Active?",
            "Spread beyond hammer?",
            "Error",
            "K_P",
            "Integrated Error",
            "K_I",
            "Error Derivative",
            "K_D",
        ]
        .into_iter()
        .map(str::to_string),
    )
    .collect()
}

/// Sample every field a row needs from shared state. Fields updated by
/// different writers may straddle a tick boundary; none of the row's
/// consumers require a transactional snapshot.
pub fn sample_row(shared: &SharedState, cfg: &TelemetryCfg, elapsed_s: f64) -> TelemetryRow {
    let drive = shared.drive_snapshot();
    let unix_time_s = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    TelemetryRow {
        unix_time_s,
        elapsed_s,
        position_mm: shared.position_mm.load(),
        position_steps: drive.position_steps,
        target_position_steps: drive.target_position_steps,
        velocity_mms: shared.velocity_mms.load(),
        velocity_raw: drive.velocity_raw,
        target_velocity_raw: drive.target_velocity_raw,
        max_speed_raw: drive.max_speed_raw,
        max_decel_raw: drive.max_decel_raw,
        max_accel_raw: drive.max_accel_raw,
        step_mode: drive.step_mode,
        vin_voltage_mv: drive.vin_voltage_mv,
        force: shared.force.load(),
        target_force: shared.target.load(),
        start_gap_m: cfg.start_gap_mm / 1000.0,
        gap_m: shared.gap_m.load(),
        viscosity: shared.viscosity.load(),
        yield_stress: shared.yield_stress.load(),
        sample_volume_m3: cfg.sample_volume_m3,
        visc_volume_m3: shared.visc_volume_m3.load(),
        test_active: shared.test_active.load(std::sync::atomic::Ordering::Relaxed),
        spread_beyond_hammer: shared
            .spread_beyond_hammer
            .load(std::sync::atomic::Ordering::Relaxed),
        error: shared.error.load(),
        kp_used: shared.kp_used.load(),
        int_error: shared.int_error.load(),
        k_i: cfg.k_i,
        der_error: shared.der_error.load(),
        k_d: cfg.k_d,
    }
}

fn write_row<W: Write>(wtr: &mut csv::Writer<W>, row: &TelemetryRow) -> csv::Result<()> {
    wtr.write_record([
        row.unix_time_s.to_string(),
        row.elapsed_s.to_string(),
        row.position_mm.to_string(),
        row.position_steps.to_string(),
        row.target_position_steps.to_string(),
        row.velocity_mms.to_string(),
        row.velocity_raw.to_string(),
        row.target_velocity_raw.to_string(),
        row.max_speed_raw.to_string(),
        row.max_decel_raw.to_string(),
        row.max_accel_raw.to_string(),
        row.step_mode.to_string(),
        row.vin_voltage_mv.to_string(),
        row.force.to_string(),
        row.target_force.to_string(),
        row.start_gap_m.to_string(),
        row.gap_m.to_string(),
        row.viscosity.to_string(),
        row.yield_stress.to_string(),
        row.sample_volume_m3.to_string(),
        row.visc_volume_m3.to_string(),
        row.test_active.to_string(),
        row.spread_beyond_hammer.to_string(),
        row.error.to_string(),
        row.kp_used.to_string(),
        row.int_error.to_string(),
        row.k_i.to_string(),
        row.der_error.to_string(),
        row.k_d.to_string(),
    ])
}

pub struct TelemetryTask {
    shared: Arc<SharedState>,
    join_handle: Option<JoinHandle<()>>,
}

impl TelemetryTask {
    /// Spawn the recorder over an owned sink. The sink is moved into the
    /// task thread; nothing else can write to it.
    pub fn spawn<W, C>(
        shared: Arc<SharedState>,
        sink: W,
        cfg: TelemetryCfg,
        clock: C,
    ) -> Self
    where
        W: Write + Send + 'static,
        C: Clock + Send + Sync + 'static,
    {
        let shared_task = shared.clone();
        let join_handle = std::thread::spawn(move || {
            let shared = shared_task;
            let mut wtr = csv::Writer::from_writer(sink);
            if let Err(e) = wtr.write_record(header(&cfg.units)) {
                tracing::error!(error = %e, "telemetry header write failed");
                return;
            }
            let epoch = shared.epoch;
            let ceiling = cfg.max_test_duration.as_secs_f64();

            loop {
                let elapsed = clock.secs_since(epoch);
                let row = sample_row(&shared, &cfg, elapsed);

                shared.push_live(
                    LivePoint {
                        elapsed_s: elapsed,
                        force: row.force,
                        gap_mm: row.gap_m * 1000.0,
                        yield_stress: row.yield_stress,
                    },
                    cfg.live_window_s,
                );

                if let Err(e) = write_row(&mut wtr, &row) {
                    tracing::warn!(error = %e, "telemetry row write failed");
                }
                if let Err(e) = wtr.flush() {
                    tracing::warn!(error = %e, "telemetry flush failed");
                }

                if shared.stopped() {
                    tracing::debug!("telemetry task observed stop flag");
                    break;
                }
                if elapsed >= ceiling {
                    tracing::error!("telemetry task hit the max-duration ceiling");
                    shared.request_stop();
                    break;
                }
                clock.sleep(cfg.cadence);
            }
            tracing::trace!("telemetry task exiting");
        });

        Self {
            shared,
            join_handle: Some(join_handle),
        }
    }
}

impl Drop for TelemetryTask {
    fn drop(&mut self) {
        self.shared.request_stop();
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(()) => tracing::trace!("telemetry task joined"),
                Err(e) => tracing::warn!(?e, "telemetry task panicked during shutdown"),
            }
        }
    }
}
