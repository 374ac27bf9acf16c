#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]
//! Config schemas and load-cell calibration parsing for the rheometer.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - The calibration CSV loader enforces headers and performs a robust refit
//!   to reduce outlier influence before slope/tare estimation.
//! - `CellRecord` is the small persisted key/value record (tare, calibration
//!   slope, units, cached gap) the load-cell adapter reads at startup.
use serde::{Deserialize, Serialize};

/// Calibration CSV schema.
///
/// Expected headers:
/// raw,force
///
/// Example:
/// raw,force
/// 842913,0.0
/// 1024913,100.0
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CalibrationRow {
    pub raw: i64,
    pub force: f64,
}

/// Experiment inputs that change run to run.
#[derive(Debug, Deserialize, Clone)]
pub struct SessionCfg {
    /// Strictly increasing list of force targets, in the scale's units.
    pub targets: Vec<f64>,
    /// Starting gap between hammer and hard stop (mm). When absent, the
    /// cached gap from the persisted cell record is used.
    #[serde(default)]
    pub start_gap_mm: Option<f64>,
    /// Sample volume in mL.
    pub sample_volume_ml: f64,
    /// What the sample is made of; used in the output filename.
    pub sample_id: String,
    /// How long each target is held before advancing (s).
    #[serde(default = "default_step_duration_s")]
    pub step_duration_s: f64,
}

fn default_step_duration_s() -> f64 {
    250.0
}

/// Derivative-error finite-difference scheme.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DerivativeScheme {
    /// First-order backward difference; safer under sample jitter.
    #[default]
    First,
    /// Second-order backward difference over the last two intervals.
    Second,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PidCfg {
    /// Integrated error (units*s) to speed (mm/s).
    pub k_i: f64,
    /// Error derivative (units/s) to speed (mm/s).
    pub k_d: f64,
    /// Exponential decay rate applied to the integral each sample. Must be
    /// negative; bounds long-run windup without a hard cutoff.
    pub decay_rate: f64,
    /// Hard clamp on |integral| as a second line of defense (units*s).
    pub int_clamp: f64,
    pub derivative: DerivativeScheme,
    /// After a target step, mute the derivative term for this long to
    /// suppress the transient spike from the instantaneous target jump.
    pub der_settle_ms: u64,
}

impl Default for PidCfg {
    fn default() -> Self {
        Self {
            k_i: 0.005,
            k_d: 0.000167,
            decay_rate: -0.1502,
            int_clamp: 1000.0,
            derivative: DerivativeScheme::First,
            der_settle_ms: 500,
        }
    }
}

/// Constants of the tanh proportional-gain blend:
/// Kp = (a+b)/2 + (a-b)/2 * tanh(c * ((error/target)^2 - d))
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct ScheduleCfg {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl Default for ScheduleCfg {
    fn default() -> Self {
        Self {
            a: 0.7,
            b: 0.15,
            c: 50.0,
            d: 0.01,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MotionCfg {
    /// Microstepping mode exponent (microsteps per full step = 2^step_mode).
    pub step_mode: u8,
    pub max_accel_mmss: f64,
    pub max_speed_mms: f64,
    /// Speed to approach the sample at before the threshold is met (mm/s,
    /// negative = downward).
    pub approach_velocity_mms: f64,
}

impl Default for MotionCfg {
    fn default() -> Self {
        Self {
            step_mode: 4,
            max_accel_mmss: 20.0,
            max_speed_mms: 5.0,
            approach_velocity_mms: -1.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SafetyCfg {
    /// Force must exceed this for closed-loop control to engage (units).
    pub force_threshold: f64,
    /// Abort the run when |force| exceeds this (units).
    pub max_force: f64,
    /// Abort when the hammer retracts back within this distance of home (mm).
    pub min_position_mm: f64,
    /// Dead-man ceiling on the whole run (s); every task observes it.
    pub max_test_duration_s: f64,
}

impl Default for SafetyCfg {
    fn default() -> Self {
        Self {
            force_threshold: 0.6,
            max_force: 80.0,
            min_position_mm: 1.0,
            max_test_duration_s: 2000.0,
        }
    }
}

/// Yield-stress closed form to report. Both are squeeze-flow approximations,
/// not solutions of the governing PDE.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum YieldStressForm {
    /// tau_y = F * gap / (V * sqrt(3))
    #[default]
    GapRatio,
    /// Perfect-plasticity squeeze-flow form over the loaded radius.
    Plastic,
}

/// Optional velocity taper (gap / reference_gap)^exponent applied to the
/// commanded speed so the plate slows automatically as the gap narrows.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct GapTaperCfg {
    pub reference_gap_mm: f64,
    pub exponent: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EstimatorCfg {
    pub hammer_radius_m: f64,
    pub yield_stress: YieldStressForm,
    /// Sign of a force pushing up on the load cell; +1 or -1, fixed at
    /// session start.
    pub force_up_sign: i8,
    pub gap_taper: Option<GapTaperCfg>,
}

impl Default for EstimatorCfg {
    fn default() -> Self {
        Self {
            hammer_radius_m: 25e-3,
            yield_stress: YieldStressForm::GapRatio,
            force_up_sign: 1,
            gap_taper: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryCfg {
    /// Recorder cadence in ms; independent of the control-loop tick.
    pub cadence_ms: u64,
    /// Live-view ring buffer keeps points younger than this (s).
    pub live_window_s: f64,
    /// Directory the CSV record stream is written into.
    pub data_dir: String,
}

impl Default for TelemetryCfg {
    fn default() -> Self {
        Self {
            cadence_ms: 20,
            live_window_s: 30.0,
            data_dir: "data".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Timeouts {
    /// Max sensor wait per read (ms). Also accepts alias "sample_ms".
    #[serde(alias = "sample_ms")]
    pub sensor_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self { sensor_ms: 150 }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub session: SessionCfg,
    #[serde(default)]
    pub pid: PidCfg,
    #[serde(default)]
    pub schedule: ScheduleCfg,
    #[serde(default)]
    pub motion: MotionCfg,
    #[serde(default)]
    pub safety: SafetyCfg,
    #[serde(default)]
    pub estimator: EstimatorCfg,
    #[serde(default)]
    pub telemetry: TelemetryCfg,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Session
        if self.session.targets.is_empty() {
            eyre::bail!("session.targets must contain at least one force target");
        }
        for t in &self.session.targets {
            if !t.is_finite() || *t <= 0.0 {
                eyre::bail!("session.targets entries must be finite and > 0");
            }
        }
        if !self
            .session
            .targets
            .windows(2)
            .all(|pair| pair[0] < pair[1])
        {
            eyre::bail!(
                "session.targets must be strictly increasing; every force target must be higher than the previous value"
            );
        }
        if let Some(gap) = self.session.start_gap_mm
            && (!gap.is_finite() || gap <= 0.0)
        {
            eyre::bail!("session.start_gap_mm must be finite and > 0");
        }
        if self.session.sample_volume_ml <= 0.0 {
            eyre::bail!("session.sample_volume_ml must be > 0");
        }
        if self.session.step_duration_s <= 0.0 {
            eyre::bail!("session.step_duration_s must be > 0");
        }

        // PID
        if self.pid.decay_rate >= 0.0 {
            eyre::bail!("pid.decay_rate must be < 0 (exponential integral decay)");
        }
        if self.pid.int_clamp <= 0.0 {
            eyre::bail!("pid.int_clamp must be > 0");
        }
        for (name, v) in [("k_i", self.pid.k_i), ("k_d", self.pid.k_d)] {
            if !v.is_finite() || v < 0.0 {
                eyre::bail!("pid.{name} must be finite and >= 0");
            }
        }

        // Schedule
        if !(self.schedule.a.is_finite()
            && self.schedule.b.is_finite()
            && self.schedule.c.is_finite()
            && self.schedule.d.is_finite())
        {
            eyre::bail!("schedule constants must be finite");
        }
        if self.schedule.a <= 0.0 || self.schedule.b <= 0.0 {
            eyre::bail!("schedule.a and schedule.b must be > 0");
        }

        // Motion
        if self.motion.max_speed_mms <= 0.0 {
            eyre::bail!("motion.max_speed_mms must be > 0");
        }
        if self.motion.max_accel_mmss <= 0.0 {
            eyre::bail!("motion.max_accel_mmss must be > 0");
        }
        if self.motion.approach_velocity_mms >= 0.0 {
            eyre::bail!("motion.approach_velocity_mms must be < 0 (toward the sample)");
        }

        // Safety
        if self.safety.force_threshold <= 0.0 {
            eyre::bail!("safety.force_threshold must be > 0");
        }
        if self.safety.max_force <= self.safety.force_threshold {
            eyre::bail!("safety.max_force must exceed safety.force_threshold");
        }
        if self.safety.min_position_mm < 0.0 {
            eyre::bail!("safety.min_position_mm must be >= 0");
        }
        if self.safety.max_test_duration_s <= 0.0 {
            eyre::bail!("safety.max_test_duration_s must be > 0");
        }

        // Estimator
        if self.estimator.hammer_radius_m <= 0.0 {
            eyre::bail!("estimator.hammer_radius_m must be > 0");
        }
        if self.estimator.force_up_sign != 1 && self.estimator.force_up_sign != -1 {
            eyre::bail!("estimator.force_up_sign must be +1 or -1");
        }
        if let Some(t) = &self.estimator.gap_taper {
            if t.reference_gap_mm <= 0.0 {
                eyre::bail!("estimator.gap_taper.reference_gap_mm must be > 0");
            }
            if !t.exponent.is_finite() || t.exponent < 0.0 {
                eyre::bail!("estimator.gap_taper.exponent must be finite and >= 0");
            }
        }

        // Telemetry
        if self.telemetry.cadence_ms == 0 {
            eyre::bail!("telemetry.cadence_ms must be >= 1");
        }
        if self.telemetry.live_window_s <= 0.0 {
            eyre::bail!("telemetry.live_window_s must be > 0");
        }

        // Timeouts
        if self.timeouts.sensor_ms == 0 {
            eyre::bail!("timeouts.sensor_ms must be >= 1");
        }

        Ok(())
    }
}

/// Linear load-cell calibration: force = (raw - tare_counts) / counts_per_unit.
#[derive(Debug, Clone)]
pub struct CellCalibration {
    pub tare_counts: f64,
    pub counts_per_unit: f64,
}

impl CellCalibration {
    /// Build a calibration from CSV rows by ordinary least squares on all
    /// points. Fits force = a*raw + b, then converts to the adapter form
    /// force = (raw - tare) * a, where tare = -b/a is the zero-force baseline.
    pub fn from_rows(rows: &[CalibrationRow]) -> eyre::Result<Self> {
        if rows.len() < 2 {
            eyre::bail!("calibration requires at least two rows, got {}", rows.len());
        }

        // Ensure strictly monotonic raw values (increasing or decreasing)
        let mut dir: i8 = 0;
        for i in 1..rows.len() {
            let d = rows[i].raw - rows[i - 1].raw;
            if d == 0 {
                eyre::bail!(
                    "calibration rows have duplicate raw values at index {} and {}",
                    i - 1,
                    i
                );
            }
            let step_dir = if d > 0 { 1 } else { -1 };
            if dir == 0 {
                dir = step_dir;
            } else if dir != step_dir {
                eyre::bail!(
                    "calibration raw values must be monotonic (strictly increasing or strictly decreasing)"
                );
            }
        }

        let pts: Vec<(f64, f64)> = rows.iter().map(|r| (r.raw as f64, r.force)).collect();
        let (a0, b0) = ols_fit(&pts)?;

        // Robust sigma estimate (RMS of residuals)
        let mut sumsq = 0.0f64;
        for (x, y) in &pts {
            let r = y - (a0 * x + b0);
            sumsq += r * r;
        }
        let rms = (sumsq / (pts.len() as f64)).sqrt();

        // Reject outliers with |residual| > 2 sigma and refit if enough remain.
        let (a, b) = robust_refit(&pts, a0, b0, rms, 2.0).unwrap_or((a0, b0));

        let tare = -b / a;
        if !tare.is_finite() {
            eyre::bail!("calibration produced an invalid tare baseline");
        }
        let counts_per_unit = 1.0 / a;
        if !counts_per_unit.is_finite() || counts_per_unit == 0.0 {
            eyre::bail!("calibration produced an invalid slope");
        }
        Ok(Self {
            tare_counts: tare,
            counts_per_unit,
        })
    }
}

/// OLS fit in f64; errors on degenerate or zero-slope data.
fn ols_fit(pts: &[(f64, f64)]) -> eyre::Result<(f64, f64)> {
    let n = pts.len() as f64;
    let mean_x: f64 = pts.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y: f64 = pts.iter().map(|p| p.1).sum::<f64>() / n;
    let mut sxx = 0.0f64;
    let mut sxy = 0.0f64;
    for (x, y) in pts {
        let dx = x - mean_x;
        sxx += dx * dx;
        sxy += dx * (y - mean_y);
    }
    if !sxx.is_finite() || sxx == 0.0 {
        eyre::bail!("calibration cannot determine slope (degenerate X variance)");
    }
    let a = sxy / sxx;
    if !a.is_finite() || a == 0.0 {
        eyre::bail!("calibration produced a non-finite or zero slope");
    }
    Ok((a, mean_y - a * mean_x))
}

/// Single-step robust refit: reject points with |residual| > k * rms around
/// the initial line, then refit over the inliers with an online covariance
/// update. Returns None when refit is not applicable (non-finite/zero rms,
/// <2 inliers, degenerate variance); the caller keeps (a0, b0).
fn robust_refit(pts: &[(f64, f64)], a0: f64, b0: f64, rms: f64, k: f64) -> Option<(f64, f64)> {
    if !(rms.is_finite() && rms > 0.0 && k.is_finite() && k > 0.0) {
        return None;
    }
    if pts.len() < 2 {
        return None;
    }

    let thr = k * rms;
    let mut n_in: usize = 0;
    let mut mean_x = 0.0f64;
    let mut mean_y = 0.0f64;
    let mut cxx = 0.0f64;
    let mut cxy = 0.0f64;

    for (x, y) in pts {
        let r = y - (a0 * x + b0);
        if r.abs() <= thr {
            n_in += 1;
            let n_new = n_in as f64;
            let dx = x - mean_x;
            let dy = y - mean_y;
            let mean_x_new = mean_x + dx / n_new;
            let mean_y_new = mean_y + dy / n_new;
            cxx += dx * (x - mean_x_new);
            cxy += dx * (y - mean_y_new);
            mean_x = mean_x_new;
            mean_y = mean_y_new;
        }
    }

    if n_in >= 2 && n_in < pts.len() {
        if !cxx.is_finite() || cxx == 0.0 {
            return None;
        }
        let a = cxy / cxx;
        if !a.is_finite() || a == 0.0 {
            return None;
        }
        Some((a, mean_y - a * mean_x))
    } else {
        None
    }
}

pub fn load_calibration_csv(path: &std::path::Path) -> eyre::Result<CellCalibration> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open calibration CSV {:?}: {}", path, e))?;

    // Enforce exact headers
    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let expected = ["raw", "force"];
    let actual: Vec<String> = headers.iter().map(|s| s.to_string()).collect();
    if actual != expected {
        eyre::bail!(
            "calibration CSV must have headers 'raw,force', got: {}",
            actual.join(",")
        );
    }

    let mut rows = Vec::new();
    for (idx, rec) in rdr.deserialize::<CalibrationRow>().enumerate() {
        match rec {
            Ok(row) => rows.push(row),
            Err(e) => {
                eyre::bail!("invalid CSV row {}: {}", idx + 2, e);
            }
        }
    }

    CellCalibration::from_rows(&rows)
}

/// Persisted load-cell record: tare baseline, calibration slope, units, and
/// the last measured gap. Read at startup; updated by tare/calibration/
/// gap-finding procedures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CellRecord {
    /// Average raw reading with no load applied.
    pub tare: f64,
    /// Raw counts per calibration unit.
    pub calibration: f64,
    /// Units the cell is calibrated in (e.g. "g").
    pub units: String,
    /// Cached hammer-to-hard-stop gap in mm from the last gap-finding run.
    #[serde(default)]
    pub gap: Option<f64>,
}

impl CellRecord {
    pub fn load(path: &std::path::Path) -> eyre::Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| eyre::eyre!("read cell record {:?}: {}", path, e))?;
        let rec: Self = serde_json::from_slice(&bytes)
            .map_err(|e| eyre::eyre!("parse cell record {:?}: {}", path, e))?;
        if rec.calibration == 0.0 || !rec.calibration.is_finite() {
            eyre::bail!("cell record has an invalid calibration slope");
        }
        Ok(rec)
    }

    /// Persist atomically: write to a sibling temp file, fsync, rename.
    pub fn store(&self, path: &std::path::Path) -> eyre::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| eyre::eyre!("serialize cell record: {}", e))?;
        write_atomic(path, &bytes).map_err(|e| eyre::eyre!("write cell record {:?}: {}", path, e))
    }
}

fn write_atomic(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    let tmp = path.with_extension("new");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(tmp, path)
}
