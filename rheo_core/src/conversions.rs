//! `From` implementations bridging `rheo_config` types to `rheo_core` types,
//! plus the one assembly helper the CLI uses to build `SessionParams`.

use std::time::Duration;

use crate::controller::{ControlCfg, GapTaper};
use crate::estimator::{Geometry, YieldStressPolicy};
use crate::pid::{DerivativePolicy, PidTuning, ScheduledGain};
use crate::runner::SessionParams;
use crate::sensor::SensorCfg;
use crate::telemetry::TelemetryCfg;

impl From<rheo_config::DerivativeScheme> for DerivativePolicy {
    fn from(s: rheo_config::DerivativeScheme) -> Self {
        match s {
            rheo_config::DerivativeScheme::First => Self::FirstOrder,
            rheo_config::DerivativeScheme::Second => Self::SecondOrder,
        }
    }
}

impl From<&rheo_config::PidCfg> for PidTuning {
    fn from(c: &rheo_config::PidCfg) -> Self {
        Self {
            decay_rate: c.decay_rate,
            int_clamp: c.int_clamp,
            derivative: c.derivative.into(),
        }
    }
}

impl From<&rheo_config::ScheduleCfg> for ScheduledGain {
    fn from(c: &rheo_config::ScheduleCfg) -> Self {
        Self {
            a: c.a,
            b: c.b,
            c: c.c,
            d: c.d,
        }
    }
}

impl From<rheo_config::YieldStressForm> for YieldStressPolicy {
    fn from(f: rheo_config::YieldStressForm) -> Self {
        match f {
            rheo_config::YieldStressForm::GapRatio => Self::GapRatio,
            rheo_config::YieldStressForm::Plastic => Self::Plastic,
        }
    }
}

impl From<&rheo_config::GapTaperCfg> for GapTaper {
    fn from(c: &rheo_config::GapTaperCfg) -> Self {
        Self {
            reference_gap_mm: c.reference_gap_mm,
            exponent: c.exponent,
        }
    }
}

/// Assemble core session parameters from a validated config.
///
/// `start_gap_mm` is resolved by the caller (config value or persisted cell
/// record); `units` comes from the sensor's calibration.
pub fn session_params(cfg: &rheo_config::Config, start_gap_mm: f64, units: &str) -> SessionParams {
    let sample_volume_m3 = cfg.session.sample_volume_ml * 1e-6;
    SessionParams {
        targets: cfg.session.targets.clone(),
        sample_volume_m3,
        tuning: (&cfg.pid).into(),
        control: ControlCfg {
            approach_velocity_mms: cfg.motion.approach_velocity_mms,
            force_threshold: cfg.safety.force_threshold,
            max_force: cfg.safety.max_force,
            min_position_mm: cfg.safety.min_position_mm,
            start_gap_mm,
            step_duration: Duration::from_secs_f64(cfg.session.step_duration_s),
            tick: Duration::from_millis(20),
            max_test_duration: Duration::from_secs_f64(cfg.safety.max_test_duration_s),
            k_i: cfg.pid.k_i,
            k_d: cfg.pid.k_d,
            schedule: (&cfg.schedule).into(),
            der_settle: Duration::from_millis(cfg.pid.der_settle_ms),
            gap_taper: cfg.estimator.gap_taper.as_ref().map(Into::into),
            max_speed_mms: cfg.motion.max_speed_mms,
            max_accel_mmss: cfg.motion.max_accel_mmss,
            live_keep_s: 2.0,
        },
        sensor: SensorCfg {
            force_up_sign: f64::from(cfg.estimator.force_up_sign),
            read_timeout: Duration::from_millis(cfg.timeouts.sensor_ms),
            startup_discard: 10,
            max_test_duration: Duration::from_secs_f64(cfg.safety.max_test_duration_s),
        },
        telemetry: TelemetryCfg {
            cadence: Duration::from_millis(cfg.telemetry.cadence_ms),
            live_window_s: cfg.telemetry.live_window_s,
            units: units.to_string(),
            start_gap_mm,
            sample_volume_m3,
            k_i: cfg.pid.k_i,
            k_d: cfg.pid.k_d,
            max_test_duration: Duration::from_secs_f64(cfg.safety.max_test_duration_s),
        },
        geometry: Geometry {
            hammer_radius_m: cfg.estimator.hammer_radius_m,
        },
        yield_policy: cfg.estimator.yield_stress.into(),
    }
}
