pub mod clock;

pub use clock::{Clock, MonotonicClock};

use std::time::Duration;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Device-variable snapshot the drive reports alongside physical-unit
/// position/velocity. Published once per controller tick so the telemetry
/// task never has to touch the device handle itself.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DriveSnapshot {
    /// Position in device steps.
    pub position_steps: i64,
    /// Target position in device steps.
    pub target_position_steps: i64,
    /// Velocity in device units (steps per 10,000 s).
    pub velocity_raw: i64,
    /// Target velocity in device units (steps per 10,000 s).
    pub target_velocity_raw: i64,
    /// Max speed limit in device units.
    pub max_speed_raw: i64,
    /// Max deceleration limit in device units.
    pub max_decel_raw: i64,
    /// Max acceleration limit in device units.
    pub max_accel_raw: i64,
    /// Microstepping mode exponent (microsteps per full step = 2^step_mode).
    pub step_mode: u8,
    /// Supply voltage in mV.
    pub vin_voltage_mv: u32,
}

/// Calibrated force sensor (load cell behind a serial digitizer or a
/// simulated plant).
///
/// `read` blocks until a valid, outlier-screened sample is available or the
/// timeout expires. Transient decode failures are the adapter's problem and
/// must never surface here; a returned error means the device produced
/// nothing usable for the whole timeout window.
pub trait ForceSensor {
    /// Next calibrated reading in the sensor's calibration units.
    fn read(&mut self, timeout: Duration) -> Result<f64, BoxError>;

    /// Average `samples` readings with no load applied and persist the
    /// result as the new tare baseline. Returns the tare value in raw counts.
    fn tare(&mut self, samples: usize) -> Result<f64, BoxError>;

    /// Discard any buffered readings that accumulated while the caller was
    /// busy, so the next `read` reflects the present.
    fn flush_stale(&mut self) -> Result<(), BoxError>;

    /// Units the calibration was performed in (e.g. "g").
    fn units(&self) -> &str;
}

/// Linear drive moving the hammer plate, commanded in physical units.
///
/// Implementations own all conversions between mm / mm/s and device-native
/// step counts. The device safety-stops unless `heartbeat` is called at
/// least once per second while energized.
pub trait Actuator {
    fn energize(&mut self) -> Result<(), BoxError>;
    fn deenergize(&mut self) -> Result<(), BoxError>;
    fn enter_safe_start(&mut self) -> Result<(), BoxError>;
    fn exit_safe_start(&mut self) -> Result<(), BoxError>;

    /// Command a target velocity in mm/s (negative = toward the sample).
    fn set_velocity_mms(&mut self, vel_mms: f64) -> Result<(), BoxError>;
    /// Command an absolute target position in mm from the zeroed origin.
    fn set_target_position_mm(&mut self, pos_mm: f64) -> Result<(), BoxError>;

    fn position_mm(&mut self) -> Result<f64, BoxError>;
    fn velocity_mms(&mut self) -> Result<f64, BoxError>;

    fn set_max_speed_mms(&mut self, max_mms: f64) -> Result<(), BoxError>;
    /// Set the acceleration limit; optionally mirror it onto the decel limit.
    fn set_max_accel_mmss(&mut self, max_mmss: f64, also_decel: bool) -> Result<(), BoxError>;
    fn set_max_decel_mmss(&mut self, max_mmss: f64) -> Result<(), BoxError>;

    /// Reset the device command timeout. Must be invoked at least once per
    /// second or the drive halts itself.
    fn heartbeat(&mut self) -> Result<(), BoxError>;

    /// Stop motion immediately and re-zero the position counter.
    fn halt_and_zero(&mut self) -> Result<(), BoxError>;

    /// Raw device variables for telemetry.
    fn snapshot(&mut self) -> Result<DriveSnapshot, BoxError>;
}
