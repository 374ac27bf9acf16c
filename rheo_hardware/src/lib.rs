#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Hardware adapters for the squeeze-flow rheometer.
//!
//! Real device drivers (serial load-cell digitizer, USB stepper controller)
//! live outside this workspace; the control stack only ever sees the
//! `rheo_traits` interfaces. This crate provides:
//!
//! - a simulated rig (kinematic actuator + spring-contact sample plant)
//!   used by end-to-end tests, demos, and the CLI self-check,
//! - the outlier screen shared by all load-cell adapters,
//! - mm/steps unit conversions for drive backends.

pub mod error;
pub mod outlier;
pub mod units;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rheo_traits::clock::Clock;
use rheo_traits::{Actuator, BoxError, DriveSnapshot, ForceSensor};

use crate::error::HwError;
use crate::outlier::OutlierScreen;
use crate::units::StepScale;

/// Parameters of the simulated rig.
///
/// The virtual sample behaves as a linear spring once the hammer descends
/// into it: force = stiffness * (sample_height - gap), zero before contact.
#[derive(Debug, Clone)]
pub struct SimRigCfg {
    /// Distance from the zeroed start position down to the hard stop (mm).
    pub start_gap_mm: f64,
    /// Height of the undisturbed sample above the hard stop (mm).
    pub sample_height_mm: f64,
    /// Force units per mm of compression.
    pub stiffness: f64,
    /// Digitizer cadence; each read blocks this long.
    pub sample_period: Duration,
    /// Amplitude of the deterministic dither added to readings (units).
    pub noise_amp: f64,
    /// Microstepping mode exponent for the drive snapshot.
    pub step_mode: u8,
    /// Jump threshold for the outlier screen (units).
    pub jump_threshold: f64,
}

impl Default for SimRigCfg {
    fn default() -> Self {
        Self {
            start_gap_mm: 10.0,
            sample_height_mm: 6.5,
            stiffness: 10.0,
            sample_period: Duration::from_millis(5),
            noise_amp: 0.0,
            step_mode: 4,
            jump_threshold: outlier::DEFAULT_JUMP_THRESHOLD,
        }
    }
}

/// Mutable plant state shared by the sensor and actuator halves of the rig.
struct Plant {
    cfg: SimRigCfg,
    clock: Arc<dyn Clock + Send + Sync>,
    pos_mm: f64,
    cmd_vel_mms: f64,
    target_pos_steps: i64,
    energized: bool,
    safe_start: bool,
    max_speed_mms: f64,
    max_accel_mmss: f64,
    max_decel_mmss: f64,
    last_advance: Instant,
    last_heartbeat: Instant,
    read_count: u64,
}

impl Plant {
    /// Integrate position up to the present. Also enforces the drive's
    /// command timeout: with no heartbeat for over a second, motion stops.
    fn advance(&mut self) {
        let now = self.clock.now();
        let dt = now.saturating_duration_since(self.last_advance).as_secs_f64();
        self.last_advance = now;

        if !self.energized || self.safe_start {
            return;
        }
        if self.cmd_vel_mms != 0.0
            && now.saturating_duration_since(self.last_heartbeat) > Duration::from_secs(1)
        {
            tracing::warn!("sim drive command timeout; halting motion");
            self.cmd_vel_mms = 0.0;
        }
        self.pos_mm += self.cmd_vel_mms * dt;
        // The hard stop is a physical object.
        if self.pos_mm < -self.cfg.start_gap_mm {
            self.pos_mm = -self.cfg.start_gap_mm;
        }
    }

    fn gap_mm(&self) -> f64 {
        self.cfg.start_gap_mm + self.pos_mm
    }

    fn force(&mut self) -> f64 {
        let compression = self.cfg.sample_height_mm - self.gap_mm();
        let base = if compression > 0.0 {
            self.cfg.stiffness * compression
        } else {
            0.0
        };
        self.read_count += 1;
        base + self.cfg.noise_amp * (self.read_count as f64 * 0.7).sin()
    }
}

/// Load-cell half of the simulated rig.
pub struct SimForceSensor {
    plant: Arc<Mutex<Plant>>,
    clock: Arc<dyn Clock + Send + Sync>,
    period: Duration,
    screen: OutlierScreen,
    tare_offset: f64,
}

/// Drive half of the simulated rig.
pub struct SimActuator {
    plant: Arc<Mutex<Plant>>,
    steps: StepScale,
}

/// Build a simulated sensor/actuator pair over one shared plant.
pub fn sim_rig(
    cfg: SimRigCfg,
    clock: Arc<dyn Clock + Send + Sync>,
) -> (SimForceSensor, SimActuator) {
    let now = clock.now();
    let steps = StepScale::new(cfg.step_mode);
    let screen = OutlierScreen::new(cfg.jump_threshold, outlier::DEFAULT_WINDOW);
    let period = cfg.sample_period;
    let sensor_clock = clock.clone();
    let plant = Arc::new(Mutex::new(Plant {
        cfg,
        clock,
        pos_mm: 0.0,
        cmd_vel_mms: 0.0,
        target_pos_steps: 0,
        energized: false,
        safe_start: true,
        max_speed_mms: 5.0,
        max_accel_mmss: 20.0,
        max_decel_mmss: 20.0,
        last_advance: now,
        last_heartbeat: now,
        read_count: 0,
    }));
    (
        SimForceSensor {
            plant: plant.clone(),
            clock: sensor_clock,
            period,
            screen,
            tare_offset: 0.0,
        },
        SimActuator { plant, steps },
    )
}

fn lock<'a>(plant: &'a Arc<Mutex<Plant>>) -> Result<MutexGuard<'a, Plant>, BoxError> {
    plant
        .lock()
        .map_err(|_| Box::new(HwError::Io(std::io::Error::other("plant mutex poisoned"))) as BoxError)
}

impl ForceSensor for SimForceSensor {
    fn read(&mut self, timeout: Duration) -> Result<f64, BoxError> {
        let deadline = self.clock.now() + timeout;
        loop {
            // Pace like a real digitizer; never sleep while holding the plant.
            self.clock.sleep(self.period);
            let value = {
                let mut p = lock(&self.plant)?;
                p.advance();
                p.force() - self.tare_offset
            };
            if self.screen.admit(value) {
                return Ok(value);
            }
            tracing::trace!(value, "sim sensor rejected outlier");
            if self.clock.now() + self.period >= deadline {
                return Err(Box::new(HwError::Timeout));
            }
        }
    }

    fn tare(&mut self, samples: usize) -> Result<f64, BoxError> {
        let n = samples.max(1);
        let mut total = 0.0;
        for _ in 0..n {
            self.clock.sleep(self.period);
            let mut p = lock(&self.plant)?;
            p.advance();
            total += p.force();
        }
        self.tare_offset = total / n as f64;
        self.screen.reset();
        Ok(self.tare_offset)
    }

    fn flush_stale(&mut self) -> Result<(), BoxError> {
        self.screen.reset();
        Ok(())
    }

    fn units(&self) -> &str {
        "g"
    }
}

impl Actuator for SimActuator {
    fn energize(&mut self) -> Result<(), BoxError> {
        let mut p = lock(&self.plant)?;
        p.advance();
        p.energized = true;
        Ok(())
    }

    fn deenergize(&mut self) -> Result<(), BoxError> {
        let mut p = lock(&self.plant)?;
        p.advance();
        p.energized = false;
        p.cmd_vel_mms = 0.0;
        Ok(())
    }

    fn enter_safe_start(&mut self) -> Result<(), BoxError> {
        let mut p = lock(&self.plant)?;
        p.advance();
        p.safe_start = true;
        p.cmd_vel_mms = 0.0;
        Ok(())
    }

    fn exit_safe_start(&mut self) -> Result<(), BoxError> {
        let mut p = lock(&self.plant)?;
        p.advance();
        p.safe_start = false;
        Ok(())
    }

    fn set_velocity_mms(&mut self, vel_mms: f64) -> Result<(), BoxError> {
        let mut p = lock(&self.plant)?;
        p.advance();
        if !p.energized {
            return Err(Box::new(HwError::DriveDeenergized));
        }
        if p.safe_start {
            return Err(Box::new(HwError::SafeStart));
        }
        let limit = p.max_speed_mms;
        p.cmd_vel_mms = vel_mms.clamp(-limit, limit);
        Ok(())
    }

    fn set_target_position_mm(&mut self, pos_mm: f64) -> Result<(), BoxError> {
        let mut p = lock(&self.plant)?;
        p.advance();
        if !p.energized {
            return Err(Box::new(HwError::DriveDeenergized));
        }
        // Position moves resolve instantly in the simulation.
        p.cmd_vel_mms = 0.0;
        p.pos_mm = pos_mm.max(-p.cfg.start_gap_mm);
        p.target_pos_steps = self.steps.mm_to_steps(pos_mm).floor() as i64;
        Ok(())
    }

    fn position_mm(&mut self) -> Result<f64, BoxError> {
        let mut p = lock(&self.plant)?;
        p.advance();
        Ok(p.pos_mm)
    }

    fn velocity_mms(&mut self) -> Result<f64, BoxError> {
        let mut p = lock(&self.plant)?;
        p.advance();
        if p.energized && !p.safe_start {
            Ok(p.cmd_vel_mms)
        } else {
            Ok(0.0)
        }
    }

    fn set_max_speed_mms(&mut self, max_mms: f64) -> Result<(), BoxError> {
        let mut p = lock(&self.plant)?;
        p.max_speed_mms = max_mms.abs();
        Ok(())
    }

    fn set_max_accel_mmss(&mut self, max_mmss: f64, also_decel: bool) -> Result<(), BoxError> {
        let mut p = lock(&self.plant)?;
        p.max_accel_mmss = max_mmss.abs();
        if also_decel {
            p.max_decel_mmss = max_mmss.abs();
        }
        Ok(())
    }

    fn set_max_decel_mmss(&mut self, max_mmss: f64) -> Result<(), BoxError> {
        let mut p = lock(&self.plant)?;
        p.max_decel_mmss = max_mmss.abs();
        Ok(())
    }

    fn heartbeat(&mut self) -> Result<(), BoxError> {
        let mut p = lock(&self.plant)?;
        p.advance();
        p.last_heartbeat = p.clock.now();
        Ok(())
    }

    fn halt_and_zero(&mut self) -> Result<(), BoxError> {
        let mut p = lock(&self.plant)?;
        p.advance();
        p.cmd_vel_mms = 0.0;
        p.pos_mm = 0.0;
        p.target_pos_steps = 0;
        Ok(())
    }

    fn snapshot(&mut self) -> Result<DriveSnapshot, BoxError> {
        let mut p = lock(&self.plant)?;
        p.advance();
        let vel = if p.energized && !p.safe_start {
            p.cmd_vel_mms
        } else {
            0.0
        };
        Ok(DriveSnapshot {
            position_steps: self.steps.mm_to_steps(p.pos_mm).floor() as i64,
            target_position_steps: p.target_pos_steps,
            velocity_raw: self.steps.mms_to_vel(vel),
            target_velocity_raw: self.steps.mms_to_vel(p.cmd_vel_mms),
            max_speed_raw: self.steps.mms_to_vel(p.max_speed_mms),
            max_decel_raw: self.steps.mmss_to_accel(p.max_decel_mmss),
            max_accel_raw: self.steps.mmss_to_accel(p.max_accel_mmss),
            step_mode: p.cfg.step_mode,
            vin_voltage_mv: 12_000,
        })
    }
}
