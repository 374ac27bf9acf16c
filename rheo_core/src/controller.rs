//! Gain-scheduled force-tracking controller.
//!
//! Phase machine: APPROACH -> TRACKING (with multi-step target sequencing)
//! -> SHUTDOWN. The controller never blocks on the sensor; it consumes
//! whatever error terms are currently published, tolerating slightly stale
//! data, and throttles itself with a fixed tick that keeps the drive's
//! command-timeout watchdog fed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rheo_traits::Actuator;
use rheo_traits::clock::Clock;

use crate::error::{AbortReason, Result, map_hw_error};
use crate::estimator::PropertyEstimator;
use crate::pid::ScheduledGain;
use crate::state::{Phase, SharedState};
use eyre::WrapErr;

/// Velocity taper (gap / reference_gap)^exponent: slows the plate down as
/// the gap narrows, where small position errors mean large force swings.
#[derive(Debug, Clone, Copy)]
pub struct GapTaper {
    pub reference_gap_mm: f64,
    pub exponent: f64,
}

#[derive(Debug, Clone)]
pub struct ControlCfg {
    /// Fixed velocity toward the sample before the threshold is met (mm/s,
    /// negative).
    pub approach_velocity_mms: f64,
    /// |force| must exceed this for closed-loop control to engage.
    pub force_threshold: f64,
    /// |force| beyond this aborts the run.
    pub max_force: f64,
    /// |position| at or below this during tracking means the plate retracted
    /// too far (mm).
    pub min_position_mm: f64,
    /// Starting hammer-to-hard-stop distance (mm); |position| reaching it is
    /// the hard-stop fault.
    pub start_gap_mm: f64,
    /// How long each target is held before advancing.
    pub step_duration: Duration,
    /// Controller tick; also the heartbeat cadence. Must stay well under the
    /// drive's 1 s command timeout.
    pub tick: Duration,
    /// Dead-man ceiling shared by all tasks.
    pub max_test_duration: Duration,
    /// Integral gain, (units*s) -> mm/s.
    pub k_i: f64,
    /// Derivative gain, (units/s) -> mm/s.
    pub k_d: f64,
    pub schedule: ScheduledGain,
    /// Mute the derivative term this long after a target step to suppress
    /// the transient from the instantaneous target jump.
    pub der_settle: Duration,
    pub gap_taper: Option<GapTaper>,
    pub max_speed_mms: f64,
    pub max_accel_mmss: f64,
    /// Pre-test live-view history kept when the test goes active (s).
    pub live_keep_s: f64,
}

impl Default for ControlCfg {
    fn default() -> Self {
        Self {
            approach_velocity_mms: -1.0,
            force_threshold: 0.6,
            max_force: 80.0,
            min_position_mm: 1.0,
            start_gap_mm: 10.0,
            step_duration: Duration::from_secs(250),
            tick: Duration::from_millis(20),
            max_test_duration: Duration::from_secs(2000),
            k_i: 0.005,
            k_d: 0.000167,
            schedule: ScheduledGain::default(),
            der_settle: Duration::from_millis(500),
            gap_taper: None,
            max_speed_mms: 5.0,
            max_accel_mmss: 20.0,
            live_keep_s: 2.0,
        }
    }
}

/// How a run ended. Faults carry the reason; the runner maps them to typed
/// errors after shutdown has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every target step was held for its full duration.
    Completed,
    Aborted(AbortReason),
}

pub struct Controller<A: Actuator, C: Clock> {
    drive: A,
    clock: C,
    shared: Arc<SharedState>,
    cfg: ControlCfg,
    targets: Vec<f64>,
    estimator: PropertyEstimator,
    /// External interrupt (ctrl-c); observed every tick.
    interrupt: Option<Arc<AtomicBool>>,
}

impl<A: Actuator, C: Clock> Controller<A, C> {
    pub fn new(
        drive: A,
        clock: C,
        shared: Arc<SharedState>,
        cfg: ControlCfg,
        targets: Vec<f64>,
        estimator: PropertyEstimator,
        interrupt: Option<Arc<AtomicBool>>,
    ) -> Self {
        Self {
            drive,
            clock,
            shared,
            cfg,
            targets,
            estimator,
            interrupt,
        }
    }

    /// Drive the whole test. Whatever happens inside (clean completion, a
    /// safety trip, a hardware error), the shutdown sequence runs and the
    /// stop flag is raised before this returns.
    pub fn run(&mut self) -> Result<RunOutcome> {
        let outcome = self.run_inner();
        self.shared.test_active.store(false, Ordering::Relaxed);
        self.shared.set_phase(Phase::Shutdown);
        // Stop the peers before homing so the published end-of-test state
        // (force, gap, estimates) is not overwritten by the ride home.
        self.shared.request_stop();
        self.quiet_down();
        outcome
    }

    fn run_inner(&mut self) -> Result<RunOutcome> {
        self.startup()?;
        match self.approach()? {
            Some(reason) => Ok(RunOutcome::Aborted(reason)),
            None => self.track(),
        }
    }

    fn startup(&mut self) -> Result<()> {
        self.drive
            .set_max_accel_mmss(self.cfg.max_accel_mmss, true)
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("set max accel")?;
        self.drive
            .set_max_speed_mms(self.cfg.max_speed_mms)
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("set max speed")?;
        self.drive
            .halt_and_zero()
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("zero position")?;
        tracing::info!("Energizing");
        self.drive
            .energize()
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("energize")?;
        tracing::info!("Exiting safe start");
        self.drive
            .exit_safe_start()
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("exit safe start")?;
        self.heartbeat()?;
        Ok(())
    }

    #[inline]
    fn heartbeat(&mut self) -> Result<()> {
        self.drive
            .heartbeat()
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("heartbeat")
    }

    #[inline]
    fn elapsed_s(&self) -> f64 {
        self.clock.secs_since(self.shared.epoch)
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
            || self.shared.stopped()
    }

    fn position_mm(&mut self) -> Result<f64> {
        let pos = self
            .drive
            .position_mm()
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("read position")?;
        self.shared.position_mm.store(pos);
        self.shared
            .gap_m
            .store((pos + self.cfg.start_gap_mm) / 1000.0);
        Ok(pos)
    }

    fn publish_drive_snapshot(&mut self) {
        match self.drive.snapshot() {
            Ok(snap) => self.shared.publish_drive(snap),
            Err(e) => tracing::debug!(error = %e, "drive snapshot unavailable"),
        }
    }

    /// Drive at the approach velocity until the force threshold is crossed.
    /// Returns the abort reason if a fault fires first.
    fn approach(&mut self) -> Result<Option<AbortReason>> {
        self.shared.set_phase(Phase::Approach);
        self.drive
            .set_velocity_mms(self.cfg.approach_velocity_mms)
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("approach velocity")?;

        loop {
            self.heartbeat()?;

            if self.elapsed_s() >= self.cfg.max_test_duration.as_secs_f64() {
                tracing::error!("Max test duration exceeded during approach, stopping.");
                return Ok(Some(AbortReason::MaxRuntime));
            }
            if self.interrupted() {
                tracing::error!("Interrupted during approach, stopping.");
                return Ok(Some(AbortReason::Interrupted));
            }

            let force = self.shared.force.load();
            if force.abs() > self.cfg.max_force {
                tracing::error!("Force was too large, stopping.");
                return Ok(Some(AbortReason::OverForce));
            }
            if force.abs() > self.cfg.force_threshold {
                tracing::info!("Force threshold met, switching over to force-velocity control.");
                return Ok(None);
            }

            let pos = self.position_mm()?;
            if pos.abs() >= self.cfg.start_gap_mm {
                tracing::error!(
                    "Hit the hard-stop without ever exceeding threshold force, stopping."
                );
                return Ok(Some(AbortReason::NoContact));
            }

            self.publish_drive_snapshot();
            self.clock.sleep(self.cfg.tick);
        }
    }

    /// Closed-loop force tracking across the target sequence.
    fn track(&mut self) -> Result<RunOutcome> {
        self.shared.test_active.store(true, Ordering::Relaxed);
        self.shared.set_phase(Phase::Tracking);

        let now = self.elapsed_s();
        // Most of the approach trace is noise; keep a short tail for context.
        self.shared.trim_live(now, self.cfg.live_keep_s);

        let mut step_index = 0usize;
        self.shared.step_index.store(step_index, Ordering::Relaxed);
        self.shared.target.store(self.targets[step_index]);
        let mut step_started = now;
        let mut der_mute_until = f64::NEG_INFINITY;

        loop {
            self.heartbeat()?;
            let now = self.elapsed_s();

            if now >= self.cfg.max_test_duration.as_secs_f64() {
                tracing::error!("Max test duration exceeded, stopping.");
                return Ok(RunOutcome::Aborted(AbortReason::MaxRuntime));
            }
            if self.interrupted() {
                tracing::error!("Interrupted, stopping.");
                return Ok(RunOutcome::Aborted(AbortReason::Interrupted));
            }

            // Fault envelope, evaluated every tick.
            let force = self.shared.force.load();
            if force.abs() > self.cfg.max_force {
                tracing::error!("Force was too large, stopping.");
                return Ok(RunOutcome::Aborted(AbortReason::OverForce));
            }
            let pos = self.position_mm()?;
            if pos.abs() >= self.cfg.start_gap_mm {
                tracing::error!("Hit the hard-stop, stopping.");
                return Ok(RunOutcome::Aborted(AbortReason::HardStop));
            }
            if pos.abs() <= self.cfg.min_position_mm {
                tracing::error!("Returned too close to home, stopping.");
                return Ok(RunOutcome::Aborted(AbortReason::OverRetraction));
            }

            // Gap, spread latch, property estimates.
            let gap_m = (pos + self.cfg.start_gap_mm) / 1000.0;
            let vel = self
                .drive
                .velocity_mms()
                .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
                .wrap_err("read velocity")?;
            self.shared.velocity_mms.store(vel);
            let props = self.estimator.update(force, gap_m, vel);
            self.shared.viscosity.store(props.viscosity);
            self.shared.yield_stress.store(props.yield_stress);
            self.shared.visc_volume_m3.store(props.visc_volume_m3);
            self.shared
                .spread_beyond_hammer
                .store(props.spread_beyond_hammer, Ordering::Relaxed);

            // Gain-scheduled velocity response, clamped to downward motion:
            // squeeze-flow geometry never retracts under closed-loop control.
            let target = self.shared.target.load();
            let error = self.shared.error.load();
            let int_error = self.shared.int_error.load();
            let der_error = self.shared.der_error.load();
            let kp = self.cfg.schedule.kp(error, target);
            self.shared.kp_used.store(kp);
            let kd = if now < der_mute_until { 0.0 } else { self.cfg.k_d };
            let mut v_new = kp * -error + kd * -der_error + self.cfg.k_i * -int_error;
            if let Some(taper) = self.cfg.gap_taper {
                let gap_mm = gap_m * 1000.0;
                let factor = (gap_mm / taper.reference_gap_mm).powf(taper.exponent);
                if factor.is_finite() && factor > 0.0 {
                    v_new *= factor;
                }
            }
            let v_new = v_new.min(0.0);
            self.drive
                .set_velocity_mms(v_new)
                .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
                .wrap_err("set velocity")?;
            self.shared.commanded_velocity_mms.store(v_new);

            // Step sequencing: hold each target for its duration, then jump.
            if now - step_started >= self.cfg.step_duration.as_secs_f64() {
                step_index += 1;
                if step_index >= self.targets.len() {
                    tracing::info!("All target steps held, test complete.");
                    return Ok(RunOutcome::Completed);
                }
                tracing::info!(
                    target = self.targets[step_index],
                    step = step_index,
                    "Step time limit reached, next step."
                );
                self.shared.step_index.store(step_index, Ordering::Relaxed);
                self.shared.target.store(self.targets[step_index]);
                step_started = now;
                der_mute_until = now + self.cfg.der_settle.as_secs_f64();
            }

            self.publish_drive_snapshot();
            self.clock.sleep(self.cfg.tick);
        }
    }

    /// Return to home, enter safe start, de-energize. Best effort all the
    /// way down: a failing step is logged and the rest still runs, and
    /// de-energize is retried because the plate must not be left powered.
    fn quiet_down(&mut self) {
        tracing::info!("Going to zero");
        if let Err(e) = self.drive.set_velocity_mms(0.0) {
            tracing::warn!(error = %e, "zero velocity failed during shutdown");
        }
        match self.drive.set_target_position_mm(0.0) {
            Ok(()) => {
                let deadline = self.clock.now() + Duration::from_secs(30);
                loop {
                    match self.drive.position_mm() {
                        Ok(pos) if pos.abs() < 0.05 => break,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "position read failed during homing");
                            break;
                        }
                    }
                    if self.clock.now() >= deadline {
                        tracing::warn!("drive did not reach home before timeout");
                        break;
                    }
                    let _ = self.drive.heartbeat();
                    self.clock.sleep(self.cfg.tick);
                }
            }
            Err(e) => tracing::warn!(error = %e, "homing command failed during shutdown"),
        }

        tracing::info!("Entering safe start");
        if let Err(e) = self.drive.enter_safe_start() {
            tracing::warn!(error = %e, "enter safe start failed during shutdown");
        }
        tracing::info!("De-energizing");
        for attempt in 1..=3 {
            match self.drive.deenergize() {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "de-energize failed, retrying");
                    self.clock.sleep(Duration::from_millis(50));
                }
            }
        }
        tracing::info!(
            final_force = self.shared.force.load(),
            final_error = self.shared.error.load(),
            "shutdown complete"
        );
    }
}
