use std::sync::Arc;
use std::time::Duration;

use rheo_hardware::units::StepScale;
use rheo_hardware::{SimRigCfg, sim_rig};
use rheo_traits::clock::TestClock;
use rheo_traits::{Actuator, ForceSensor};
use rstest::rstest;

#[rstest]
#[case(0, 100.0)]
#[case(2, 400.0)]
#[case(4, 1600.0)]
fn step_scale_tracks_microstep_ratio(#[case] step_mode: u8, #[case] steps_per_mm: f64) {
    let s = StepScale::new(step_mode);
    assert!((s.mm_to_steps(1.0) - steps_per_mm).abs() < 1e-9);
    assert!((s.steps_to_mm(steps_per_mm) - 1.0).abs() < 1e-9);
}

fn rig() -> (
    rheo_hardware::SimForceSensor,
    rheo_hardware::SimActuator,
    TestClock,
) {
    let clock = TestClock::new();
    let (sensor, actuator) = sim_rig(SimRigCfg::default(), Arc::new(clock.clone()));
    (sensor, actuator, clock)
}

#[test]
fn no_motion_until_energized_and_out_of_safe_start() {
    let (_s, mut a, _clk) = rig();
    assert!(a.set_velocity_mms(-1.0).is_err());
    a.energize().expect("energize");
    assert!(a.set_velocity_mms(-1.0).is_err());
    a.exit_safe_start().expect("exit safe start");
    a.set_velocity_mms(-1.0).expect("velocity accepted");
}

#[test]
fn position_integrates_commanded_velocity() {
    let (_s, mut a, clk) = rig();
    a.energize().expect("energize");
    a.exit_safe_start().expect("exit safe start");
    a.set_velocity_mms(-1.0).expect("set velocity");
    // keep the command timeout fed while advancing in 0.5 s slices
    for _ in 0..4 {
        clk.advance(Duration::from_millis(500));
        a.heartbeat().expect("heartbeat");
    }
    let pos = a.position_mm().expect("position");
    assert!((pos + 2.0).abs() < 1e-6, "pos = {pos}");
}

#[test]
fn force_ramps_once_hammer_contacts_sample() {
    let (mut s, mut a, clk) = rig();
    a.energize().expect("energize");
    a.exit_safe_start().expect("exit safe start");

    // At the start position the gap (10 mm) exceeds the sample height (6.5 mm).
    let f0 = s.read(Duration::from_millis(100)).expect("read");
    assert!(f0.abs() < 1e-9, "no contact yet: {f0}");

    // Drive to 4 mm below start: gap 6 mm, compression 0.5 mm, k = 10 /mm.
    a.set_velocity_mms(-1.0).expect("set velocity");
    for _ in 0..8 {
        clk.advance(Duration::from_millis(500));
        a.heartbeat().expect("heartbeat");
    }
    let f = s.read(Duration::from_millis(100)).expect("read");
    assert!((f - 5.0).abs() < 0.1, "expected ~5 units, got {f}");
}

#[test]
fn missed_heartbeat_halts_motion() {
    let (_s, mut a, clk) = rig();
    a.energize().expect("energize");
    a.exit_safe_start().expect("exit safe start");
    a.set_velocity_mms(-1.0).expect("set velocity");
    // No heartbeat for 3 s: the drive stops itself after its 1 s timeout.
    clk.advance(Duration::from_secs(3));
    let pos = a.position_mm().expect("position");
    assert!(pos > -3.0, "drive kept moving without heartbeat: {pos}");
}

#[test]
fn hard_stop_clamps_travel() {
    let (_s, mut a, clk) = rig();
    a.energize().expect("energize");
    a.exit_safe_start().expect("exit safe start");
    a.set_max_speed_mms(50.0).expect("max speed");
    a.set_velocity_mms(-50.0).expect("set velocity");
    for _ in 0..10 {
        clk.advance(Duration::from_millis(500));
        a.heartbeat().expect("heartbeat");
    }
    let pos = a.position_mm().expect("position");
    assert!((pos + 10.0).abs() < 1e-6, "expected clamp at -10 mm, got {pos}");
}

#[test]
fn tare_zeroes_steady_reading() {
    let cfg = SimRigCfg {
        noise_amp: 0.0,
        ..SimRigCfg::default()
    };
    let clock = TestClock::new();
    let (mut s, mut a, _) = {
        let (s, a) = sim_rig(cfg, Arc::new(clock.clone()));
        (s, a, ())
    };
    a.energize().expect("energize");
    a.exit_safe_start().expect("exit safe start");
    // Park in contact so there is a nonzero baseline to remove.
    a.set_velocity_mms(-1.0).expect("set velocity");
    for _ in 0..8 {
        clock.advance(Duration::from_millis(500));
        a.heartbeat().expect("heartbeat");
    }
    a.set_velocity_mms(0.0).expect("stop");
    let before = s.read(Duration::from_millis(100)).expect("read");
    assert!(before > 1.0);
    s.tare(16).expect("tare");
    let after = s.read(Duration::from_millis(100)).expect("read");
    assert!(after.abs() < 1e-6, "after tare: {after}");
}

#[test]
fn snapshot_reports_device_units() {
    let (_s, mut a, _clk) = rig();
    a.energize().expect("energize");
    a.exit_safe_start().expect("exit safe start");
    a.set_velocity_mms(-1.0).expect("set velocity");
    let snap = a.snapshot().expect("snapshot");
    // step_mode 4 => 16 microsteps/step; -1 mm/s = -16e6 microsteps/10ks
    assert_eq!(snap.step_mode, 4);
    assert_eq!(snap.target_velocity_raw, -16_000_000);
    assert_eq!(snap.vin_voltage_mv, 12_000);
}

#[test]
fn clock_time_is_the_only_time() {
    // Simulated time comes from the injected clock alone: one read advances
    // it by exactly one 5 ms sample period, so the plate moves 0.005 mm.
    let (mut s, mut a, _clk) = rig();
    a.energize().expect("energize");
    a.exit_safe_start().expect("exit safe start");
    a.set_velocity_mms(-1.0).expect("set velocity");
    let p0 = a.position_mm().expect("position");
    let _ = s.read(Duration::from_millis(50)).expect("read");
    let p1 = a.position_mm().expect("position");
    assert!((p0 - p1 - 0.005).abs() < 1e-9, "p0={p0} p1={p1}");
}
