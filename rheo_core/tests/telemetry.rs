//! Telemetry recorder: header + rows into an exclusively-owned sink, live
//! ring buffer maintenance, clean exit on stop.

use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rheo_core::state::SharedState;
use rheo_core::telemetry::{TelemetryCfg, TelemetryTask, header, sample_row};
use rheo_traits::DriveSnapshot;
use rheo_traits::clock::MonotonicClock;

/// Shared in-memory sink the test can inspect after the task exits.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().map_or(
            Err(std::io::Error::other("poisoned")),
            |mut v| {
                v.extend_from_slice(buf);
                Ok(buf.len())
            },
        )
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn fast_cfg() -> TelemetryCfg {
    TelemetryCfg {
        cadence: Duration::from_millis(5),
        ..TelemetryCfg::default()
    }
}

#[test]
fn writes_header_and_rows_then_stops() {
    let shared = Arc::new(SharedState::new(Instant::now(), 5.0));
    shared.force.store(1.25);
    shared.position_mm.store(-3.0);
    shared.gap_m.store(0.007);
    shared.test_active.store(true, Ordering::Relaxed);
    shared.publish_drive(DriveSnapshot {
        step_mode: 4,
        vin_voltage_mv: 12_000,
        ..DriveSnapshot::default()
    });

    let sink = SharedBuf::default();
    let task = TelemetryTask::spawn(
        shared.clone(),
        sink.clone(),
        fast_cfg(),
        MonotonicClock::new(),
    );
    std::thread::sleep(Duration::from_millis(60));
    shared.request_stop();
    drop(task);

    let bytes = sink.0.lock().unwrap().clone();
    let text = String::from_utf8(bytes).expect("utf8");
    let mut lines = text.lines();
    let head = lines.next().expect("header line");
    assert!(head.starts_with("Current Time,Elapsed Time,Current Position (mm)"));
    assert!(head.contains("Current Force (g)"));
    assert!(head.contains("Yield Stress (Pa)"));
    assert_eq!(head.split(',').count(), header("g").len());

    let rows: Vec<&str> = lines.collect();
    assert!(rows.len() >= 2, "expected several rows, got {}", rows.len());
    for row in &rows {
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields.len(), header("g").len());
        assert_eq!(fields[13], "1.25"); // Current Force
        assert_eq!(fields[14], "5"); // Target Force
        assert_eq!(fields[11], "4"); // Step Mode
        assert_eq!(fields[21], "true"); // Test Active?
    }
}

#[test]
fn live_trace_accumulates_and_prunes() {
    let shared = Arc::new(SharedState::new(Instant::now(), 5.0));
    let cfg = TelemetryCfg {
        cadence: Duration::from_millis(2),
        live_window_s: 0.05,
        ..TelemetryCfg::default()
    };
    let task = TelemetryTask::spawn(
        shared.clone(),
        SharedBuf::default(),
        cfg,
        MonotonicClock::new(),
    );
    std::thread::sleep(Duration::from_millis(200));
    let trace = shared.live_trace();
    shared.request_stop();
    drop(task);

    assert!(!trace.is_empty());
    let first = trace.first().expect("first").elapsed_s;
    let last = trace.last().expect("last").elapsed_s;
    // Window is 50 ms; after 200 ms of run the old points must be gone.
    assert!(last - first <= 0.1, "window not pruned: {}", last - first);
}

#[test]
fn sample_row_reflects_shared_state() {
    let shared = SharedState::new(Instant::now(), 3.0);
    shared.force.store(2.5);
    shared.error.store(0.5);
    shared.int_error.store(1.5);
    shared.der_error.store(-0.25);
    shared.viscosity.store(42.0);
    shared.yield_stress.store(7.0);
    shared.visc_volume_m3.store(4e-7);
    shared.spread_beyond_hammer.store(true, Ordering::Relaxed);

    let cfg = TelemetryCfg::default();
    let row = sample_row(&shared, &cfg, 1.5);
    assert_eq!(row.elapsed_s, 1.5);
    assert_eq!(row.force, 2.5);
    assert_eq!(row.target_force, 3.0);
    assert_eq!(row.error, 0.5);
    assert_eq!(row.int_error, 1.5);
    assert_eq!(row.der_error, -0.25);
    assert_eq!(row.viscosity, 42.0);
    assert_eq!(row.yield_stress, 7.0);
    assert!(row.spread_beyond_hammer);
    assert_eq!(row.k_i, cfg.k_i);
    assert_eq!(row.k_d, cfg.k_d);
}
