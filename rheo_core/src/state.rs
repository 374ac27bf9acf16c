//! Shared control state for the three concurrent tasks.
//!
//! One struct, one writer per field (documented on each field group);
//! readers tolerate values that are one tick stale, so every access is a
//! relaxed atomic; no invariant requires a multi-field snapshot.
//! The two exceptions are the drive snapshot blob and the live-view ring
//! buffer, which sit behind mutexes with short, copy-out critical sections.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use rheo_traits::DriveSnapshot;

/// f64 cell with atomic store/load via bit-casting, so a reader can never
/// observe a torn write.
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(v: f64) -> Self {
        Self(AtomicU64::new(v.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }
}

/// Test phase the controller is in. Stored as a u8 in shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Approach = 0,
    Tracking = 1,
    Shutdown = 2,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Approach,
            1 => Self::Tracking,
            _ => Self::Shutdown,
        }
    }
}

/// One point of the live-view trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivePoint {
    pub elapsed_s: f64,
    pub force: f64,
    pub gap_mm: f64,
    pub yield_stress: f64,
}

pub struct SharedState {
    /// Epoch all tasks measure elapsed time from.
    pub epoch: Instant,

    // ── written by the sensor task only ──────────────────────────────────
    pub force: AtomicF64,
    pub error: AtomicF64,
    pub int_error: AtomicF64,
    pub der_error: AtomicF64,
    pub last_sample_s: AtomicF64,
    pub prev_sample_s: AtomicF64,

    // ── written by the controller task only ──────────────────────────────
    pub target: AtomicF64,
    pub step_index: AtomicUsize,
    phase: AtomicU8,
    pub test_active: AtomicBool,
    pub spread_beyond_hammer: AtomicBool,
    pub position_mm: AtomicF64,
    pub velocity_mms: AtomicF64,
    pub commanded_velocity_mms: AtomicF64,
    pub gap_m: AtomicF64,
    pub viscosity: AtomicF64,
    pub yield_stress: AtomicF64,
    pub visc_volume_m3: AtomicF64,
    pub kp_used: AtomicF64,
    drive: Mutex<DriveSnapshot>,

    // ── cancellation: set by any task, observed by all every iteration ──
    stop: AtomicBool,

    // ── written by the telemetry task only ──────────────────────────────
    live: Mutex<VecDeque<LivePoint>>,
}

impl SharedState {
    pub fn new(epoch: Instant, initial_target: f64) -> Self {
        Self {
            epoch,
            force: AtomicF64::new(0.0),
            error: AtomicF64::new(0.0),
            int_error: AtomicF64::new(0.0),
            der_error: AtomicF64::new(0.0),
            last_sample_s: AtomicF64::new(0.0),
            prev_sample_s: AtomicF64::new(0.0),
            target: AtomicF64::new(initial_target),
            step_index: AtomicUsize::new(0),
            phase: AtomicU8::new(Phase::Approach as u8),
            test_active: AtomicBool::new(false),
            spread_beyond_hammer: AtomicBool::new(false),
            position_mm: AtomicF64::new(0.0),
            velocity_mms: AtomicF64::new(0.0),
            commanded_velocity_mms: AtomicF64::new(0.0),
            gap_m: AtomicF64::new(0.0),
            viscosity: AtomicF64::new(0.0),
            yield_stress: AtomicF64::new(0.0),
            visc_volume_m3: AtomicF64::new(0.0),
            kp_used: AtomicF64::new(0.0),
            drive: Mutex::new(DriveSnapshot::default()),
            stop: AtomicBool::new(false),
            live: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_phase(&self, p: Phase) {
        self.phase.store(p as u8, Ordering::Relaxed);
    }

    /// Ask every task to wind down at its next loop iteration.
    #[inline]
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn publish_drive(&self, snap: DriveSnapshot) {
        if let Ok(mut d) = self.drive.lock() {
            *d = snap;
        }
    }

    pub fn drive_snapshot(&self) -> DriveSnapshot {
        self.drive.lock().map(|d| *d).unwrap_or_default()
    }

    /// Append a live-view point, pruning entries older than `window_s`.
    pub fn push_live(&self, point: LivePoint, window_s: f64) {
        if let Ok(mut buf) = self.live.lock() {
            buf.push_back(point);
            let cutoff = point.elapsed_s - window_s;
            while buf.front().is_some_and(|p| p.elapsed_s < cutoff) {
                buf.pop_front();
            }
        }
    }

    /// Drop live-view history older than `keep_s` before `now_s`. Used when
    /// the test goes active to discard most of the pre-test trace.
    pub fn trim_live(&self, now_s: f64, keep_s: f64) {
        if let Ok(mut buf) = self.live.lock() {
            let cutoff = now_s - keep_s;
            while buf.front().is_some_and(|p| p.elapsed_s < cutoff) {
                buf.pop_front();
            }
        }
    }

    /// Copy of the live trace for rendering; never hands out the buffer
    /// itself, so a renderer can't race the recorder's appends.
    pub fn live_trace(&self) -> Vec<LivePoint> {
        self.live
            .lock()
            .map(|buf| buf.iter().copied().collect())
            .unwrap_or_default()
    }
}
