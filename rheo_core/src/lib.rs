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
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Force-tracking control core for the squeeze-flow rheometer
//! (hardware-agnostic).
//!
//! All hardware interactions go through the `rheo_traits::ForceSensor` and
//! `rheo_traits::Actuator` traits.
//!
//! ## Architecture
//!
//! Three concurrent tasks share one [`state::SharedState`], each field with
//! exactly one writer:
//!
//! - **Sensor task** (`sensor`): blocks on calibrated readings, computes the
//!   PID error terms (`pid`), publishes them.
//! - **Controller task** (`controller`): APPROACH -> TRACKING -> SHUTDOWN
//!   state machine; gain-scheduled velocity commands, safety envelope,
//!   multi-step target sequencing, per-tick drive heartbeat, property
//!   estimates (`estimator`).
//! - **Telemetry task** (`telemetry`): fixed-cadence CSV recorder + live
//!   ring buffer; owns the sink exclusively.
//!
//! `runner::run_session` wires the three together and guarantees the
//! shutdown sequence runs on every exit path.

pub mod controller;
pub mod conversions;
pub mod error;
pub mod estimator;
pub mod mocks;
pub mod pid;
pub mod runner;
pub mod sensor;
pub mod state;
pub mod telemetry;

pub use controller::{ControlCfg, Controller, GapTaper, RunOutcome};
pub use conversions::session_params;
pub use error::{AbortReason, BuildError, Result, RheoError};
pub use estimator::{
    GRAMS_TO_NEWTONS, Geometry, PropertyEstimator, PropertySample, YieldStressPolicy,
    grams_to_newtons,
};
pub use pid::{DerivativePolicy, ErrorEstimator, ErrorTerms, PidTuning, ScheduledGain};
pub use runner::{SessionParams, SessionReport, run_session};
pub use sensor::{SensorCfg, SensorTask};
pub use state::{AtomicF64, LivePoint, Phase, SharedState};
pub use telemetry::{TelemetryCfg, TelemetryRow, TelemetryTask};
