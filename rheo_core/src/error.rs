use thiserror::Error;

/// Why a run was terminated early. Every reason maps to an operator-facing
/// diagnosis printed before the shutdown sequence runs.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    #[error("force exceeded the safety limit")]
    OverForce,
    #[error("hit the hard-stop")]
    HardStop,
    #[error("hit the hard-stop without reaching the force threshold")]
    NoContact,
    #[error("returned too close to home")]
    OverRetraction,
    #[error("max test duration exceeded")]
    MaxRuntime,
    #[error("interrupted by operator")]
    Interrupted,
}

#[derive(Debug, Error, Clone)]
pub enum RheoError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("timeout waiting for sensor")]
    Timeout,
    #[error("invalid state: {0}")]
    State(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("test aborted: {0}")]
    Abort(AbortReason),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing force sensor")]
    MissingSensor,
    #[error("missing actuator")]
    MissingActuator,
    #[error("missing force targets")]
    MissingTargets,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;

/// Map a trait-boundary error to a typed `RheoError`.
///
/// Attempts to downcast known hardware error types first, then falls back to
/// string-based heuristics.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> RheoError {
    #[cfg(feature = "hardware-errors")]
    {
        if let Some(hw) = e.downcast_ref::<rheo_hardware::error::HwError>() {
            return match hw {
                rheo_hardware::error::HwError::Timeout => RheoError::Timeout,
                other => RheoError::HardwareFault(other.to_string()),
            };
        }
    }

    let s = e.to_string();
    if s.to_lowercase().contains("timeout") {
        RheoError::Timeout
    } else {
        RheoError::Hardware(s)
    }
}
