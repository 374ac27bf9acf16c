//! Human-readable error descriptions and structured JSON error formatting.

use rheo_core::error::AbortReason;

pub fn abort_reason_name(r: &AbortReason) -> &'static str {
    use AbortReason::*;
    match r {
        OverForce => "OverForce",
        HardStop => "HardStop",
        NoContact => "NoContact",
        OverRetraction => "OverRetraction",
        MaxRuntime => "MaxRuntime",
        Interrupted => "Interrupted",
    }
}

/// Map an eyre::Report to a human-readable explanation with likely causes
/// and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    use rheo_core::error::{BuildError, RheoError};

    // Typed matches first
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingSensor => {
                "What happened: No force sensor was provided to the control core.\nLikely causes: The load-cell adapter failed to initialize.\nHow to fix: Check the load-cell connection, or run with --simulate.".to_string()
            }
            BuildError::MissingActuator => {
                "What happened: No actuator was provided to the control core.\nLikely causes: The drive adapter failed to initialize.\nHow to fix: Check the drive connection and power, or run with --simulate.".to_string()
            }
            BuildError::MissingTargets => {
                "What happened: No force targets were configured.\nLikely causes: session.targets is empty and --targets was not passed.\nHow to fix: Provide at least one target (e.g. `rheo run --targets 5`).".to_string()
            }
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML, or bad CLI overrides.\nHow to fix: Edit the config file or the override flags, then rerun."
            ),
        };
    }

    if let Some(re) = err.downcast_ref::<RheoError>() {
        if matches!(re, RheoError::Timeout) {
            return "What happened: The load cell stopped producing readings.\nLikely causes: Digitizer unplugged, wrong port, or timeout too low.\nHow to fix: Check the sensor cabling and timeouts.sensor_ms in the config.".to_string();
        }
        if let RheoError::Abort(reason) = re {
            use AbortReason::*;
            return match reason {
                OverForce => "What happened: Force was too large; the test was stopped.\nLikely causes: Sample stiffer than expected, or max_force set too low.\nHow to fix: The actuator was homed and de-energized. Raise safety.max_force only if the load cell rating allows it.".to_string(),
                HardStop => "What happened: The plate hit the hard-stop; the test was stopped.\nLikely causes: Start gap set larger than the true gap, or sample thinner than expected.\nHow to fix: Re-measure the gap (or refresh the cached gap) and rerun.".to_string(),
                NoContact => "What happened: The plate reached the hard-stop without ever exceeding the threshold force.\nLikely causes: No sample under the hammer, or force_threshold set too high.\nHow to fix: Check sample placement and safety.force_threshold.".to_string(),
                OverRetraction => "What happened: The plate returned too close to home; the test was stopped.\nLikely causes: Target sequence dropped the force so low the controller backed out.\nHow to fix: Check the target list and the tare.".to_string(),
                MaxRuntime => "What happened: The max test duration was exceeded.\nLikely causes: Hold durations longer than safety.max_test_duration_s, or a stalled approach.\nHow to fix: Raise safety.max_test_duration_s or shorten the test.".to_string(),
                Interrupted => "What happened: The run was interrupted by the operator.\nHow to fix: The actuator was homed and de-energized; rerun when ready.".to_string(),
            };
        }
        return format!(
            "What happened: {re}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
        );
    }

    // String-based heuristics for errors coming from init or config
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("calibration csv must have headers") {
        return "Invalid headers in calibration CSV. Expected 'raw,force'.".to_string();
    }
    if lower.contains("cell record") {
        return format!(
            "What happened: The persisted load-cell record could not be used.\nLikely causes: Missing or corrupt file, or the cell was never calibrated.\nHow to fix: Run tare/calibration first, or point --cell at the right file. Original: {msg}"
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Map AbortReason (if present) to stable exit codes; non-abort errors
/// return 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    use rheo_core::error::RheoError;
    if let Some(RheoError::Abort(reason)) = err.downcast_ref::<RheoError>() {
        return match reason {
            AbortReason::Interrupted => 2,
            AbortReason::MaxRuntime => 4,
            AbortReason::OverForce => 5,
            AbortReason::HardStop => 6,
            AbortReason::NoContact => 7,
            AbortReason::OverRetraction => 8,
        };
    }
    1
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use rheo_core::error::RheoError;
    use serde_json::json;

    if let Some(RheoError::Abort(reason)) = err.downcast_ref::<RheoError>() {
        let obj = json!({
            "reason": abort_reason_name(reason),
            "message": humanize(err),
        });
        return obj.to_string();
    }

    json!({ "reason": "Error", "message": humanize(err) }).to_string()
}
