//! Sensor task: owns the `ForceSensor`, computes PID error terms, and
//! publishes them into shared state.
//!
//! The read is the only blocking point in the system under normal
//! operation: the loop retries without backoff until a valid, non-outlier
//! sample arrives (the hardware produces data at a roughly fixed
//! small-latency rate), and a failed read never advances stale PID terms.
//!
//! Safety: each `SensorTask` spawns exactly one thread that is shut down
//! when the task is dropped, preventing thread leaks.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rheo_traits::ForceSensor;
use rheo_traits::clock::Clock;

use crate::pid::{ErrorEstimator, PidTuning};
use crate::state::{Phase, SharedState};

#[derive(Debug, Clone)]
pub struct SensorCfg {
    /// Sign of a force pushing up on the load cell (+1.0 or -1.0), fixed at
    /// session start.
    pub force_up_sign: f64,
    /// Per-read timeout handed to the adapter.
    pub read_timeout: Duration,
    /// Readings to throw away at startup before trusting the stream.
    pub startup_discard: usize,
    /// Dead-man ceiling shared by all tasks.
    pub max_test_duration: Duration,
}

impl Default for SensorCfg {
    fn default() -> Self {
        Self {
            force_up_sign: 1.0,
            read_timeout: Duration::from_millis(150),
            startup_discard: 10,
            max_test_duration: Duration::from_secs(2000),
        }
    }
}

pub struct SensorTask {
    shared: Arc<SharedState>,
    join_handle: Option<JoinHandle<()>>,
}

impl SensorTask {
    pub fn spawn<S, C>(
        mut sensor: S,
        shared: Arc<SharedState>,
        tuning: PidTuning,
        cfg: SensorCfg,
        clock: C,
    ) -> Self
    where
        S: ForceSensor + Send + 'static,
        C: Clock + Send + Sync + 'static,
    {
        let shared_task = shared.clone();
        let join_handle = std::thread::spawn(move || {
            // The first lines out of the digitizer are boot chatter, and more
            // piled up while the session was being configured.
            for _ in 0..cfg.startup_discard {
                let _ = sensor.read(cfg.read_timeout);
            }
            if let Err(e) = sensor.flush_stale() {
                tracing::warn!(error = %e, "sensor flush failed");
            }

            let mut estimator = ErrorEstimator::new(tuning);
            let epoch = shared_task.epoch;
            let ceiling = cfg.max_test_duration.as_secs_f64();

            loop {
                if shared_task.stopped() {
                    tracing::debug!("sensor task observed stop flag");
                    break;
                }
                if clock.secs_since(epoch) >= ceiling {
                    tracing::error!("sensor task hit the max-duration ceiling");
                    shared_task.request_stop();
                    break;
                }

                // Intentionally unbounded retry: a transient failure means no
                // new sample, and the published terms simply stay put.
                let reading = match sensor.read(cfg.read_timeout) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::trace!(error = %e, "sensor read retry");
                        continue;
                    }
                };
                // A sample that completed after shutdown began would reflect
                // the ride home, not the test; drop it.
                if shared_task.stopped() {
                    break;
                }

                let force = reading * cfg.force_up_sign;
                let now_s = clock.secs_since(epoch);
                let target = shared_task.target.load();
                let mut terms = estimator.update(force, target, now_s);
                if shared_task.phase() == Phase::Approach {
                    // No meaningful feedback before contact: hold the
                    // integral at zero so it cannot wind up.
                    estimator.reset_integral();
                    terms.int_error = 0.0;
                }

                let prev = shared_task.last_sample_s.load();
                shared_task.force.store(force);
                shared_task.error.store(terms.error);
                shared_task.int_error.store(terms.int_error);
                shared_task.der_error.store(terms.der_error);
                shared_task.prev_sample_s.store(prev);
                shared_task.last_sample_s.store(now_s);
            }
            tracing::trace!("sensor task exiting");
        });

        Self {
            shared,
            join_handle: Some(join_handle),
        }
    }

    /// Seconds since the last successfully published sample.
    pub fn stalled_for(&self, now_s: f64) -> f64 {
        (now_s - self.shared.last_sample_s.load()).max(0.0)
    }
}

impl Drop for SensorTask {
    fn drop(&mut self) {
        // The thread exits at its next loop iteration; the blocking read
        // bounds the wait at one sensor timeout.
        self.shared.request_stop();
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(()) => tracing::trace!("sensor task joined"),
                Err(e) => tracing::warn!(?e, "sensor task panicked during shutdown"),
            }
        }
    }
}
