//! Test and helper mocks for rheo_core

use std::time::Duration;

use rheo_traits::{BoxError, ForceSensor};

/// A sensor that always errors on read; useful when driving the loop from
/// values published into shared state by the test itself.
pub struct NoopSensor;

impl ForceSensor for NoopSensor {
    fn read(&mut self, _timeout: Duration) -> Result<f64, BoxError> {
        Err(Box::new(std::io::Error::other("noop sensor")))
    }

    fn tare(&mut self, _samples: usize) -> Result<f64, BoxError> {
        Ok(0.0)
    }

    fn flush_stale(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    fn units(&self) -> &str {
        "g"
    }
}
