//! Error estimation and gain scheduling for the force-tracking loop.
//!
//! The sensor task drives an [`ErrorEstimator`] once per accepted reading;
//! the controller maps the resulting terms to a velocity through
//! [`ScheduledGain`] and the integral/derivative gains.

/// Finite-difference scheme for the derivative term.
///
/// First-order backward difference is the default; the second-order variant
/// is sharper but noisier under sample jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerivativePolicy {
    #[default]
    FirstOrder,
    SecondOrder,
}

/// Tuning for the error estimator. The velocity gains (K_I, K_D and the
/// scheduled K_P) live on the controller side; these knobs shape the error
/// terms themselves.
#[derive(Debug, Clone)]
pub struct PidTuning {
    /// Exponential decay rate applied to the integral per second; must be
    /// negative. Bounds steady-state windup at max|error| / |decay_rate|.
    pub decay_rate: f64,
    /// Hard clamp on |integral|, the second line of defense after decay.
    pub int_clamp: f64,
    pub derivative: DerivativePolicy,
}

impl Default for PidTuning {
    fn default() -> Self {
        Self {
            decay_rate: -0.1502,
            int_clamp: 1000.0,
            derivative: DerivativePolicy::FirstOrder,
        }
    }
}

/// The three PID terms published after each accepted sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ErrorTerms {
    pub error: f64,
    pub int_error: f64,
    pub der_error: f64,
}

/// Converts calibrated force samples into PID error terms under a variable
/// (and sometimes zero) sample interval.
#[derive(Debug, Clone)]
pub struct ErrorEstimator {
    tuning: PidTuning,
    error: f64,
    old_error: f64,
    older_error: f64,
    int_error: f64,
    der_error: f64,
    dt: f64,
    dt_old: f64,
    last_sample_s: Option<f64>,
}

impl ErrorEstimator {
    pub fn new(tuning: PidTuning) -> Self {
        Self {
            tuning,
            error: 0.0,
            old_error: 0.0,
            older_error: 0.0,
            int_error: 0.0,
            der_error: 0.0,
            dt: 0.0,
            dt_old: 0.0,
            last_sample_s: None,
        }
    }

    /// Ingest one calibrated force sample taken at `now_s` (seconds from the
    /// session epoch). The first sample has no predecessor: dt is treated as
    /// zero and every term stays at its default.
    pub fn update(&mut self, force: f64, target: f64, now_s: f64) -> ErrorTerms {
        let dt = match self.last_sample_s {
            Some(t) => (now_s - t).max(0.0),
            None => 0.0,
        };
        self.last_sample_s = Some(now_s);
        self.dt_old = self.dt;
        self.dt = dt;

        self.older_error = self.old_error;
        self.old_error = self.error;
        self.error = target - force;

        // Decayed trapezoidal accumulation, then the hard clamp. The decay
        // bounds long-run windup smoothly; the clamp assigns +/-CLAMP rather
        // than dropping accumulation.
        if dt > 0.0 {
            self.int_error *= (self.tuning.decay_rate * dt).exp();
            self.int_error += (self.old_error + self.error) / 2.0 * dt;
        }
        if self.int_error.abs() > self.tuning.int_clamp {
            self.int_error = self.tuning.int_clamp.copysign(self.int_error);
        }

        self.der_error = match self.tuning.derivative {
            DerivativePolicy::FirstOrder => {
                if dt > 0.0 {
                    (self.error - self.old_error) / dt
                } else {
                    0.0
                }
            }
            DerivativePolicy::SecondOrder => {
                if dt > 0.0 && self.dt_old > 0.0 {
                    let (h, h0) = (dt, self.dt_old);
                    self.error * (2.0 * h + h0) / (h * (h + h0))
                        - self.old_error * (h + h0) / (h * h0)
                        + self.older_error * h / (h0 * (h + h0))
                } else {
                    0.0
                }
            }
        };

        self.terms()
    }

    /// Force the integral back to zero. Called every approach-phase tick:
    /// there is no meaningful feedback before contact, so accumulation
    /// would be pure windup.
    pub fn reset_integral(&mut self) {
        self.int_error = 0.0;
    }

    pub fn terms(&self) -> ErrorTerms {
        ErrorTerms {
            error: self.error,
            int_error: self.int_error,
            der_error: self.der_error,
        }
    }
}

/// Smooth blend between a coarse gain far from target and a fine gain near
/// it:
///
/// Kp(e, tar) = (a+b)/2 + (a-b)/2 * tanh(c * ((e/tar)^2 - d))
///
/// `c` controls transition sharpness, `d` the midpoint in (e/tar)^2. The
/// blend is bounded by [min(a,b), max(a,b)] for all inputs.
#[derive(Debug, Clone, Copy)]
pub struct ScheduledGain {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl Default for ScheduledGain {
    fn default() -> Self {
        Self {
            a: 0.7,
            b: 0.15,
            c: 50.0,
            d: 0.01,
        }
    }
}

impl ScheduledGain {
    pub fn kp(&self, error: f64, target: f64) -> f64 {
        let mid = (self.a + self.b) / 2.0;
        if target == 0.0 {
            // degenerate target; fall back to the blend midpoint
            return mid;
        }
        let rel = error / target;
        mid + (self.a - self.b) / 2.0 * (self.c * (rel * rel - self.d)).tanh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_leaves_terms_at_zero() {
        let mut est = ErrorEstimator::new(PidTuning::default());
        let t = est.update(0.0, 5.0, 0.0);
        assert_eq!(t.int_error, 0.0);
        assert_eq!(t.der_error, 0.0);
        assert_eq!(t.error, 5.0);
    }

    #[test]
    fn zero_dt_keeps_integral_and_zeroes_derivative() {
        let mut est = ErrorEstimator::new(PidTuning::default());
        est.update(0.0, 5.0, 0.0);
        let a = est.update(1.0, 5.0, 1.0);
        let b = est.update(2.0, 5.0, 1.0); // same timestamp
        assert_eq!(b.int_error, a.int_error);
        assert_eq!(b.der_error, 0.0);
    }

    #[test]
    fn trapezoid_integrates_average_error() {
        let mut est = ErrorEstimator::new(PidTuning {
            decay_rate: -1e-12, // negligible decay over 1 s
            ..PidTuning::default()
        });
        est.update(0.0, 4.0, 0.0); // error 4
        let t = est.update(2.0, 4.0, 1.0); // error 2, dt 1 -> += (4+2)/2
        assert!((t.int_error - 3.0).abs() < 1e-9, "{}", t.int_error);
    }

    #[test]
    fn integral_clamps_at_limit() {
        let mut est = ErrorEstimator::new(PidTuning {
            int_clamp: 10.0,
            decay_rate: -1e-12,
            ..PidTuning::default()
        });
        est.update(0.0, 100.0, 0.0);
        for i in 1..50 {
            est.update(0.0, 100.0, i as f64);
        }
        let t = est.terms();
        assert!((t.int_error - 10.0).abs() < 1e-9);
    }

    #[test]
    fn first_order_derivative_matches_backward_difference() {
        let mut est = ErrorEstimator::new(PidTuning::default());
        est.update(0.0, 5.0, 0.0); // error 5
        let t = est.update(2.0, 5.0, 0.5); // error 3, dt 0.5
        assert!((t.der_error - (3.0 - 5.0) / 0.5).abs() < 1e-9);
    }

    #[test]
    fn second_order_derivative_matches_uniform_grid_stencil() {
        let mut est = ErrorEstimator::new(PidTuning {
            derivative: DerivativePolicy::SecondOrder,
            ..PidTuning::default()
        });
        // error samples: 9, 4, 1 at t = 0, 1, 2 (error = target - force)
        est.update(1.0, 10.0, 0.0);
        est.update(6.0, 10.0, 1.0);
        let t = est.update(9.0, 10.0, 2.0);
        // (3*1 - 4*4 + 1*9) / (2*1) = -2
        assert!((t.der_error - (-2.0)).abs() < 1e-9, "{}", t.der_error);
    }

    #[test]
    fn second_order_needs_two_intervals() {
        let mut est = ErrorEstimator::new(PidTuning {
            derivative: DerivativePolicy::SecondOrder,
            ..PidTuning::default()
        });
        est.update(0.0, 5.0, 0.0);
        let t = est.update(1.0, 5.0, 1.0); // only one interval so far
        assert_eq!(t.der_error, 0.0);
    }

    #[test]
    fn gain_blend_is_bounded_and_lands_on_asymptotes() {
        let g = ScheduledGain::default();
        let (lo, hi) = (g.a.min(g.b), g.a.max(g.b));
        for i in -200..=200 {
            let e = i as f64 / 10.0;
            let kp = g.kp(e, 5.0);
            assert!((lo - 1e-12..=hi + 1e-12).contains(&kp), "kp={kp} at e={e}");
        }
        // With a sharp transition (large c, d near 0): large relative error
        // lands on the coarse gain a, zero error on the fine gain b.
        let sharp = ScheduledGain { c: 500.0, ..g };
        assert!((sharp.kp(1e6, 5.0) - sharp.a).abs() < 1e-9);
        assert!((sharp.kp(0.0, 5.0) - sharp.b).abs() < 1e-2);
    }

    #[test]
    fn gain_blend_survives_zero_target() {
        let g = ScheduledGain::default();
        let kp = g.kp(3.0, 0.0);
        assert!(kp.is_finite());
    }
}
