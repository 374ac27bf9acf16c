//! In-flight rheological property estimates from (force, gap, velocity).
//!
//! All estimates are best-effort: numerical degeneracies (zero velocity,
//! non-positive volumes) degrade to a held value or the 0 sentinel, never to
//! a fault that could kill the controller task.

use std::f64::consts::PI;

/// Newtons per unit of calibrated force (grams-force).
pub const GRAMS_TO_NEWTONS: f64 = 0.00980665;

#[inline]
pub fn grams_to_newtons(f: f64) -> f64 {
    GRAMS_TO_NEWTONS * f
}

/// Which yield-stress closed form to report. Both are squeeze-flow
/// approximations, not solutions of the governing PDE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum YieldStressPolicy {
    /// tau_y = F * gap / (V * sqrt(3)), the simpler gap/volume-ratio form.
    #[default]
    GapRatio,
    /// Perfect-plasticity squeeze-flow form over the loaded radius:
    /// tau_y = 3*sqrt(3) * F * gap / (2*pi*R_eff^3), R_eff^2 = V/(pi*gap).
    Plastic,
}

#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub hammer_radius_m: f64,
}

impl Geometry {
    #[inline]
    pub fn hammer_area_m2(&self) -> f64 {
        PI * self.hammer_radius_m * self.hammer_radius_m
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            hammer_radius_m: 25e-3,
        }
    }
}

/// One tick's worth of derived estimates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PropertySample {
    /// Newtonian viscosity estimate (Pa.s).
    pub viscosity: f64,
    /// Yield-stress estimate (Pa).
    pub yield_stress: f64,
    /// Volume actually bearing load under the hammer (m^3).
    pub visc_volume_m3: f64,
    /// One-way latch: sample has spread past the hammer edge.
    pub spread_beyond_hammer: bool,
}

pub struct PropertyEstimator {
    geometry: Geometry,
    policy: YieldStressPolicy,
    sample_volume_m3: f64,
    spread: bool,
    viscosity: f64,
}

impl PropertyEstimator {
    pub fn new(geometry: Geometry, policy: YieldStressPolicy, sample_volume_m3: f64) -> Self {
        Self {
            geometry,
            policy,
            sample_volume_m3,
            spread: false,
            viscosity: 0.0,
        }
    }

    /// Recompute estimates for the current (force, gap, velocity).
    ///
    /// The viscosity estimate is the Stefan-equation inverse and is only
    /// valid while the plate moves; with zero velocity or no loaded volume
    /// the previous value is held.
    pub fn update(&mut self, force_units: f64, gap_m: f64, velocity_mms: f64) -> PropertySample {
        let hammer_volume = gap_m * self.geometry.hammer_area_m2();
        if !self.spread {
            self.spread = self.sample_volume_m3 > hammer_volume;
        }
        let visc_volume = if hammer_volume > 0.0 {
            self.sample_volume_m3.min(hammer_volume)
        } else {
            0.0
        };

        let force_n = grams_to_newtons(force_units);
        let velocity_ms = velocity_mms / 1000.0;

        if visc_volume > 0.0 && velocity_ms != 0.0 {
            let eta = (2.0 * PI * gap_m.powi(5) * force_n
                / (3.0 * visc_volume * visc_volume * velocity_ms))
                .abs();
            if eta.is_finite() {
                self.viscosity = eta;
            }
        }

        let yield_stress = self.yield_stress(force_n, gap_m, visc_volume);

        PropertySample {
            viscosity: self.viscosity,
            yield_stress,
            visc_volume_m3: visc_volume,
            spread_beyond_hammer: self.spread,
        }
    }

    fn yield_stress(&self, force_n: f64, gap_m: f64, visc_volume: f64) -> f64 {
        if visc_volume <= 0.0 || gap_m <= 0.0 {
            return 0.0;
        }
        let tau = match self.policy {
            YieldStressPolicy::GapRatio => force_n / visc_volume * gap_m / 3f64.sqrt(),
            YieldStressPolicy::Plastic => {
                let r_eff_sq = visc_volume / (PI * gap_m);
                let r_eff_cubed = r_eff_sq.powf(1.5);
                if r_eff_cubed <= 0.0 {
                    return 0.0;
                }
                3.0 * 3f64.sqrt() * force_n * gap_m / (2.0 * PI * r_eff_cubed)
            }
        };
        if tau.is_finite() { tau } else { 0.0 }
    }
}
