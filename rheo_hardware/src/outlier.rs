//! Spike rejection for load-cell readings.
//!
//! A candidate is rejected only when it deviates from *every* recent reading
//! by more than the jump threshold. Comparing against the whole recent window
//! (not just the immediately preceding sample) rejects single-sample spikes
//! while letting a genuine step change through on its second occurrence.

use std::collections::VecDeque;

pub const DEFAULT_JUMP_THRESHOLD: f64 = 10.0;
pub const DEFAULT_WINDOW: usize = 2;

#[derive(Debug, Clone)]
pub struct OutlierScreen {
    jump_threshold: f64,
    window: usize,
    recent: VecDeque<f64>,
}

impl Default for OutlierScreen {
    fn default() -> Self {
        Self::new(DEFAULT_JUMP_THRESHOLD, DEFAULT_WINDOW)
    }
}

impl OutlierScreen {
    pub fn new(jump_threshold: f64, window: usize) -> Self {
        let window = window.max(1);
        Self {
            jump_threshold,
            window,
            recent: VecDeque::with_capacity(window + 1),
        }
    }

    /// Screen one candidate. Returns true when the reading should be used.
    ///
    /// The candidate enters the comparison window either way; a rejected
    /// spike still becomes history so that a repeat at the same level is
    /// accepted.
    pub fn admit(&mut self, candidate: f64) -> bool {
        let verdict = if self.recent.len() < self.window {
            // not enough history to call anything an outlier yet
            true
        } else {
            self.recent
                .iter()
                .any(|prev| (candidate - prev).abs() <= self.jump_threshold)
        };
        self.recent.push_back(candidate);
        if self.recent.len() > self.window {
            self.recent.pop_front();
        }
        verdict
    }

    /// Forget all history (e.g. after a tare or a buffer flush).
    pub fn reset(&mut self) {
        self.recent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_reading_is_never_an_outlier() {
        let mut s = OutlierScreen::new(10.0, 2);
        assert!(s.admit(5.0));
        assert!(s.admit(5.0));
        assert!(s.admit(5.0));
    }

    #[test]
    fn single_spike_amid_noise_is_rejected() {
        let mut s = OutlierScreen::new(10.0, 2);
        for v in [0.3, -0.8, 0.1, 0.9] {
            assert!(s.admit(v));
        }
        assert!(!s.admit(1000.0));
        // and the stream recovers immediately
        assert!(s.admit(0.2));
    }

    #[test]
    fn step_change_is_accepted_on_second_occurrence() {
        let mut s = OutlierScreen::new(10.0, 2);
        assert!(s.admit(0.0));
        assert!(s.admit(0.1));
        assert!(!s.admit(500.0)); // first sample at the new level
        assert!(s.admit(500.2)); // second sample confirms the level
    }
}
