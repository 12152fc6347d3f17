//! Received-signal-strength estimator.
//!
//! Turns complex baseband samples into a power stream in dB:
//! `|x|^2` -> moving average over `length` samples -> `10 log10`.
//!
//! The average is always scaled by `1 / length` over a zero-filled history,
//! so the first `length - 1` outputs ramp up to the steady level.
use num_complex::Complex32;
use std::collections::VecDeque;

/// Floor applied before the logarithm so silence maps to a finite level.
const POWER_FLOOR: f64 = 1e-20;

/// Moving-average RSS calculator.
#[derive(Debug, Clone)]
pub struct RssCalculator {
    length: usize,
    max_iter: usize,
    window: VecDeque<f64>,
    sum: f64,
    since_refresh: usize,
}

impl RssCalculator {
    /// `length` is the averaging window; the running sum is recomputed from
    /// the window every `max_iter` samples.
    pub fn new(length: usize, max_iter: usize) -> Self {
        let length = length.max(1);
        Self {
            length,
            max_iter: max_iter.max(1),
            window: VecDeque::with_capacity(length),
            sum: 0.0,
            since_refresh: 0,
        }
    }

    /// Averaging window in samples.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Changes the window length, keeping the most recent samples.
    pub fn set_length(&mut self, length: usize) {
        self.length = length.max(1);
        while self.window.len() > self.length {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
    }

    /// Processes one batch, producing one dB value per input sample.
    pub fn process(&mut self, samples: &[Complex32]) -> Vec<f32> {
        samples.iter().map(|s| self.push(*s)).collect()
    }

    fn push(&mut self, sample: Complex32) -> f32 {
        let power = f64::from(sample.norm_sqr());
        self.window.push_back(power);
        self.sum += power;
        if self.window.len() > self.length {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }

        self.since_refresh += 1;
        if self.since_refresh >= self.max_iter {
            self.sum = self.window.iter().sum();
            self.since_refresh = 0;
        }

        let mean = self.sum / self.length as f64;
        (10.0 * mean.max(POWER_FLOOR).log10()) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_amplitude() {
        let mut rss = RssCalculator::new(4, 100);
        // |0.1|^2 = 0.01 -> -20 dB
        let out = rss.process(&[Complex32::new(0.1, 0.0); 8]);
        assert_eq!(out.len(), 8);
        for v in &out[3..] {
            assert!((v + 20.0).abs() < 1e-4, "got {}", v);
        }
    }

    #[test]
    fn test_unprimed_window_scales_by_length() {
        let mut rss = RssCalculator::new(4, 100);
        let out = rss.process(&[Complex32::new(1.0, 0.0); 2]);
        // 1/4 and 2/4 of unit power
        assert!((out[0] - 10.0 * 0.25f32.log10()).abs() < 1e-4);
        assert!((out[1] - 10.0 * 0.5f32.log10()).abs() < 1e-4);
    }

    #[test]
    fn test_window_tracks_level_change() {
        let mut rss = RssCalculator::new(2, 100);
        rss.process(&[Complex32::new(1.0, 0.0); 4]);
        let out = rss.process(&[Complex32::new(0.0, 0.1); 3]);
        // first new sample averages 1.0 and 0.01
        assert!((out[0] - (10.0 * (0.505f32).log10())).abs() < 1e-4);
        assert!((out[2] + 20.0).abs() < 1e-4);
    }

    #[test]
    fn test_silence_is_finite() {
        let mut rss = RssCalculator::new(3, 2);
        let out = rss.process(&[Complex32::new(0.0, 0.0); 5]);
        assert!(out.iter().all(|v| v.is_finite()));
        assert!((out[4] + 200.0).abs() < 1e-3);
    }

    #[test]
    fn test_shrinking_window() {
        let mut rss = RssCalculator::new(8, 1000);
        rss.process(&[Complex32::new(1.0, 0.0); 8]);
        rss.set_length(2);
        assert_eq!(rss.length(), 2);
        let out = rss.process(&[Complex32::new(0.1, 0.0)]);
        assert!((out[0] - (10.0 * (0.505f32).log10())).abs() < 1e-4);
    }
}
