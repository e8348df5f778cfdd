use std::collections::VecDeque;

use crate::cadence::estimate_cadence_spm;
use crate::time_series::TimeSeriesPoint;

/// Span of the trailing window, in seconds.
pub const WINDOW_SECS: f64 = 5.0;

/// Trailing 5 s window of `(t, magnitude)` pairs with running mean and cadence.
///
/// Every retained point satisfies `newest.t - point.t <= WINDOW_SECS`, and the
/// window is always a contiguous suffix of the pushed stream.
#[derive(Debug, Clone, Default)]
pub struct LiveStatsWindow {
    points: VecDeque<TimeSeriesPoint>,
    mean_magnitude: f64,
    cadence_spm: f64,
}

impl LiveStatsWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, t: f64, magnitude: f64) {
        self.points.push_back(TimeSeriesPoint::new(t, magnitude));
        while let Some(first) = self.points.front() {
            if t - first.t > WINDOW_SECS {
                self.points.pop_front();
            } else {
                break;
            }
        }

        let sum: f64 = self.points.iter().map(|p| p.value).sum();
        self.mean_magnitude = sum / self.points.len().max(1) as f64;
        self.cadence_spm = estimate_cadence_spm(self.points.make_contiguous());
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.mean_magnitude = 0.0;
        self.cadence_spm = 0.0;
    }

    /// Arithmetic mean of retained magnitudes (0 when empty).
    pub fn mean_magnitude(&self) -> f64 {
        self.mean_magnitude
    }

    /// Cadence over the retained window; 0 means not yet available.
    pub fn cadence_spm(&self) -> f64 {
        self.cadence_spm
    }

    /// Sampling rate observed inside the window.
    pub fn rate_hz(&self) -> f64 {
        match (self.points.front(), self.points.back()) {
            (Some(first), Some(last)) if self.points.len() > 1 => {
                (self.points.len() - 1) as f64 / (last.t - first.t).max(1e-6)
            }
            _ => 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = &TimeSeriesPoint> {
        self.points.iter()
    }
}
