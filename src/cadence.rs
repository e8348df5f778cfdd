//! Peak-based step cadence estimation over a magnitude signal.
//!
//! The same estimator runs over the trailing live window while recording and
//! once over the whole trial during quality analysis.

use itertools::Itertools;

use crate::time_series::TimeSeriesPoint;
use crate::util::{mean, median, variance};

/// Fewer points than this and cadence is reported as 0 (not yet available).
pub const MIN_POINTS: usize = 9;
/// Standardized value a local maximum must exceed to count as a step.
pub const PEAK_THRESHOLD_Z: f64 = 0.8;
/// Peaks closer than this to the last accepted peak are discarded.
pub const REFRACTORY_SECS: f64 = 0.30;

/// Estimated steps per minute, or 0.0 when the signal is too short or has
/// fewer than two accepted peaks.
pub fn estimate_cadence_spm(points: &[TimeSeriesPoint]) -> f64 {
    if points.len() < MIN_POINTS {
        return 0.0;
    }

    let values: Vec<f64> = points.iter().map(|p| p.value).collect();
    let (Some(mu), Some(var)) = (mean(&values), variance(&values)) else {
        return 0.0;
    };
    let sd = var.max(1e-9).sqrt();
    let z: Vec<f64> = values.iter().map(|v| (v - mu) / sd.max(1e-6)).collect();

    // The refractory clock starts at the first point, so a peak inside the
    // first 0.30 s of the input is dropped as well.
    let mut last_peak_t = points[0].t;
    let mut peaks = Vec::new();
    for i in 1..z.len() - 1 {
        if z[i] > PEAK_THRESHOLD_Z && z[i] > z[i - 1] && z[i] > z[i + 1] {
            let t = points[i].t;
            if t - last_peak_t > REFRACTORY_SECS {
                peaks.push(t);
                last_peak_t = t;
            }
        }
    }

    if peaks.len() < 2 {
        return 0.0;
    }

    let intervals: Vec<f64> = peaks.iter().tuple_windows().map(|(a, b)| b - a).collect();
    match median(&intervals) {
        Some(interval) => 60.0 / interval.max(1e-6),
        None => 0.0,
    }
}

#[cfg(test)]
pub(crate) fn sine_signal(rate_hz: f64, secs: f64, period: f64) -> Vec<TimeSeriesPoint> {
    let n = (rate_hz * secs) as usize;
    (0..n)
        .map(|i| {
            let t = i as f64 / rate_hz;
            // phase offset keeps sampled maxima off exact ties
            let v = 1.0 + 0.5 * (2.0 * std::f64::consts::PI * t / period + 0.1).sin();
            TimeSeriesPoint::new(t, v)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_few_points_is_zero() {
        let points = sine_signal(100.0, 0.08, 0.5);
        assert_eq!(points.len(), 8);
        assert_eq!(estimate_cadence_spm(&points), 0.0);
    }

    #[test]
    fn constant_signal_has_no_peaks() {
        let points: Vec<TimeSeriesPoint> = (0..200)
            .map(|i| TimeSeriesPoint::new(i as f64 * 0.01, 1.0))
            .collect();
        assert_eq!(estimate_cadence_spm(&points), 0.0);
    }

    #[test]
    fn recovers_120_spm_from_half_second_period() {
        let points = sine_signal(100.0, 10.0, 0.5);
        let spm = estimate_cadence_spm(&points);
        assert!((spm - 120.0).abs() < 5.0, "got {spm}");
    }

    #[test]
    fn recovers_90_spm_at_200_hz() {
        let points = sine_signal(200.0, 12.0, 60.0 / 90.0);
        let spm = estimate_cadence_spm(&points);
        assert!((spm - 90.0).abs() < 5.0, "got {spm}");
    }

    #[test]
    fn peaks_inside_refractory_period_are_discarded() {
        // two spikes 0.1 s apart every second; only the first of each pair counts
        let points: Vec<TimeSeriesPoint> = (0..500)
            .map(|i| {
                let t = i as f64 * 0.01;
                let phase = i % 100;
                let v = if phase == 50 || phase == 60 { 5.0 } else { 1.0 };
                TimeSeriesPoint::new(t, v)
            })
            .collect();
        let spm = estimate_cadence_spm(&points);
        assert!((spm - 60.0).abs() < 1e-6, "got {spm}");
    }

    #[test]
    fn single_peak_is_zero() {
        let points: Vec<TimeSeriesPoint> = (0..100)
            .map(|i| {
                let v = if i == 50 { 5.0 } else { 1.0 };
                TimeSeriesPoint::new(i as f64 * 0.01, v)
            })
            .collect();
        assert_eq!(estimate_cadence_spm(&points), 0.0);
    }
}
