//! Post-hoc quality assessment of a finished trial.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::cadence::estimate_cadence_spm;
use crate::sample::SensorSample;
use crate::time_series::TimeSeriesPoint;
use crate::util::median;

/// Relative deviation of measured from target rate that triggers attention.
pub const MAX_RATE_DEVIATION: f64 = 0.10;
pub const MAX_DROPPED_PCT: f64 = 2.0;
pub const MEDIAN_ACCEL_RANGE: (f64, f64) = (0.5, 3.0);
pub const CADENCE_RANGE_SPM: (f64, f64) = (80.0, 140.0);
/// A gap counts as dropped samples only when wider than this many expected intervals.
pub const GAP_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum Verdict {
    #[serde(rename = "OK")]
    #[strum(serialize = "OK")]
    Ok,
    Attention,
    Poor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySummary {
    pub measured_hz: f64,
    pub dropped_pct: f64,
    pub duration_s: f64,
    pub cadence_spm: Option<f64>,
    pub accel_median_norm: Option<f64>,
    pub verdict: Verdict,
}

impl QualitySummary {
    /// Floor result for sequences too short to assess.
    pub fn poor() -> Self {
        Self {
            measured_hz: 0.0,
            dropped_pct: 100.0,
            duration_s: 0.0,
            cadence_spm: None,
            accel_median_norm: None,
            verdict: Verdict::Poor,
        }
    }
}

/// Drop estimate from inter-sample gaps: `(dropped_slots, total_slots)`.
pub fn count_slots(samples: &[SensorSample], target_hz: u32) -> (u64, u64) {
    let expected_dt = 1.0 / f64::from(target_hz.max(1));
    let mut dropped = 0u64;
    let mut total = 0u64;
    for (prev, next) in samples.iter().tuple_windows() {
        let dt = next.t - prev.t;
        let slots = (dt / expected_dt).round().max(0.0) as u64;
        total += slots.max(1);
        if dt > GAP_FACTOR * expected_dt {
            dropped += slots.saturating_sub(1);
        }
    }
    (dropped, total)
}

/// One deterministic pass over a frozen trial.
pub fn analyze(samples: &[SensorSample], target_hz: u32) -> QualitySummary {
    let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
        return QualitySummary::poor();
    };
    if samples.len() < 3 {
        return QualitySummary::poor();
    }

    let duration_s = (last.t - first.t).max(1e-6);
    let measured_hz = (samples.len() - 1) as f64 / duration_s;

    let (dropped, total) = count_slots(samples, target_hz);
    let dropped_pct = if total > 0 {
        100.0 * dropped as f64 / total as f64
    } else {
        0.0
    };

    let magnitudes: Vec<TimeSeriesPoint> = samples
        .iter()
        .map(|s| TimeSeriesPoint::new(s.t, s.magnitude()))
        .collect();
    let values: Vec<f64> = magnitudes.iter().map(|p| p.value).collect();
    let accel_median_norm = median(&values);
    let cadence = estimate_cadence_spm(&magnitudes);
    let cadence_spm = (cadence != 0.0).then_some(cadence);

    let target = f64::from(target_hz.max(1));
    let mut verdict = Verdict::Ok;
    if (measured_hz - target).abs() / target > MAX_RATE_DEVIATION {
        verdict = Verdict::Attention;
    }
    if dropped_pct > MAX_DROPPED_PCT {
        verdict = Verdict::Attention;
    }
    if let Some(m) = accel_median_norm {
        if !(MEDIAN_ACCEL_RANGE.0..=MEDIAN_ACCEL_RANGE.1).contains(&m) {
            verdict = Verdict::Attention;
        }
    }
    if let Some(c) = cadence_spm {
        if !(CADENCE_RANGE_SPM.0..=CADENCE_RANGE_SPM.1).contains(&c) {
            verdict = Verdict::Attention;
        }
    }

    QualitySummary {
        measured_hz,
        dropped_pct,
        duration_s,
        cadence_spm,
        accel_median_norm,
        verdict,
    }
}
