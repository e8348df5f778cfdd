//! Timestamped motion samples and the per-trial sample buffer

use std::sync::Arc;

use crate::source::MotionEvent;
use crate::util::norm3;

/// One instant's measurement, `t` in seconds since the trial baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    pub t: f64,
    /// user acceleration (gravity removed)
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    /// angular rate
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
    /// attitude quaternion
    pub qw: f64,
    pub qx: f64,
    pub qy: f64,
    pub qz: f64,
    pub gravx: f64,
    pub gravy: f64,
    pub gravz: f64,
    pub act_type: Option<String>,
}

impl SensorSample {
    /// Build a sample from a raw event, re-timed relative to `baseline`.
    pub fn from_motion(event: &MotionEvent, baseline: f64) -> Self {
        let [ax, ay, az] = event.user_acceleration;
        let [gx, gy, gz] = event.rotation_rate;
        let [qw, qx, qy, qz] = event.attitude;
        let [gravx, gravy, gravz] = event.gravity;
        Self {
            t: event.timestamp - baseline,
            ax,
            ay,
            az,
            gx,
            gy,
            gz,
            qw,
            qx,
            qy,
            qz,
            gravx,
            gravy,
            gravz,
            act_type: event.activity.clone(),
        }
    }

    /// Euclidean norm of the acceleration.
    pub fn magnitude(&self) -> f64 {
        norm3(self.ax, self.ay, self.az)
    }
}

/// Append-only, arrival-ordered store for one trial.
///
/// Snapshots share the underlying vector; the next `append` after a snapshot
/// copies once, so a snapshot never observes later samples.
#[derive(Debug, Clone, Default)]
pub struct SampleBuffer {
    samples: Arc<Vec<SensorSample>>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Arc::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn append(&mut self, sample: SensorSample) {
        Arc::make_mut(&mut self.samples).push(sample);
    }

    /// Consistent point-in-time view of everything appended so far.
    pub fn snapshot(&self) -> Arc<Vec<SensorSample>> {
        Arc::clone(&self.samples)
    }

    pub fn clear(&mut self) {
        match Arc::get_mut(&mut self.samples) {
            Some(samples) => samples.clear(),
            None => self.samples = Arc::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn first(&self) -> Option<&SensorSample> {
        self.samples.first()
    }

    pub fn last(&self) -> Option<&SensorSample> {
        self.samples.last()
    }
}

#[cfg(test)]
pub(crate) fn sample_at(t: f64, az: f64) -> SensorSample {
    SensorSample {
        t,
        ax: 0.0,
        ay: 0.0,
        az,
        gx: 0.0,
        gy: 0.0,
        gz: 0.0,
        qw: 1.0,
        qx: 0.0,
        qy: 0.0,
        qz: 0.0,
        gravx: 0.0,
        gravy: 0.0,
        gravz: -1.0,
        act_type: None,
    }
}
