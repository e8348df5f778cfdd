//! Sensor sources feeding raw motion events into the recorder.
//!
//! A source runs on its own producer thread and only ever hands immutable
//! [`SourceMessage`] values to a [`MotionSink`]; it never touches recorder state.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::error::{RecorderError, Result};
use crate::export::TrialFile;
use crate::sample::SensorSample;

/// Raw device reading before re-timing against the trial baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionEvent {
    /// monotonic device clock, seconds
    pub timestamp: f64,
    pub user_acceleration: [f64; 3],
    pub gravity: [f64; 3],
    pub rotation_rate: [f64; 3],
    /// quaternion `(w, x, y, z)`
    pub attitude: [f64; 4],
    pub activity: Option<String>,
}

impl From<&SensorSample> for MotionEvent {
    fn from(s: &SensorSample) -> Self {
        Self {
            timestamp: s.t,
            user_acceleration: [s.ax, s.ay, s.az],
            gravity: [s.gravx, s.gravy, s.gravz],
            rotation_rate: [s.gx, s.gy, s.gz],
            attitude: [s.qw, s.qx, s.qy, s.qz],
            activity: s.act_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceMessage {
    Motion(MotionEvent),
    /// Terminal for the current trial.
    Failed(String),
}

type Deliver = dyn Fn(SourceMessage) -> bool + Send + Sync;

/// Non-blocking delivery handle into the recorder owner.
#[derive(Clone)]
pub struct MotionSink {
    deliver: Arc<Deliver>,
}

impl MotionSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(SourceMessage) -> bool + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn from_sender(tx: Sender<SourceMessage>) -> Self {
        Self::new(move |msg| tx.send(msg).is_ok())
    }

    /// Returns false once the receiving side is gone.
    pub fn motion(&self, event: MotionEvent) -> bool {
        (self.deliver)(SourceMessage::Motion(event))
    }

    pub fn fail(&self, reason: impl Into<String>) -> bool {
        (self.deliver)(SourceMessage::Failed(reason.into()))
    }

    pub fn send(&self, msg: SourceMessage) -> bool {
        (self.deliver)(msg)
    }
}

impl std::fmt::Debug for MotionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionSink").finish_non_exhaustive()
    }
}

/// A stream of motion events delivered at a caller-requested nominal rate.
pub trait SensorSource: Send + 'static {
    fn is_available(&self) -> bool {
        true
    }

    /// Begin delivering into `sink`. Must return promptly; delivery happens on
    /// the source's own thread.
    fn start(&mut self, rate_hz: u32, sink: MotionSink) -> Result<()>;

    /// Stop delivering. Idempotent.
    fn stop(&mut self);
}

/// Background producer thread with a cooperative stop flag.
#[derive(Debug, Default)]
struct Worker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn<F>(&mut self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        self.stop();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(flag))
            .map_err(|e| RecorderError::Source(e.to_string()))?;
        self.running = running;
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("sensor worker panicked");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub cadence_spm: f64,
    /// timestamp jitter as a fraction of the nominal interval
    pub jitter: f64,
    pub drop_probability: f64,
    /// deliver a failure after this many samples
    pub fail_after: Option<u64>,
    /// pace delivery against the wall clock instead of generating as fast as possible
    pub realtime: bool,
    /// stop producing after this many samples (across resumes)
    pub max_samples: Option<u64>,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            cadence_spm: 110.0,
            jitter: 0.05,
            drop_probability: 0.0,
            fail_after: None,
            realtime: true,
            max_samples: None,
            seed: 7,
        }
    }
}

/// Seeded gait-like generator: vertical bounce at step frequency, lateral sway
/// at stride frequency, light noise.
#[derive(Debug)]
pub struct SyntheticSource {
    config: SyntheticConfig,
    origin: Instant,
    /// slot counter survives pause/resume so device time keeps advancing
    slot: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
    worker: Worker,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            origin: Instant::now(),
            slot: Arc::new(AtomicU64::new(0)),
            delivered: Arc::new(AtomicU64::new(0)),
            worker: Worker::default(),
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }
}

fn noise(rng: &mut impl Rng) -> f64 {
    rng.gen_range(-0.05..0.05)
}

pub fn synthetic_event(t: f64, cadence_spm: f64, rng: &mut impl Rng) -> MotionEvent {
    let step_hz = cadence_spm / 60.0;
    let phase = 2.0 * PI * step_hz * t;

    let ax = 0.35 * (phase / 2.0).sin() + noise(rng);
    let ay = 0.25 * phase.cos() + noise(rng);
    let az = 1.1 + 0.9 * phase.sin() + noise(rng);

    let roll = 0.05 * (phase / 2.0).sin();
    let (s, c) = (roll / 2.0).sin_cos();

    MotionEvent {
        timestamp: t,
        user_acceleration: [ax, ay, az],
        gravity: [0.0, roll.sin(), -roll.cos()],
        rotation_rate: [0.4 * (phase / 2.0).cos(), 0.2 * phase.sin(), 0.1 * phase.cos()],
        attitude: [c, s, 0.0, 0.0],
        activity: None,
    }
}

impl SensorSource for SyntheticSource {
    fn start(&mut self, rate_hz: u32, sink: MotionSink) -> Result<()> {
        let config = self.config.clone();
        let origin = self.origin;
        let slot = Arc::clone(&self.slot);
        let delivered = Arc::clone(&self.delivered);
        let interval = 1.0 / f64::from(rate_hz.max(1));

        self.worker.spawn("synthetic-motion", move |running| {
            let first_slot = slot.load(Ordering::SeqCst);
            let started = Instant::now();
            let mut rng = StdRng::seed_from_u64(config.seed ^ first_slot);
            while running.load(Ordering::SeqCst) {
                let k = slot.fetch_add(1, Ordering::SeqCst);
                if config.max_samples.is_some_and(|max| k >= max) {
                    debug!(k, "synthetic source exhausted");
                    break;
                }

                let t = if config.realtime {
                    let due = Duration::from_secs_f64((k - first_slot) as f64 * interval);
                    if let Some(wait) = due.checked_sub(started.elapsed()) {
                        thread::sleep(wait);
                    }
                    origin.elapsed().as_secs_f64()
                } else {
                    k as f64 * interval + rng.gen_range(-config.jitter..=config.jitter) * interval
                };

                if rng.gen_bool(config.drop_probability.clamp(0.0, 1.0)) {
                    continue;
                }

                let n = delivered.fetch_add(1, Ordering::SeqCst);
                if config.fail_after.is_some_and(|limit| n >= limit) {
                    sink.fail("synthetic sensor failure");
                    break;
                }
                if !sink.motion(synthetic_event(t, config.cadence_spm, &mut rng)) {
                    break;
                }
            }
        })
    }

    fn stop(&mut self) {
        self.worker.stop();
    }
}

/// Replays the sample table of an exported trial.
#[derive(Debug)]
pub struct ReplaySource {
    samples: Arc<Vec<SensorSample>>,
    realtime: bool,
    cursor: Arc<AtomicUsize>,
    worker: Worker,
}

impl ReplaySource {
    pub fn new(samples: Vec<SensorSample>, realtime: bool) -> Self {
        Self {
            samples: Arc::new(samples),
            realtime,
            cursor: Arc::new(AtomicUsize::new(0)),
            worker: Worker::default(),
        }
    }

    pub fn open<P: AsRef<Path>>(path: P, realtime: bool) -> Result<Self> {
        let file = TrialFile::read(path)?;
        Ok(Self::new(file.samples, realtime))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl SensorSource for ReplaySource {
    fn is_available(&self) -> bool {
        !self.samples.is_empty()
    }

    fn start(&mut self, _rate_hz: u32, sink: MotionSink) -> Result<()> {
        let samples = Arc::clone(&self.samples);
        let cursor = Arc::clone(&self.cursor);
        let realtime = self.realtime;

        self.worker.spawn("replay-motion", move |running| {
            let started = Instant::now();
            let first_t = samples
                .get(cursor.load(Ordering::SeqCst))
                .map_or(0.0, |s| s.t);
            while running.load(Ordering::SeqCst) {
                let i = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(sample) = samples.get(i) else {
                    debug!("replay exhausted");
                    sink.fail("replay exhausted");
                    break;
                };
                if realtime {
                    let due = Duration::from_secs_f64((sample.t - first_t).max(0.0));
                    if let Some(wait) = due.checked_sub(started.elapsed()) {
                        thread::sleep(wait);
                    }
                }
                if !sink.motion(MotionEvent::from(sample)) {
                    break;
                }
            }
        })
    }

    fn stop(&mut self) {
        self.worker.stop();
    }
}

/// Deterministic source for tests: each `start` delivers the next scripted
/// batch synchronously.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    batches: VecDeque<Vec<SourceMessage>>,
    available: bool,
    fail_on_start: Option<String>,
    starts: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(batch: Vec<SourceMessage>) -> Self {
        Self {
            batches: VecDeque::from([batch]),
            available: true,
            ..Self::default()
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::default()
        }
    }

    /// Batch delivered on the following `start` (e.g. after a resume).
    pub fn then(mut self, batch: Vec<SourceMessage>) -> Self {
        self.batches.push_back(batch);
        self
    }

    pub fn failing_on_start(mut self, reason: impl Into<String>) -> Self {
        self.fail_on_start = Some(reason.into());
        self
    }

    /// Shared count of `start` calls, readable after the source moved away.
    pub fn start_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.starts)
    }
}

impl SensorSource for ScriptedSource {
    fn is_available(&self) -> bool {
        self.available
    }

    fn start(&mut self, _rate_hz: u32, sink: MotionSink) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.fail_on_start {
            return Err(RecorderError::Source(reason.clone()));
        }
        for msg in self.batches.pop_front().unwrap_or_default() {
            if !sink.send(msg) {
                break;
            }
        }
        Ok(())
    }

    fn stop(&mut self) {}
}

/// Motion events at an exact rate, `timestamp = t0 + i / rate_hz`, with the
/// given acceleration magnitude on the z axis.
pub fn uniform_events(t0: f64, rate_hz: f64, count: usize, az: f64) -> Vec<SourceMessage> {
    (0..count)
        .map(|i| {
            SourceMessage::Motion(MotionEvent {
                timestamp: t0 + i as f64 / rate_hz,
                user_acceleration: [0.0, 0.0, az],
                gravity: [0.0, 0.0, -1.0],
                rotation_rate: [0.0; 3],
                attitude: [1.0, 0.0, 0.0, 0.0],
                activity: None,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::norm3;
    use std::sync::mpsc;

    fn collect(rx: &mpsc::Receiver<SourceMessage>) -> Vec<SourceMessage> {
        rx.try_iter().collect()
    }

    #[test]
    fn scripted_source_delivers_batches_in_order() {
        let mut source = ScriptedSource::new(uniform_events(0.0, 100.0, 3, 1.0))
            .then(uniform_events(1.0, 100.0, 2, 1.0));
        let (tx, rx) = mpsc::channel();

        source.start(100, MotionSink::from_sender(tx.clone())).unwrap();
        assert_eq!(collect(&rx).len(), 3);

        source.start(100, MotionSink::from_sender(tx)).unwrap();
        assert_eq!(collect(&rx).len(), 2);
        assert_eq!(source.start_counter().load(Ordering::SeqCst), 2);
    }

    #[test]
    fn scripted_source_can_be_unavailable() {
        assert!(!ScriptedSource::unavailable().is_available());
    }

    #[test]
    fn synthetic_fast_mode_respects_sample_cap() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            realtime: false,
            max_samples: Some(250),
            ..SyntheticConfig::default()
        });
        let (tx, rx) = mpsc::channel();
        source.start(100, MotionSink::from_sender(tx)).unwrap();
        // worker exits on its own once the cap is hit
        let events: Vec<SourceMessage> = rx.iter().collect();
        source.stop();

        assert_eq!(events.len(), 250);
        let times: Vec<f64> = events
            .iter()
            .filter_map(|m| match m {
                SourceMessage::Motion(e) => Some(e.timestamp),
                SourceMessage::Failed(_) => None,
            })
            .collect();
        assert!(times.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn synthetic_failure_is_delivered_once() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            realtime: false,
            fail_after: Some(10),
            ..SyntheticConfig::default()
        });
        let (tx, rx) = mpsc::channel();
        source.start(100, MotionSink::from_sender(tx)).unwrap();
        let events: Vec<SourceMessage> = rx.iter().collect();
        source.stop();

        assert_eq!(events.len(), 11);
        assert!(matches!(events.last(), Some(SourceMessage::Failed(_))));
    }

    #[test]
    fn synthetic_signal_stays_in_walking_range() {
        let mut rng = StdRng::seed_from_u64(1);
        let mags: Vec<f64> = (0..1000)
            .map(|i| {
                let e = synthetic_event(i as f64 * 0.01, 110.0, &mut rng);
                let [x, y, z] = e.user_acceleration;
                norm3(x, y, z)
            })
            .collect();
        let median = crate::util::median(&mags).unwrap();
        assert!((0.5..=3.0).contains(&median), "median {median}");
    }

    #[test]
    fn replay_continues_from_cursor_after_restart() {
        let samples: Vec<SensorSample> = (0..5)
            .map(|i| crate::sample::sample_at(i as f64 * 0.01, 1.0))
            .collect();
        let mut source = ReplaySource::new(samples, false);

        let (tx, rx) = mpsc::channel();
        source.start(100, MotionSink::from_sender(tx)).unwrap();
        let events: Vec<SourceMessage> = rx.iter().collect();
        source.stop();
        assert_eq!(events.len(), 6);
        assert_eq!(
            events.last(),
            Some(&SourceMessage::Failed("replay exhausted".into()))
        );

        let (tx, rx) = mpsc::channel();
        source.start(100, MotionSink::from_sender(tx)).unwrap();
        let events: Vec<SourceMessage> = rx.iter().collect();
        source.stop();
        assert_eq!(events, vec![SourceMessage::Failed("replay exhausted".into())]);
    }
}
