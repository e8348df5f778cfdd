//! Trial lifecycle as an explicit state machine.
//!
//! [`Recorder::apply`] is the only place that decides whether an event is legal
//! in the current state. It never performs I/O; side effects the caller must
//! carry out (subscribing to the sensor, notifying observers) come back as
//! [`Effect`]s. Time is passed in, which keeps the safety deadline testable.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::Result;
use crate::export::{export_trial, TrialExporter};
use crate::live_stats::LiveStatsWindow;
use crate::meta::TrialMeta;
use crate::quality::QualitySummary;
use crate::sample::{SampleBuffer, SensorSample};
use crate::source::MotionEvent;

/// Extra time past the target duration before the safety net forces a stop.
pub const SAFETY_MARGIN_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum_macros::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum RecorderState {
    #[default]
    Idle,
    CountingDown,
    Recording,
    Paused,
    Finished,
}

/// Fixed for the duration of a trial; set through `Prepare`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialConfig {
    pub target_hz: u32,
    pub duration_secs: u32,
    pub lead_in_secs: f64,
    pub beeps: bool,
    pub haptics: bool,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            target_hz: 100,
            duration_secs: 30,
            lead_in_secs: 2.0,
            beeps: true,
            haptics: true,
        }
    }
}

impl TrialConfig {
    pub fn safety_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.duration_secs) + SAFETY_MARGIN_SECS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    DurationReached,
    Explicit,
    SourceFailed,
    SafetyTimeout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Prepare(TrialConfig),
    BeginCountdown,
    Start,
    Motion(MotionEvent),
    SourceFailed(String),
    Pause,
    Resume,
    Stop,
    Discard,
    Tick,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Completion {
    pub reason: StopReason,
    pub samples: usize,
    pub measured_hz: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// (Re)subscribe to the sensor source at the target rate.
    StartSource,
    StopSource,
    StateChanged(RecorderState),
    /// Fires exactly once per transition into `Finished`.
    Completed(Completion),
}

/// Everything a live display needs, published as one unit per event.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Telemetry {
    pub state: RecorderState,
    pub elapsed_secs: f64,
    pub sample_count: usize,
    pub mean_magnitude: f64,
    pub cadence_spm: f64,
    pub live_hz: f64,
    /// final measured rate; 0 until the trial finishes
    pub measured_hz: f64,
}

#[derive(Debug, Clone, Copy)]
struct SafetyTimer {
    trial: u64,
    deadline: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct Recorder {
    state: RecorderState,
    config: TrialConfig,
    buffer: SampleBuffer,
    live: LiveStatsWindow,
    baseline: Option<f64>,
    elapsed_secs: f64,
    measured_hz: f64,
    trial: u64,
    safety: Option<SafetyTimer>,
}

impl Recorder {
    pub fn new(config: TrialConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn config(&self) -> &TrialConfig {
        &self.config
    }

    pub fn sample_count(&self) -> usize {
        self.buffer.len()
    }

    pub fn snapshot(&self) -> Arc<Vec<SensorSample>> {
        self.buffer.snapshot()
    }

    /// Pending safety deadline for the current trial, if armed.
    pub fn safety_deadline(&self) -> Option<Instant> {
        self.safety
            .filter(|timer| timer.trial == self.trial)
            .map(|timer| timer.deadline)
    }

    pub fn telemetry(&self) -> Telemetry {
        Telemetry {
            state: self.state,
            elapsed_secs: self.elapsed_secs,
            sample_count: self.buffer.len(),
            mean_magnitude: self.live.mean_magnitude(),
            cadence_spm: self.live.cadence_spm(),
            live_hz: self.live.rate_hz(),
            measured_hz: self.measured_hz,
        }
    }

    /// Transition function. Events that are not legal in the current state
    /// change nothing and yield no effects.
    pub fn apply(&mut self, event: Event, now: Instant) -> Vec<Effect> {
        use RecorderState::*;

        let before = self.state;
        let mut effects = match (self.state, event) {
            (_, Event::Prepare(config)) => self.reset(Some(config)),
            (Idle, Event::BeginCountdown) => {
                self.state = CountingDown;
                Vec::new()
            }
            (Idle | CountingDown, Event::Start) => self.begin(now),
            (Recording, Event::Motion(motion)) => self.ingest(&motion),
            (Recording | Paused, Event::SourceFailed(reason)) => {
                warn!(%reason, samples = self.buffer.len(), "sensor source failed mid-trial");
                self.finish(StopReason::SourceFailed)
            }
            (Recording, Event::Pause) => {
                self.state = Paused;
                vec![Effect::StopSource]
            }
            // The safety timer is deliberately left as armed at start.
            (Paused, Event::Resume) => {
                self.state = Recording;
                vec![Effect::StartSource]
            }
            (Recording | Paused, Event::Stop) => self.finish(StopReason::Explicit),
            (_, Event::Discard) => self.reset(None),
            (_, Event::Tick) => self.check_deadline(now),
            (state, Event::Motion(_)) => {
                debug!(%state, "motion event outside recording dropped");
                Vec::new()
            }
            (state, event) => {
                debug!(%state, ?event, "event not valid in current state");
                Vec::new()
            }
        };

        if self.state != before {
            effects.insert(0, Effect::StateChanged(self.state));
        }
        effects
    }

    /// Analyze the current buffer and write the trial record.
    pub fn export(
        &self,
        meta: &TrialMeta,
        settings: &Settings,
        exporter: &TrialExporter,
    ) -> Result<(PathBuf, QualitySummary)> {
        export_trial(
            &self.buffer.snapshot(),
            self.config.target_hz,
            meta,
            settings,
            exporter,
        )
    }

    fn reset(&mut self, config: Option<TrialConfig>) -> Vec<Effect> {
        let effects = if self.state == RecorderState::Recording {
            vec![Effect::StopSource]
        } else {
            Vec::new()
        };
        if let Some(config) = config {
            self.config = config;
        }
        self.safety = None;
        self.clear_trial_data();
        self.state = RecorderState::Idle;
        effects
    }

    fn clear_trial_data(&mut self) {
        self.buffer.clear();
        self.live.clear();
        self.baseline = None;
        self.elapsed_secs = 0.0;
        self.measured_hz = 0.0;
    }

    fn begin(&mut self, now: Instant) -> Vec<Effect> {
        self.trial += 1;
        self.clear_trial_data();
        // replaces any leftover timer from an earlier trial
        self.safety = Some(SafetyTimer {
            trial: self.trial,
            deadline: now + self.config.safety_timeout(),
        });
        self.state = RecorderState::Recording;
        info!(
            trial = self.trial,
            target_hz = self.config.target_hz,
            duration_secs = self.config.duration_secs,
            "recording started"
        );
        vec![Effect::StartSource]
    }

    fn ingest(&mut self, motion: &MotionEvent) -> Vec<Effect> {
        let baseline = *self.baseline.get_or_insert(motion.timestamp);
        let sample = SensorSample::from_motion(motion, baseline);
        let t = sample.t;

        self.live.push(t, sample.magnitude());
        self.buffer.append(sample);
        self.elapsed_secs = t;

        if t >= f64::from(self.config.duration_secs) {
            self.finish(StopReason::DurationReached)
        } else {
            Vec::new()
        }
    }

    fn check_deadline(&mut self, now: Instant) -> Vec<Effect> {
        match self.safety {
            Some(timer) if timer.trial == self.trial && now >= timer.deadline => {
                self.safety = None;
                if self.state == RecorderState::Recording {
                    warn!(trial = self.trial, "no sample-driven stop before safety deadline");
                    self.finish(StopReason::SafetyTimeout)
                } else {
                    debug!(state = %self.state, "safety deadline passed outside recording");
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    fn finish(&mut self, reason: StopReason) -> Vec<Effect> {
        self.safety = None;
        if let (Some(first), Some(last), n) =
            (self.buffer.first(), self.buffer.last(), self.buffer.len())
        {
            if n > 1 {
                self.measured_hz = (n - 1) as f64 / (last.t - first.t).max(1e-6);
            }
        }
        self.state = RecorderState::Finished;
        info!(
            %reason,
            samples = self.buffer.len(),
            measured_hz = self.measured_hz,
            "recording finished"
        );
        vec![
            Effect::StopSource,
            Effect::Completed(Completion {
                reason,
                samples: self.buffer.len(),
                measured_hz: self.measured_hz,
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{uniform_events, SourceMessage};
    use assert_matches::assert_matches;

    fn config(duration_secs: u32) -> TrialConfig {
        TrialConfig {
            target_hz: 100,
            duration_secs,
            lead_in_secs: 0.0,
            beeps: false,
            haptics: false,
        }
    }

    fn motions(t0: f64, count: usize) -> Vec<MotionEvent> {
        uniform_events(t0, 100.0, count, 1.0)
            .into_iter()
            .filter_map(|m| match m {
                SourceMessage::Motion(e) => Some(e),
                SourceMessage::Failed(_) => None,
            })
            .collect()
    }

    fn completions(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Completed(_)))
            .count()
    }

    fn started(duration_secs: u32, now: Instant) -> Recorder {
        let mut r = Recorder::new(config(duration_secs));
        let effects = r.apply(Event::Start, now);
        assert_eq!(
            effects,
            vec![
                Effect::StateChanged(RecorderState::Recording),
                Effect::StartSource
            ]
        );
        r
    }

    #[test]
    fn prepare_resets_and_stays_idle() {
        let now = Instant::now();
        let mut r = started(30, now);
        for e in motions(50.0, 10) {
            r.apply(Event::Motion(e), now);
        }
        let effects = r.apply(Event::Prepare(config(10)), now);

        assert_eq!(r.state(), RecorderState::Idle);
        assert_eq!(r.sample_count(), 0);
        assert_eq!(r.config().duration_secs, 10);
        assert!(effects.contains(&Effect::StopSource));
        assert_eq!(r.safety_deadline(), None);
    }

    #[test]
    fn countdown_then_start() {
        let now = Instant::now();
        let mut r = Recorder::new(config(30));
        r.apply(Event::BeginCountdown, now);
        assert_eq!(r.state(), RecorderState::CountingDown);
        r.apply(Event::Start, now);
        assert_eq!(r.state(), RecorderState::Recording);
    }

    #[test]
    fn samples_are_timed_from_first_event() {
        let now = Instant::now();
        let mut r = started(30, now);
        for e in motions(1234.5, 3) {
            r.apply(Event::Motion(e), now);
        }
        let snap = r.snapshot();
        assert_eq!(snap[0].t, 0.0);
        assert!((snap[2].t - 0.02).abs() < 1e-9);
        assert!((r.telemetry().elapsed_secs - 0.02).abs() < 1e-9);
    }

    #[test]
    fn reaching_duration_finishes_once() {
        let now = Instant::now();
        let mut r = started(1, now);
        let mut completed = 0;
        let mut finish_effects = Vec::new();
        for e in motions(0.0, 150) {
            let effects = r.apply(Event::Motion(e), now);
            if completions(&effects) > 0 {
                finish_effects = effects.clone();
            }
            completed += completions(&effects);
        }

        assert_eq!(completed, 1);
        assert_eq!(r.state(), RecorderState::Finished);
        // 0.00 .. 1.00 inclusive
        assert_eq!(r.sample_count(), 101);
        assert_matches!(
            finish_effects.as_slice(),
            [
                Effect::StateChanged(RecorderState::Finished),
                Effect::StopSource,
                Effect::Completed(Completion {
                    reason: StopReason::DurationReached,
                    samples: 101,
                    ..
                })
            ]
        );
        assert!((r.telemetry().measured_hz - 100.0).abs() < 1e-6);
    }

    #[test]
    fn source_failure_is_terminal() {
        let now = Instant::now();
        let mut r = started(30, now);
        for e in motions(0.0, 20) {
            r.apply(Event::Motion(e), now);
        }
        let effects = r.apply(Event::SourceFailed("gone".into()), now);

        assert_eq!(r.state(), RecorderState::Finished);
        assert_eq!(r.sample_count(), 20);
        assert_matches!(
            effects.last(),
            Some(Effect::Completed(Completion {
                reason: StopReason::SourceFailed,
                ..
            }))
        );
    }

    #[test]
    fn pause_freezes_intake_and_resume_resubscribes() {
        let now = Instant::now();
        let mut r = started(30, now);
        let events = motions(0.0, 30);
        for e in &events[..10] {
            r.apply(Event::Motion(e.clone()), now);
        }

        assert_eq!(r.apply(Event::Pause, now)[1], Effect::StopSource);
        for e in &events[10..20] {
            r.apply(Event::Motion(e.clone()), now);
        }
        assert_eq!(r.sample_count(), 10);
        assert!((r.telemetry().elapsed_secs - 0.09).abs() < 1e-9);

        assert_eq!(r.apply(Event::Resume, now)[1], Effect::StartSource);
        for e in &events[20..] {
            r.apply(Event::Motion(e.clone()), now);
        }
        assert_eq!(r.sample_count(), 20);
    }

    #[test]
    fn resume_does_not_rearm_safety_timer() {
        let t0 = Instant::now();
        let mut r = started(10, t0);
        let deadline = r.safety_deadline().unwrap();

        r.apply(Event::Pause, t0 + Duration::from_secs(3));
        r.apply(Event::Resume, t0 + Duration::from_secs(8));
        assert_eq!(r.safety_deadline(), Some(deadline));
    }

    #[test]
    fn explicit_stop_is_idempotent() {
        let now = Instant::now();
        let mut r = started(30, now);
        let first = r.apply(Event::Stop, now);
        let second = r.apply(Event::Stop, now);

        assert_eq!(completions(&first), 1);
        assert!(second.is_empty());
        assert_eq!(r.state(), RecorderState::Finished);
    }

    #[test]
    fn stop_from_paused_finishes() {
        let now = Instant::now();
        let mut r = started(30, now);
        r.apply(Event::Pause, now);
        let effects = r.apply(Event::Stop, now);
        assert_eq!(completions(&effects), 1);
    }

    #[test]
    fn safety_timer_fires_exactly_once() {
        let t0 = Instant::now();
        let mut r = started(2, t0);

        assert!(r.apply(Event::Tick, t0 + Duration::from_secs(6)).is_empty());
        let fired = r.apply(Event::Tick, t0 + Duration::from_secs(7));
        assert_matches!(
            fired.last(),
            Some(Effect::Completed(Completion {
                reason: StopReason::SafetyTimeout,
                samples: 0,
                ..
            }))
        );
        assert!(r.apply(Event::Tick, t0 + Duration::from_secs(20)).is_empty());
        assert_eq!(r.state(), RecorderState::Finished);
    }

    #[test]
    fn explicit_stop_cancels_safety_timer() {
        let t0 = Instant::now();
        let mut r = started(2, t0);
        r.apply(Event::Stop, t0 + Duration::from_secs(1));

        assert_eq!(r.safety_deadline(), None);
        assert!(r.apply(Event::Tick, t0 + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn new_trial_replaces_leftover_timer() {
        let t0 = Instant::now();
        let mut r = started(2, t0);
        r.apply(Event::Pause, t0);
        r.apply(Event::Prepare(config(2)), t0);

        let t1 = t0 + Duration::from_secs(5);
        r.apply(Event::Start, t1);
        // the first trial's deadline (t0 + 7s) must not end the second trial
        assert!(r.apply(Event::Tick, t0 + Duration::from_secs(8)).is_empty());
        assert_eq!(r.state(), RecorderState::Recording);
        assert_eq!(r.safety_deadline(), Some(t1 + Duration::from_secs(7)));
    }

    #[test]
    fn safety_deadline_while_paused_is_consumed_without_stopping() {
        let t0 = Instant::now();
        let mut r = started(1, t0);
        r.apply(Event::Pause, t0);

        assert!(r.apply(Event::Tick, t0 + Duration::from_secs(10)).is_empty());
        assert_eq!(r.state(), RecorderState::Paused);
        assert_eq!(r.safety_deadline(), None);
    }

    #[test]
    fn discard_clears_everything_from_any_state() {
        let now = Instant::now();
        let mut r = started(30, now);
        for e in motions(0.0, 10) {
            r.apply(Event::Motion(e), now);
        }
        let effects = r.apply(Event::Discard, now);

        assert!(effects.contains(&Effect::StopSource));
        assert_eq!(r.state(), RecorderState::Idle);
        assert_eq!(r.sample_count(), 0);
        assert_eq!(r.telemetry(), Telemetry::default());
        assert_eq!(r.safety_deadline(), None);
    }

    #[test]
    fn invalid_transitions_are_noops() {
        let now = Instant::now();
        let mut r = Recorder::new(config(30));
        assert!(r.apply(Event::Pause, now).is_empty());
        assert!(r.apply(Event::Resume, now).is_empty());
        assert!(r.apply(Event::Stop, now).is_empty());
        assert!(r
            .apply(Event::Motion(motions(0.0, 1).remove(0)), now)
            .is_empty());
        assert_eq!(r.state(), RecorderState::Idle);
        assert_eq!(r.sample_count(), 0);
    }

    #[test]
    fn finished_ignores_start_until_prepared() {
        let now = Instant::now();
        let mut r = started(30, now);
        r.apply(Event::Stop, now);
        assert!(r.apply(Event::Start, now).is_empty());
        assert_eq!(r.state(), RecorderState::Finished);

        r.apply(Event::Prepare(config(30)), now);
        r.apply(Event::Start, now);
        assert_eq!(r.state(), RecorderState::Recording);
    }

    #[test]
    fn single_sample_leaves_measured_rate_zero() {
        let now = Instant::now();
        let mut r = started(30, now);
        r.apply(Event::Motion(motions(0.0, 1).remove(0)), now);
        r.apply(Event::Stop, now);
        assert_eq!(r.telemetry().measured_hz, 0.0);
    }
}
