//! Single-writer recorder service.
//!
//! One owner thread holds the [`Recorder`] and the sensor source. Sensor
//! callbacks, user requests and ticks all arrive through one inbox, so every
//! state change is serialized. Readers get telemetry from a shared slot that is
//! replaced whole after each message, and sample snapshots are `Arc` clones.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{RecorderError, Result};
use crate::export::{export_trial, TrialExporter};
use crate::meta::TrialMeta;
use crate::quality::QualitySummary;
use crate::recorder::{
    Completion, Effect, Event, Recorder, RecorderState, Telemetry, TrialConfig,
};
use crate::sample::SensorSample;
use crate::source::{MotionSink, SensorSource, SourceMessage};

/// Messages consumed by the owner thread
#[derive(Debug)]
pub enum Inbound {
    /// Delivery from the sensor subscription tagged `generation`
    Source {
        generation: u64,
        message: SourceMessage,
    },
    Request(Request),
}

#[derive(Debug)]
pub enum Request {
    Apply(Event, Sender<Telemetry>),
    Start(Sender<Result<Telemetry>>),
    Snapshot(Sender<TrialSnapshot>),
    Shutdown,
}

/// Observer notifications
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    StateChanged(RecorderState),
    Completed(Completion),
}

/// Frozen view of the current trial for export
#[derive(Debug, Clone)]
pub struct TrialSnapshot {
    pub state: RecorderState,
    pub config: TrialConfig,
    pub samples: Arc<Vec<SensorSample>>,
}

/// Source of inbox messages for the owner loop
pub trait EventSource: Send + 'static {
    /// Block for up to `timeout` waiting for a message.
    fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Inbound, RecvTimeoutError>;
}

pub struct ChannelEventSource {
    rx: Receiver<Inbound>,
}

impl ChannelEventSource {
    pub fn new(rx: Receiver<Inbound>) -> Self {
        Self { rx }
    }
}

impl EventSource for ChannelEventSource {
    fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Inbound, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

/// Configurable ticker interface
pub trait Ticker: Send + Sync + 'static {
    fn interval(&self) -> Duration;
}

/// Fixed interval ticker
#[derive(Clone, Copy, Debug)]
pub struct FixedTicker {
    interval: Duration,
}

impl FixedTicker {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for FixedTicker {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl Ticker for FixedTicker {
    fn interval(&self) -> Duration {
        self.interval
    }
}

#[derive(Debug)]
pub enum Step {
    Message(Inbound),
    Tick,
}

/// Runner that advances the owner loop one message/tick at a time
pub struct Runner<E: EventSource, T: Ticker> {
    event_source: E,
    ticker: T,
}

impl<E: EventSource, T: Ticker> Runner<E, T> {
    pub fn new(event_source: E, ticker: T) -> Self {
        Self {
            event_source,
            ticker,
        }
    }

    /// Blocks up to tick interval and returns the next message, or Tick on timeout
    pub fn step(&self) -> Step {
        match self.event_source.recv_timeout(self.ticker.interval()) {
            Ok(msg) => Step::Message(msg),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Step::Tick,
        }
    }
}

type Subscribers = Arc<Mutex<Vec<Sender<Notification>>>>;

struct Owner<T: Ticker> {
    runner: Runner<ChannelEventSource, T>,
    inbox: Sender<Inbound>,
    recorder: Recorder,
    source: Box<dyn SensorSource>,
    generation: u64,
    subscribed: bool,
    start_error: Option<String>,
    telemetry: Arc<Mutex<Telemetry>>,
    subscribers: Subscribers,
}

impl<T: Ticker> Owner<T> {
    fn run(mut self) {
        loop {
            // checked every pass: a busy inbox never times out into a Tick
            if self.deadline_passed() {
                self.apply(Event::Tick);
            }
            match self.runner.step() {
                Step::Tick => self.apply(Event::Tick),
                Step::Message(Inbound::Source {
                    generation,
                    message,
                }) => {
                    if generation != self.generation || !self.subscribed {
                        debug!(generation, current = self.generation, "stale sensor delivery dropped");
                        continue;
                    }
                    match message {
                        SourceMessage::Motion(motion) => self.apply(Event::Motion(motion)),
                        SourceMessage::Failed(reason) => self.apply(Event::SourceFailed(reason)),
                    }
                }
                Step::Message(Inbound::Request(request)) => match request {
                    Request::Apply(event, reply) => {
                        self.apply(event);
                        let _ = reply.send(self.recorder.telemetry());
                    }
                    Request::Start(reply) => {
                        let _ = reply.send(self.start());
                    }
                    Request::Snapshot(reply) => {
                        let _ = reply.send(TrialSnapshot {
                            state: self.recorder.state(),
                            config: *self.recorder.config(),
                            samples: self.recorder.snapshot(),
                        });
                    }
                    Request::Shutdown => break,
                },
            }
        }
        self.unsubscribe();
        debug!("recorder owner thread exiting");
    }

    fn deadline_passed(&self) -> bool {
        self.recorder
            .safety_deadline()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn start(&mut self) -> Result<Telemetry> {
        let startable = matches!(
            self.recorder.state(),
            RecorderState::Idle | RecorderState::CountingDown
        );
        if startable && !self.source.is_available() {
            warn!("sensor source unavailable; recorder left unchanged");
            return Err(RecorderError::SourceUnavailable);
        }
        self.apply(Event::Start);
        match self.start_error.take() {
            Some(reason) => Err(RecorderError::Source(reason)),
            None => Ok(self.recorder.telemetry()),
        }
    }

    fn apply(&mut self, event: Event) {
        let effects = self.recorder.apply(event, Instant::now());
        for effect in effects {
            match effect {
                Effect::StartSource => self.subscribe(),
                Effect::StopSource => self.unsubscribe(),
                Effect::StateChanged(state) => self.notify(Notification::StateChanged(state)),
                Effect::Completed(completion) => {
                    self.notify(Notification::Completed(completion))
                }
            }
        }
        self.publish();
    }

    fn subscribe(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let inbox = self.inbox.clone();
        let sink = MotionSink::new(move |message| {
            inbox
                .send(Inbound::Source {
                    generation,
                    message,
                })
                .is_ok()
        });
        match self
            .source
            .start(self.recorder.config().target_hz, sink)
        {
            Ok(()) => self.subscribed = true,
            Err(e) => {
                let reason = e.to_string();
                error!(%reason, "sensor subscription failed");
                self.start_error = Some(reason.clone());
                self.apply(Event::SourceFailed(reason));
            }
        }
    }

    fn unsubscribe(&mut self) {
        if self.subscribed {
            self.source.stop();
            self.subscribed = false;
        }
        // anything still in flight from the old subscription is now stale
        self.generation += 1;
    }

    fn publish(&self) {
        *self.telemetry.lock().unwrap_or_else(PoisonError::into_inner) = self.recorder.telemetry();
    }

    fn notify(&self, notification: Notification) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
    }
}

/// Owning handle to a running recorder service. Dropping it shuts the service down.
pub struct RecorderHandle {
    tx: Sender<Inbound>,
    telemetry: Arc<Mutex<Telemetry>>,
    subscribers: Subscribers,
    thread: Option<JoinHandle<()>>,
}

pub struct RecorderService;

impl RecorderService {
    pub fn spawn<S, T>(source: S, ticker: T) -> Result<RecorderHandle>
    where
        S: SensorSource,
        T: Ticker,
    {
        let (tx, rx) = mpsc::channel();
        let telemetry = Arc::new(Mutex::new(Telemetry::default()));
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));

        let owner = Owner {
            runner: Runner::new(ChannelEventSource::new(rx), ticker),
            inbox: tx.clone(),
            recorder: Recorder::default(),
            source: Box::new(source),
            generation: 0,
            subscribed: false,
            start_error: None,
            telemetry: Arc::clone(&telemetry),
            subscribers: Arc::clone(&subscribers),
        };

        let thread = thread::Builder::new()
            .name("recorder".into())
            .spawn(move || owner.run())
            .map_err(|e| {
                error!(error = %e, "failed to spawn recorder thread");
                RecorderError::ServiceStopped
            })?;
        info!("recorder service started");

        Ok(RecorderHandle {
            tx,
            telemetry,
            subscribers,
            thread: Some(thread),
        })
    }
}

impl RecorderHandle {
    fn request<R>(&self, make: impl FnOnce(Sender<R>) -> Request) -> Result<R> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Inbound::Request(make(reply_tx)))
            .map_err(|_| RecorderError::ServiceStopped)?;
        reply_rx.recv().map_err(|_| RecorderError::ServiceStopped)
    }

    fn apply(&self, event: Event) -> Result<Telemetry> {
        self.request(|reply| Request::Apply(event, reply))
    }

    /// Reset to idle with a new configuration, dropping any current trial.
    pub fn prepare(&self, config: TrialConfig) -> Result<Telemetry> {
        self.apply(Event::Prepare(config))
    }

    pub fn begin_countdown(&self) -> Result<Telemetry> {
        self.apply(Event::BeginCountdown)
    }

    /// Begin recording. Fails with [`RecorderError::SourceUnavailable`]
    /// without any state change when the sensor cannot be used.
    pub fn start(&self) -> Result<Telemetry> {
        self.request(Request::Start)?
    }

    pub fn pause(&self) -> Result<Telemetry> {
        self.apply(Event::Pause)
    }

    pub fn resume(&self) -> Result<Telemetry> {
        self.apply(Event::Resume)
    }

    pub fn stop(&self) -> Result<Telemetry> {
        self.apply(Event::Stop)
    }

    pub fn discard(&self) -> Result<Telemetry> {
        self.apply(Event::Discard)
    }

    /// Latest committed telemetry; never blocks on the owner thread.
    pub fn telemetry(&self) -> Telemetry {
        *self.telemetry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn snapshot(&self) -> Result<TrialSnapshot> {
        self.request(Request::Snapshot)
    }

    /// Analyze and write the current trial on the calling thread.
    pub fn export(
        &self,
        meta: &TrialMeta,
        settings: &Settings,
        exporter: &TrialExporter,
    ) -> Result<(PathBuf, QualitySummary)> {
        let snapshot = self.snapshot()?;
        export_trial(
            &snapshot.samples,
            snapshot.config.target_hz,
            meta,
            settings,
            exporter,
        )
    }

    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.tx.send(Inbound::Request(Request::Shutdown));
            if thread.join().is_err() {
                error!("recorder thread panicked");
            }
        }
    }
}

impl Drop for RecorderHandle {
    fn drop(&mut self) {
        self.stop_thread();
    }
}
