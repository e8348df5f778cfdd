use std::{
    error::Error,
    io::{self, Write},
    path::PathBuf,
    sync::mpsc::{Receiver, RecvTimeoutError},
    thread,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gaitrec::{
    app_dirs::AppDirs,
    config::{FileSettingsStore, Settings, SettingsStore},
    export::{list_sidecars, TrialExporter, TrialFile},
    history::{TrialEntry, TrialHistory},
    meta::{BacMethod, Condition, Position, TrialMeta},
    quality::{analyze, QualitySummary},
    recorder::{Completion, Telemetry},
    runtime::{FixedTicker, Notification, RecorderHandle, RecorderService},
    source::{ReplaySource, SyntheticConfig, SyntheticSource},
};

const TICK_RATE_MS: u64 = 100;
const PROGRESS_EVERY: Duration = Duration::from_secs(1);

/// fixed-duration motion trial recorder with live stats and quality checks
#[derive(Parser, Debug)]
#[clap(
    version,
    about,
    long_about = "Records fixed-duration walking trials from a motion sensor, shows live cadence while recording, grades data quality and writes a self-describing CSV record per trial."
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// record one trial and export it
    Record(RecordArgs),
    /// re-run the quality analysis over an exported trial
    Analyze {
        file: PathBuf,
        /// target rate in Hz (default: the file's sampling_hz_target)
        #[clap(short = 'r', long)]
        rate: Option<u32>,
    },
    /// list exported trials, newest first
    List {
        /// directory to scan (default: the configured sessions folder)
        #[clap(long)]
        dir: Option<PathBuf>,
    },
    /// show recently recorded trials
    History {
        #[clap(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
    /// show or reset the stored settings
    Config {
        #[clap(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum ConfigAction {
    Show,
    Reset,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
enum SourceKind {
    Synthetic,
    Replay,
}

#[derive(Args, Debug)]
struct RecordArgs {
    /// participant id (default: the last one used)
    #[clap(short = 'p', long)]
    participant: Option<String>,

    /// session id (default: random)
    #[clap(short = 's', long)]
    session: Option<String>,

    #[clap(long, value_enum, default_value_t = Position::PocketRight)]
    position: Position,

    #[clap(long, value_enum, default_value_t = Condition::Unknown)]
    condition: Condition,

    /// breath alcohol reading, 0.00 to 0.40
    #[clap(long)]
    bac: Option<f64>,

    #[clap(long, value_enum)]
    bac_method: Option<BacMethod>,

    #[clap(long)]
    bac_brand_model: Option<String>,

    /// minutes between the BAC reading and the trial
    #[clap(long)]
    bac_delay_min: Option<f64>,

    #[clap(long)]
    sex: Option<String>,

    #[clap(long)]
    age: Option<String>,

    #[clap(long)]
    height_in: Option<String>,

    #[clap(long)]
    weight_lb: Option<String>,

    /// trial length in seconds
    #[clap(short = 'd', long)]
    duration: Option<u32>,

    /// target sampling rate in Hz
    #[clap(short = 'r', long)]
    rate: Option<u32>,

    /// countdown before recording starts, in seconds
    #[clap(long)]
    preroll: Option<f64>,

    /// use ';' between sample columns
    #[clap(long)]
    semicolon: bool,

    /// replace the participant id with a short hash in the exported record
    #[clap(long)]
    anonymize: bool,

    /// write the record here instead of the sessions folder
    #[clap(short = 'o', long)]
    out_dir: Option<PathBuf>,

    #[clap(long, value_enum, default_value_t = SourceKind::Synthetic)]
    source: SourceKind,

    /// exported trial to replay with --source replay
    #[clap(long)]
    replay: Option<PathBuf>,

    /// synthetic walking cadence in steps per minute
    #[clap(long, default_value_t = 110.0)]
    cadence: f64,

    /// synthetic probability of dropping a sample
    #[clap(long, default_value_t = 0.0)]
    drop_rate: f64,

    #[clap(long, default_value_t = 7)]
    seed: u64,

    /// skip the countdown and generate samples as fast as possible
    #[clap(long)]
    fast: bool,

    /// don't append the trial to the local history
    #[clap(long)]
    no_history: bool,
}

impl RecordArgs {
    /// Stored settings with this run's flags laid over them.
    fn effective_settings(&self, stored: &Settings) -> Settings {
        let mut settings = stored.clone();
        if let Some(d) = self.duration {
            settings.duration_secs = d;
        }
        if let Some(r) = self.rate {
            settings.target_hz = r;
        }
        if let Some(p) = self.preroll {
            settings.preroll_secs = p;
        }
        if self.fast {
            settings.preroll_secs = 0.0;
        }
        settings.use_semicolon_delimiter |= self.semicolon;
        settings.strict_anonymization |= self.anonymize;
        settings
    }

    fn to_meta(&self, participant: String, settings: &Settings) -> TrialMeta {
        let session = self
            .session
            .clone()
            .unwrap_or_else(|| format!("{:08x}", rand::random::<u32>()));
        let mut meta = TrialMeta::new(participant, session);
        meta.position = self.position;
        meta.condition = self.condition;
        meta.sex = self.sex.clone();
        meta.age_years = self.age.clone();
        meta.height_in = self.height_in.clone();
        meta.weight_lb = self.weight_lb.clone();
        meta.bac = self.bac;
        meta.bac_method = self.bac_method;
        meta.bac_brand_model = self.bac_brand_model.clone();
        meta.bac_measured_at = self.bac.map(|_| chrono::Utc::now());
        meta.bac_delay_min = self.bac_delay_min;
        meta.sampling_hz_target = settings.target_hz;
        meta.duration_target_s = settings.duration_secs;
        meta.preroll_s = settings.preroll_secs;
        meta
    }

    fn spawn_recorder(&self, settings: &Settings) -> Result<RecorderHandle, Box<dyn Error>> {
        let ticker = FixedTicker::new(Duration::from_millis(TICK_RATE_MS));
        let handle = match self.source {
            SourceKind::Synthetic => {
                let max_samples = self.fast.then(|| {
                    u64::from(settings.target_hz) * (u64::from(settings.duration_secs) + 1)
                });
                let source = SyntheticSource::new(SyntheticConfig {
                    cadence_spm: self.cadence,
                    drop_probability: self.drop_rate.clamp(0.0, 1.0),
                    realtime: !self.fast,
                    max_samples,
                    seed: self.seed,
                    ..SyntheticConfig::default()
                });
                RecorderService::spawn(source, ticker)?
            }
            SourceKind::Replay => {
                let path = self
                    .replay
                    .as_ref()
                    .ok_or("--source replay needs --replay <file>")?;
                RecorderService::spawn(ReplaySource::open(path, !self.fast)?, ticker)?
            }
        };
        Ok(handle)
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let store = FileSettingsStore::new();

    match cli.command {
        Command::Record(args) => record(&args, &store),
        Command::Analyze { file, rate } => analyze_file(file, rate, &store),
        Command::List { dir } => list(dir, &store),
        Command::History { limit } => history(limit),
        Command::Config { action } => config(action, &store),
    }
}

fn record(args: &RecordArgs, store: &FileSettingsStore) -> Result<(), Box<dyn Error>> {
    let stored = store.load();
    let settings = args.effective_settings(&stored);

    let participant = args
        .participant
        .clone()
        .or_else(|| Some(settings.last_participant_id.clone()).filter(|p| !p.is_empty()))
        .ok_or("no participant given and none remembered; pass --participant")?;
    let meta = args.to_meta(participant, &settings);
    meta.validate()?;

    let exporter = match &args.out_dir {
        Some(dir) => TrialExporter::new(dir),
        None => TrialExporter::for_settings(&settings),
    };

    let handle = args.spawn_recorder(&settings)?;
    let notifications = handle.subscribe();
    handle.prepare(settings.trial_config())?;
    handle.begin_countdown()?;
    countdown(settings.preroll_secs);
    handle.start()?;
    cue(settings.beeps);

    let completion = follow(&handle, &notifications)?;
    cue(settings.beeps);

    let (path, quality) = handle.export(&meta, &settings, &exporter)?;
    handle.shutdown();

    println!("{}", path.display());
    print_summary(&quality);

    if !args.no_history {
        let entry = TrialEntry::from_export(
            &meta,
            &settings,
            &path,
            completion.samples,
            &quality,
            &completion.reason.to_string(),
        );
        if let Err(e) = TrialHistory::open_default().and_then(|db| db.record(&entry)) {
            warn!(error = %e, "trial not added to history");
        }
    }

    let remembered = Settings {
        last_participant_id: meta.participant_id.clone(),
        ..stored
    };
    if let Err(e) = store.save(&remembered) {
        warn!(error = %e, "could not remember participant");
    }
    Ok(())
}

fn countdown(secs: f64) {
    if secs <= 0.0 {
        return;
    }
    let mut remaining = secs;
    while remaining > 0.0 {
        eprint!("\rstarting in {:.0}s ", remaining.ceil());
        let _ = io::stderr().flush();
        let step = remaining.min(1.0);
        thread::sleep(Duration::from_secs_f64(step));
        remaining -= step;
    }
    eprintln!("\rrecording        ");
}

fn cue(beeps: bool) {
    if beeps {
        eprint!("\x07");
        let _ = io::stderr().flush();
    }
}

/// Print live telemetry until the trial completes.
fn follow(
    handle: &RecorderHandle,
    notifications: &Receiver<Notification>,
) -> Result<Completion, Box<dyn Error>> {
    loop {
        match notifications.recv_timeout(PROGRESS_EVERY) {
            Ok(Notification::Completed(completion)) => {
                print_progress(&handle.telemetry());
                eprintln!();
                return Ok(completion);
            }
            Ok(Notification::StateChanged(_)) => {}
            Err(RecvTimeoutError::Timeout) => print_progress(&handle.telemetry()),
            Err(RecvTimeoutError::Disconnected) => return Err("recorder stopped unexpectedly".into()),
        }
    }
}

fn print_progress(t: &Telemetry) {
    let cadence = if t.cadence_spm > 0.0 {
        format!("{:.0} spm", t.cadence_spm)
    } else {
        "-- spm".to_string()
    };
    eprint!(
        "\r{:>6.1}s  {:>6} samples  {:>6.1} Hz  |a| {:.2}  {}   ",
        t.elapsed_secs, t.sample_count, t.live_hz, t.mean_magnitude, cadence
    );
    let _ = io::stderr().flush();
}

fn print_summary(q: &QualitySummary) {
    let opt = |v: Option<f64>, digits: usize| match v {
        Some(v) => format!("{v:.digits$}"),
        None => "n/a".to_string(),
    };
    println!("verdict:      {}", q.verdict);
    println!("measured hz:  {:.2}", q.measured_hz);
    println!("dropped:      {:.2}%", q.dropped_pct);
    println!("duration:     {:.3}s", q.duration_s);
    println!("cadence:      {}", opt(q.cadence_spm, 1));
    println!("median |a|:   {}", opt(q.accel_median_norm, 3));
}

fn analyze_file(
    file: PathBuf,
    rate: Option<u32>,
    store: &FileSettingsStore,
) -> Result<(), Box<dyn Error>> {
    let trial = TrialFile::read(&file)?;
    let target_hz = rate
        .or_else(|| trial.target_hz())
        .unwrap_or_else(|| store.load().target_hz);
    println!("{} ({} samples, target {} Hz)", file.display(), trial.samples.len(), target_hz);
    print_summary(&analyze(&trial.samples, target_hz));
    Ok(())
}

fn list(dir: Option<PathBuf>, store: &FileSettingsStore) -> Result<(), Box<dyn Error>> {
    let dir = dir.unwrap_or_else(|| AppDirs::sessions_dir(&store.load().folder_prefix));
    let entries = list_sidecars(&dir)?;
    if entries.is_empty() {
        println!("no trials in {}", dir.display());
    }
    for entry in entries {
        let stem = entry
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let meta = &entry.record.meta;
        let q = &entry.record.quality;
        println!(
            "{stem}  {}  {}  {:<9}  {:>6.1} Hz  {:>5.2}% dropped",
            meta.participant_id, meta.session_id, q.verdict, q.measured_hz, q.dropped_pct
        );
    }
    Ok(())
}

fn history(limit: usize) -> Result<(), Box<dyn Error>> {
    let db = TrialHistory::open_default()?;
    for e in db.recent(limit)? {
        let cadence = e
            .cadence_spm
            .map(|c| format!("{c:.0} spm"))
            .unwrap_or_else(|| "-- spm".to_string());
        println!(
            "{}  {}  {}  {:<9}  {:>6} samples  {:>6.1} Hz  {}  ({})",
            e.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            e.participant_id,
            e.session_id,
            e.verdict,
            e.sample_count,
            e.measured_hz,
            cadence,
            e.stop_reason
        );
    }
    Ok(())
}

fn config(action: ConfigAction, store: &FileSettingsStore) -> Result<(), Box<dyn Error>> {
    match action {
        ConfigAction::Show => {
            println!("# {}", store.path().display());
            println!("{}", serde_json::to_string_pretty(&store.load())?);
        }
        ConfigAction::Reset => {
            store.save(&Settings::default())?;
            println!("settings reset: {}", store.path().display());
        }
    }
    Ok(())
}
