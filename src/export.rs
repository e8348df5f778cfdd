//! Self-describing trial records.
//!
//! A record is a text file: `# key,value` metadata lines, one header row, then
//! one row per sample. Metadata lines always use a comma; the sample table uses
//! the configured delimiter. A JSON sidecar with the same stem carries the
//! metadata and quality summary for quick listing.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::app_dirs::AppDirs;
use crate::config::Settings;
use crate::error::{ExportError, Result};
use crate::meta::TrialMeta;
use crate::quality::{analyze, QualitySummary};
use crate::sample::SensorSample;

type ExportResult<T> = std::result::Result<T, ExportError>;

pub const COLUMNS: [&str; 15] = [
    "t", "ax", "ay", "az", "gx", "gy", "gz", "qw", "qx", "qy", "qz", "gravx", "gravy", "gravz",
    "actType",
];

const META_MARKER: &str = "# ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delimiter {
    #[default]
    Comma,
    Semicolon,
}

impl Delimiter {
    pub fn as_byte(self) -> u8 {
        match self {
            Delimiter::Comma => b',',
            Delimiter::Semicolon => b';',
        }
    }

    fn detect(header: &str) -> Self {
        if header.contains(';') {
            Delimiter::Semicolon
        } else {
            Delimiter::Comma
        }
    }
}

/// First 8 hex characters of the SHA-256 of `id`.
pub fn anonymize(id: &str) -> String {
    Sha256::digest(id.as_bytes())
        .iter()
        .take(4)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Participant id as it may appear in records and history.
pub fn participant_label(meta: &TrialMeta, settings: &Settings) -> String {
    if settings.strict_anonymization {
        anonymize(&meta.participant_id)
    } else {
        meta.participant_id.clone()
    }
}

/// Replaces path separators and control characters so a field stays one
/// path component.
fn name_component(field: &str) -> String {
    field
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// `{yyyyMMdd_HHmmss}Z_{participant}-{session}_{position}_{condition}_{bac}.csv`
pub fn file_name(meta: &TrialMeta, participant: &str, captured_at: DateTime<Utc>) -> String {
    let bac = format!("{:.2}", meta.bac.unwrap_or(0.0)).replace('.', "p");
    format!(
        "{}Z_{}-{}_{}_{}_{}.csv",
        captured_at.format("%Y%m%d_%H%M%S"),
        name_component(participant),
        name_component(&meta.session_id),
        meta.position,
        meta.condition,
        bac
    )
}

/// Ordered `(key, value)` metadata for the record header.
pub fn metadata_entries(
    meta: &TrialMeta,
    participant: &str,
    quality: &QualitySummary,
) -> ExportResult<Vec<(&'static str, String)>> {
    let mut kv: Vec<(&'static str, String)> = Vec::with_capacity(32);
    kv.push(("file_schema_version", meta.file_schema_version.clone()));
    kv.push(("app_version", meta.app_version.clone()));
    kv.push(("participant_id", participant.to_string()));
    let demographics = [
        ("sex", &meta.sex),
        ("age_years", &meta.age_years),
        ("height_in", &meta.height_in),
        ("weight_lb", &meta.weight_lb),
    ];
    for (key, value) in demographics {
        if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
            kv.push((key, v.to_string()));
        }
    }
    kv.push(("session_id", meta.session_id.clone()));
    kv.push(("device_model", meta.device_model.clone()));
    kv.push(("os_version", meta.os_version.clone()));
    kv.push(("position", meta.position.to_string()));
    kv.push(("orientation_start", meta.orientation_start.clone()));
    kv.push(("condition", meta.condition.to_string()));
    if let Some(bac) = meta.bac {
        kv.push(("bac", format!("{bac:.3}")));
    }
    if let Some(method) = meta.bac_method {
        kv.push(("bac_method", method.to_string()));
    }
    if let Some(model) = &meta.bac_brand_model {
        kv.push(("bac_brand_model", model.clone()));
    }
    if let Some(at) = meta.bac_measured_at {
        kv.push((
            "bac_measured_at",
            at.to_rfc3339_opts(SecondsFormat::Secs, true),
        ));
    }
    if let Some(delay) = meta.bac_delay_min {
        kv.push(("bac_delay_min", format!("{delay:.1}")));
    }
    kv.push(("sampling_hz_target", meta.sampling_hz_target.to_string()));
    kv.push((
        "sampling_hz_measured",
        format!("{:.2}", meta.sampling_hz_measured),
    ));
    kv.push(("duration_target_s", meta.duration_target_s.to_string()));
    kv.push((
        "duration_recorded_s",
        format!("{:.3}", meta.duration_recorded_s),
    ));
    kv.push(("preroll_s", format!("{:.3}", meta.preroll_s)));
    kv.push(("quality_flags", serde_json::to_string(&meta.quality_flags)?));
    kv.push(("quality_summary", serde_json::to_string(quality)?));
    Ok(kv)
}

fn format_row(s: &SensorSample) -> [String; 15] {
    let f = |v: f64| format!("{v:.6}");
    [
        f(s.t),
        f(s.ax),
        f(s.ay),
        f(s.az),
        f(s.gx),
        f(s.gy),
        f(s.gz),
        f(s.qw),
        f(s.qx),
        f(s.qy),
        f(s.qz),
        f(s.gravx),
        f(s.gravy),
        f(s.gravz),
        s.act_type.clone().unwrap_or_default(),
    ]
}

/// What the JSON sidecar holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarRecord {
    pub meta: TrialMeta,
    pub quality: QualitySummary,
}

#[derive(Debug, Clone)]
pub struct SidecarEntry {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub record: SidecarRecord,
}

pub fn sidecar_path(record: &Path) -> PathBuf {
    record.with_extension("json")
}

pub fn read_sidecar<P: AsRef<Path>>(path: P) -> ExportResult<SidecarRecord> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// All readable sidecars in `dir`, newest first. Unparseable files are skipped.
pub fn list_sidecars<P: AsRef<Path>>(dir: P) -> ExportResult<Vec<SidecarEntry>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_sidecar(&path) {
            Ok(record) => {
                let modified = fs::metadata(&path)?.modified()?;
                entries.push(SidecarEntry {
                    path,
                    modified,
                    record,
                });
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable sidecar"),
        }
    }
    entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
    Ok(entries)
}

/// Writes trial records into one output directory.
#[derive(Debug, Clone)]
pub struct TrialExporter {
    dir: PathBuf,
}

impl TrialExporter {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Exporter rooted at the platform sessions directory for `settings`.
    pub fn for_settings(settings: &Settings) -> Self {
        Self::new(AppDirs::sessions_dir(&settings.folder_prefix))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(
        &self,
        meta: &TrialMeta,
        samples: &[SensorSample],
        settings: &Settings,
        quality: &QualitySummary,
    ) -> ExportResult<PathBuf> {
        self.write_at(Utc::now(), meta, samples, settings, quality)
    }

    /// Write the record and its sidecar as captured at `captured_at`.
    pub fn write_at(
        &self,
        captured_at: DateTime<Utc>,
        meta: &TrialMeta,
        samples: &[SensorSample],
        settings: &Settings,
        quality: &QualitySummary,
    ) -> ExportResult<PathBuf> {
        let participant = participant_label(meta, settings);

        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(file_name(meta, &participant, captured_at));

        let mut text = String::new();
        for (key, value) in metadata_entries(meta, &participant, quality)? {
            text.push_str(META_MARKER);
            text.push_str(key);
            text.push(',');
            text.push_str(&value);
            text.push('\n');
        }

        let mut table = csv::WriterBuilder::new()
            .delimiter(settings.delimiter().as_byte())
            .from_writer(text.into_bytes());
        table.write_record(COLUMNS)?;
        for sample in samples {
            table.write_record(format_row(sample))?;
        }
        let bytes = table
            .into_inner()
            .map_err(|e| ExportError::Io(e.into_error()))?;

        let tmp = path.with_extension("csv.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;

        let mut sidecar_meta = meta.clone();
        sidecar_meta.participant_id = participant;
        let sidecar = SidecarRecord {
            meta: sidecar_meta,
            quality: quality.clone(),
        };
        fs::write(sidecar_path(&path), serde_json::to_vec(&sidecar)?)?;

        debug!(path = %path.display(), samples = samples.len(), "trial record written");
        Ok(path)
    }
}

/// Analyze `samples`, stamp the measured values into the metadata and write
/// the record. Used for both live and already-finished trials. Metadata is
/// written as given; callers validate it before recording.
pub fn export_trial(
    samples: &[SensorSample],
    target_hz: u32,
    meta: &TrialMeta,
    settings: &Settings,
    exporter: &TrialExporter,
) -> Result<(PathBuf, QualitySummary)> {
    let quality = analyze(samples, target_hz);

    let mut meta = meta.clone();
    meta.sampling_hz_target = target_hz;
    meta.sampling_hz_measured = quality.measured_hz;
    meta.duration_recorded_s = quality.duration_s;

    match exporter.write(&meta, samples, settings, &quality) {
        Ok(path) => {
            info!(path = %path.display(), verdict = %quality.verdict, "trial exported");
            Ok((path, quality))
        }
        Err(e) => {
            error!(error = %e, dir = %exporter.dir().display(), "export failed");
            Err(e.into())
        }
    }
}

/// An exported record parsed back into memory.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialFile {
    pub metadata: Vec<(String, String)>,
    pub delimiter: Delimiter,
    pub samples: Vec<SensorSample>,
}

impl TrialFile {
    pub fn read<P: AsRef<Path>>(path: P) -> ExportResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> ExportResult<Self> {
        let mut metadata = Vec::new();
        let mut rest = text;
        while let Some(line) = rest.strip_prefix(META_MARKER) {
            let (line, tail) = line.split_once('\n').unwrap_or((line, ""));
            let line = line.trim_end_matches('\r');
            let (key, value) = line.split_once(',').ok_or_else(|| {
                ExportError::InvalidRecord(format!("metadata line without value: {line}"))
            })?;
            metadata.push((key.to_string(), value.to_string()));
            rest = tail;
        }

        let header = rest
            .lines()
            .next()
            .ok_or_else(|| ExportError::InvalidRecord("missing column header".to_string()))?;
        let delimiter = Delimiter::detect(header);

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter.as_byte())
            .from_reader(rest.as_bytes());
        if reader.headers()?.iter().ne(COLUMNS) {
            return Err(ExportError::InvalidRecord(format!(
                "unexpected columns: {header}"
            )));
        }

        let mut samples = Vec::new();
        for record in reader.records() {
            samples.push(parse_row(&record?)?);
        }

        Ok(Self {
            metadata,
            delimiter,
            samples,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn target_hz(&self) -> Option<u32> {
        self.get("sampling_hz_target")?.parse().ok()
    }

    pub fn quality(&self) -> Option<QualitySummary> {
        serde_json::from_str(self.get("quality_summary")?).ok()
    }
}

fn parse_row(record: &csv::StringRecord) -> ExportResult<SensorSample> {
    let num = |i: usize| -> ExportResult<f64> {
        record
            .get(i)
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| {
                ExportError::InvalidRecord(format!(
                    "bad `{}` value on line {}",
                    COLUMNS[i],
                    record.position().map_or(0, |p| p.line())
                ))
            })
    };
    Ok(SensorSample {
        t: num(0)?,
        ax: num(1)?,
        ay: num(2)?,
        az: num(3)?,
        gx: num(4)?,
        gy: num(5)?,
        gz: num(6)?,
        qw: num(7)?,
        qx: num(8)?,
        qy: num(9)?,
        qz: num(10)?,
        gravx: num(11)?,
        gravy: num(12)?,
        gravz: num(13)?,
        act_type: record
            .get(14)
            .filter(|v| !v.is_empty())
            .map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{BacMethod, Condition, Position};
    use crate::quality::Verdict;
    use crate::sample::sample_at;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn captured() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 15, 14, 30, 5).unwrap()
    }

    fn meta() -> TrialMeta {
        let mut meta = TrialMeta::new("P001", "abc123");
        meta.position = Position::PocketRight;
        meta.condition = Condition::Unknown;
        meta.bac = Some(0.08);
        meta
    }

    fn still(n: usize, az: f64) -> Vec<SensorSample> {
        (0..n).map(|i| sample_at(i as f64 * 0.01, az)).collect()
    }

    #[test]
    fn anonymize_is_short_sha256_prefix() {
        assert_eq!(anonymize("P001"), "df1e4005");
        assert_eq!(anonymize("P001").len(), 8);
    }

    #[test]
    fn file_name_encodes_trial_identity() {
        let name = file_name(&meta(), "P001", captured());
        assert_eq!(
            name,
            "20250915_143005Z_P001-abc123_pocketRight_unknown_0p08.csv"
        );

        let mut no_bac = meta();
        no_bac.bac = None;
        assert!(file_name(&no_bac, "P001", captured()).ends_with("_0p00.csv"));
    }

    #[test]
    fn writes_metadata_header_and_rows() {
        let dir = tempdir().unwrap();
        let exporter = TrialExporter::new(dir.path());
        let samples = still(5, 9.8);
        let quality = analyze(&samples, 100);
        let path = exporter
            .write_at(captured(), &meta(), &samples, &Settings::default(), &quality)
            .unwrap();

        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "20250915_143005Z_P001-abc123_pocketRight_unknown_0p08.csv"
        );
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# file_schema_version,1.0");
        assert!(lines.contains(&"# participant_id,P001"));
        assert!(lines.contains(&"# bac,0.080"));

        let header = lines
            .iter()
            .position(|l| !l.starts_with("# "))
            .unwrap();
        assert_eq!(
            lines[header],
            "t,ax,ay,az,gx,gy,gz,qw,qx,qy,qz,gravx,gravy,gravz,actType"
        );
        let rows = &lines[header + 1..];
        assert_eq!(rows.len(), 5);
        assert!(rows[0].starts_with("0.000000,"));
        assert_eq!(rows[0].split(',').nth(3), Some("9.800000"));
        assert!(rows[0].ends_with(','));
        assert!(sidecar_path(&path).exists());
    }

    #[test]
    fn metadata_keys_are_in_fixed_order() {
        let mut m = meta();
        m.sex = Some("Female".into());
        m.age_years = Some(String::new());
        m.bac_method = Some(BacMethod::Breathalyzer);
        m.bac_measured_at = Some(captured());
        m.bac_delay_min = Some(12.0);
        let quality = QualitySummary::poor();
        let keys: Vec<&str> = metadata_entries(&m, "P001", &quality)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(
            keys,
            vec![
                "file_schema_version",
                "app_version",
                "participant_id",
                "sex",
                "session_id",
                "device_model",
                "os_version",
                "position",
                "orientation_start",
                "condition",
                "bac",
                "bac_method",
                "bac_measured_at",
                "bac_delay_min",
                "sampling_hz_target",
                "sampling_hz_measured",
                "duration_target_s",
                "duration_recorded_s",
                "preroll_s",
                "quality_flags",
                "quality_summary",
            ]
        );

        let entries = metadata_entries(&m, "P001", &quality).unwrap();
        let get = |key: &str| entries.iter().find(|(k, _)| *k == key).unwrap().1.clone();
        assert_eq!(get("bac_measured_at"), "2025-09-15T14:30:05Z");
        assert_eq!(get("bac_delay_min"), "12.0");
        assert_eq!(get("bac_method"), "breathalyzer");
        assert_eq!(get("quality_flags"), "{}");
    }

    #[test]
    fn semicolon_table_keeps_comma_metadata() {
        let dir = tempdir().unwrap();
        let settings = Settings {
            use_semicolon_delimiter: true,
            ..Settings::default()
        };
        let samples = still(4, 1.0);
        let path = TrialExporter::new(dir.path())
            .write_at(captured(), &meta(), &samples, &settings, &analyze(&samples, 100))
            .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("# session_id,abc123\n"));
        assert!(text.contains("\nt;ax;ay;az;"));

        let file = TrialFile::read(&path).unwrap();
        assert_eq!(file.delimiter, Delimiter::Semicolon);
        assert_eq!(file.samples.len(), 4);
    }

    #[test]
    fn strict_anonymization_hides_participant_everywhere() {
        let dir = tempdir().unwrap();
        let settings = Settings {
            strict_anonymization: true,
            ..Settings::default()
        };
        let samples = still(3, 1.0);
        let path = TrialExporter::new(dir.path())
            .write_at(captured(), &meta(), &samples, &settings, &analyze(&samples, 100))
            .unwrap();

        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.contains("_df1e4005-abc123_"));
        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("P001"));
        let sidecar = read_sidecar(sidecar_path(&path)).unwrap();
        assert_eq!(sidecar.meta.participant_id, "df1e4005");
    }

    #[test]
    fn read_back_preserves_samples_and_metadata() {
        let dir = tempdir().unwrap();
        let mut samples = still(6, 1.25);
        samples[2].act_type = Some("walking".into());
        let quality = analyze(&samples, 100);
        let path = TrialExporter::new(dir.path())
            .write_at(captured(), &meta(), &samples, &Settings::default(), &quality)
            .unwrap();

        let file = TrialFile::read(&path).unwrap();
        assert_eq!(file.delimiter, Delimiter::Comma);
        assert_eq!(file.get("session_id"), Some("abc123"));
        assert_eq!(file.target_hz(), Some(100));
        assert_eq!(file.samples.len(), 6);
        assert_eq!(file.samples[2].act_type.as_deref(), Some("walking"));
        assert_eq!(file.samples[1].act_type, None);
        assert!((file.samples[5].t - 0.05).abs() < 1e-9);
        assert_eq!(file.quality().unwrap().verdict, quality.verdict);
    }

    #[test]
    fn rejects_foreign_files() {
        assert_matches!(
            TrialFile::parse("# a,b\nfoo,bar\n1,2\n"),
            Err(ExportError::InvalidRecord(_))
        );
        assert_matches!(
            TrialFile::parse("# only metadata\n"),
            Err(ExportError::InvalidRecord(_))
        );
    }

    #[test]
    fn export_trial_stamps_measured_values() {
        let dir = tempdir().unwrap();
        let exporter = TrialExporter::new(dir.path());
        let samples = still(201, 1.0);
        let (path, quality) =
            export_trial(&samples, 100, &meta(), &Settings::default(), &exporter).unwrap();

        assert_eq!(quality.verdict, Verdict::Ok);
        let file = TrialFile::read(&path).unwrap();
        assert_eq!(file.get("sampling_hz_measured"), Some("100.00"));
        assert_eq!(file.get("duration_recorded_s"), Some("2.000"));
    }

    #[test]
    fn export_trial_writes_unvalidated_meta() {
        let dir = tempdir().unwrap();
        let exporter = TrialExporter::new(dir.path());
        let mut m = meta();
        m.participant_id = String::new();
        m.bac = Some(0.9);
        let (path, _) =
            export_trial(&still(10, 1.0), 100, &m, &Settings::default(), &exporter).unwrap();
        let file = TrialFile::read(&path).unwrap();
        assert_eq!(file.get("bac"), Some("0.900"));
        assert_eq!(file.samples.len(), 10);
    }

    #[test]
    fn separators_in_ids_stay_inside_export_dir() {
        let dir = tempdir().unwrap();
        let mut m = meta();
        m.participant_id = "../P001".into();
        m.session_id = "a/b\\c".into();
        let samples = still(3, 1.0);
        let path = TrialExporter::new(dir.path())
            .write_at(captured(), &m, &samples, &Settings::default(), &analyze(&samples, 100))
            .unwrap();

        assert_eq!(path.parent(), Some(dir.path()));
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.contains("Z_.._P001-a_b_c_"), "{name}");
    }

    #[test]
    fn participant_label_follows_anonymization() {
        let strict = Settings {
            strict_anonymization: true,
            ..Settings::default()
        };
        assert_eq!(participant_label(&meta(), &strict), "df1e4005");
        assert_eq!(participant_label(&meta(), &Settings::default()), "P001");
    }

    #[test]
    fn empty_trial_still_exports_poor_record() {
        let dir = tempdir().unwrap();
        let exporter = TrialExporter::new(dir.path());
        let (path, quality) =
            export_trial(&[], 100, &meta(), &Settings::default(), &exporter).unwrap();
        assert_eq!(quality, QualitySummary::poor());
        assert!(TrialFile::read(&path).unwrap().samples.is_empty());
    }

    #[test]
    fn lists_sidecars_newest_first() {
        let dir = tempdir().unwrap();
        let exporter = TrialExporter::new(dir.path());
        let samples = still(3, 1.0);
        let quality = analyze(&samples, 100);
        let mut first = meta();
        first.session_id = "first".into();
        let mut second = meta();
        second.session_id = "second".into();
        exporter
            .write_at(captured(), &first, &samples, &Settings::default(), &quality)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        exporter
            .write_at(captured(), &second, &samples, &Settings::default(), &quality)
            .unwrap();
        fs::write(dir.path().join("junk.json"), b"[]").unwrap();

        let listed = list_sidecars(dir.path()).unwrap();
        let sessions: Vec<&str> = listed
            .iter()
            .map(|e| e.record.meta.session_id.as_str())
            .collect();
        assert_eq!(sessions, vec!["second", "first"]);
    }

    #[test]
    fn listing_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        assert!(list_sidecars(dir.path().join("nope")).unwrap().is_empty());
    }
}
