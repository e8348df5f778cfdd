use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Result, Row};
use std::path::{Path, PathBuf};

use crate::app_dirs::AppDirs;
use crate::config::Settings;
use crate::export::participant_label;
use crate::meta::TrialMeta;
use crate::quality::QualitySummary;

/// One exported trial as remembered across runs
#[derive(Debug, Clone, PartialEq)]
pub struct TrialEntry {
    pub recorded_at: DateTime<Utc>,
    pub participant_id: String,
    pub session_id: String,
    pub file_path: String,
    pub sample_count: i64,
    pub measured_hz: f64,
    pub dropped_pct: f64,
    pub cadence_spm: Option<f64>,
    pub verdict: String,
    pub stop_reason: String,
}

impl TrialEntry {
    /// Entry for an exported trial. The participant id is stored the way the
    /// record shows it, hashed under strict anonymization.
    pub fn from_export(
        meta: &TrialMeta,
        settings: &Settings,
        path: &Path,
        sample_count: usize,
        quality: &QualitySummary,
        stop_reason: &str,
    ) -> Self {
        Self {
            recorded_at: Utc::now(),
            participant_id: participant_label(meta, settings),
            session_id: meta.session_id.clone(),
            file_path: path.display().to_string(),
            sample_count: sample_count as i64,
            measured_hz: quality.measured_hz,
            dropped_pct: quality.dropped_pct,
            cadence_spm: quality.cadence_spm,
            verdict: quality.verdict.to_string(),
            stop_reason: stop_reason.to_string(),
        }
    }
}

/// SQLite log of exported trials
#[derive(Debug)]
pub struct TrialHistory {
    conn: Connection,
}

impl TrialHistory {
    /// Open the history at the default location, creating it if needed
    pub fn open_default() -> Result<Self> {
        let path = AppDirs::history_db_path().unwrap_or_else(|| PathBuf::from("gaitrec_history.db"));
        Self::open(path)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                    Some(format!("Failed to create directory: {}", e)),
                )
            })?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS trials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL,
                participant_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                sample_count INTEGER NOT NULL,
                measured_hz REAL NOT NULL,
                dropped_pct REAL NOT NULL,
                cadence_spm REAL,
                verdict TEXT NOT NULL,
                stop_reason TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trials_recorded_at ON trials(recorded_at)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trials_participant ON trials(participant_id)",
            [],
        )?;

        Ok(TrialHistory { conn })
    }

    pub fn record(&self, entry: &TrialEntry) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO trials
            (recorded_at, participant_id, session_id, file_path, sample_count,
             measured_hz, dropped_pct, cadence_spm, verdict, stop_reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                entry.recorded_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                entry.participant_id,
                entry.session_id,
                entry.file_path,
                entry.sample_count,
                entry.measured_hz,
                entry.dropped_pct,
                entry.cadence_spm,
                entry.verdict,
                entry.stop_reason,
            ],
        )?;
        Ok(())
    }

    /// Most recent trials first
    pub fn recent(&self, limit: usize) -> Result<Vec<TrialEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT recorded_at, participant_id, session_id, file_path, sample_count,
                   measured_hz, dropped_pct, cadence_spm, verdict, stop_reason
            FROM trials
            ORDER BY recorded_at DESC, id DESC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map([limit as i64], entry_from_row)?;
        rows.collect()
    }

    pub fn for_participant(&self, participant_id: &str) -> Result<Vec<TrialEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT recorded_at, participant_id, session_id, file_path, sample_count,
                   measured_hz, dropped_pct, cadence_spm, verdict, stop_reason
            FROM trials
            WHERE participant_id = ?1
            ORDER BY recorded_at DESC, id DESC
            "#,
        )?;
        let rows = stmt.query_map([participant_id], entry_from_row)?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM trials", [], |row| row.get(0))
    }

    pub fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM trials", [])?;
        Ok(())
    }
}

fn entry_from_row(row: &Row<'_>) -> Result<TrialEntry> {
    let recorded_at: String = row.get(0)?;
    let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
        .map_err(|_| {
            rusqlite::Error::InvalidColumnType(0, "recorded_at".to_string(), rusqlite::types::Type::Text)
        })?
        .with_timezone(&Utc);

    Ok(TrialEntry {
        recorded_at,
        participant_id: row.get(1)?,
        session_id: row.get(2)?,
        file_path: row.get(3)?,
        sample_count: row.get(4)?,
        measured_hz: row.get(5)?,
        dropped_pct: row.get(6)?,
        cadence_spm: row.get(7)?,
        verdict: row.get(8)?,
        stop_reason: row.get(9)?,
    })
}
