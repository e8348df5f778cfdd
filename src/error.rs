//! Error types for trial recording and export

use thiserror::Error;

/// Error type for recorder operations
#[derive(Error, Debug)]
pub enum RecorderError {
    /// The sensor subsystem cannot be started; the recorder keeps its pre-start state
    #[error("Sensor source unavailable")]
    SourceUnavailable,

    /// The sensor source failed while subscribing or delivering
    #[error("Sensor source error: {0}")]
    Source(String),

    /// The owner thread is gone; no further requests can be served
    #[error("Recorder service stopped")]
    ServiceStopped,

    /// Trial metadata rejected before recording (missing participant, BAC out of range)
    #[error("Invalid trial metadata: {0}")]
    InvalidMeta(String),

    /// Writing the trial record failed; the trial stays finished and export may be retried
    #[error("Export failed: {0}")]
    Export(#[from] ExportError),
}

/// Error type for writing and reading trial records
#[derive(Error, Debug)]
pub enum ExportError {
    /// Storage-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sample table could not be written or parsed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Sidecar or embedded JSON could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File is not a trial record
    #[error("Invalid trial record: {0}")]
    InvalidRecord(String),
}

/// Result type for recorder operations
pub type Result<T> = std::result::Result<T, RecorderError>;
