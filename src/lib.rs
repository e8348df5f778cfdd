// Library surface for the gaitrec binary and headless/integration tests.
pub mod app_dirs;
pub mod cadence;
pub mod config;
pub mod error;
pub mod export;
pub mod history;
pub mod live_stats;
pub mod meta;
pub mod quality;
pub mod recorder;
pub mod runtime;
pub mod sample;
pub mod source;
pub mod time_series;
pub mod util;

pub use error::{ExportError, RecorderError, Result};
