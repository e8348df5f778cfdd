use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::export::Delimiter;
use crate::recorder::TrialConfig;

/// User-adjustable settings read at the start of each trial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub duration_secs: u32,
    pub target_hz: u32,
    pub preroll_secs: f64,
    pub beeps: bool,
    pub haptics: bool,
    pub strict_anonymization: bool,
    pub folder_prefix: String,
    pub use_semicolon_delimiter: bool,
    pub last_participant_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            duration_secs: 30,
            target_hz: 100,
            preroll_secs: 2.0,
            beeps: true,
            haptics: true,
            strict_anonymization: false,
            folder_prefix: "GaitTrials".to_string(),
            use_semicolon_delimiter: false,
            last_participant_id: String::new(),
        }
    }
}

impl Settings {
    pub fn trial_config(&self) -> TrialConfig {
        TrialConfig {
            target_hz: self.target_hz.max(1),
            duration_secs: self.duration_secs.max(1),
            lead_in_secs: self.preroll_secs.max(0.0),
            beeps: self.beeps,
            haptics: self.haptics,
        }
    }

    pub fn delimiter(&self) -> Delimiter {
        if self.use_semicolon_delimiter {
            Delimiter::Semicolon
        } else {
            Delimiter::Comma
        }
    }
}

pub trait SettingsStore {
    fn load(&self) -> Settings;
    fn save(&self, settings: &Settings) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let path = if let Some(pd) = ProjectDirs::from("", "", "gaitrec") {
            pd.config_dir().join("settings.json")
        } else {
            PathBuf::from("gaitrec_settings.json")
        };
        Self { path }
    }

    pub fn with_path<P: AsRef<Path>>(p: P) -> Self {
        Self {
            path: p.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileSettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self) -> Settings {
        let Ok(bytes) = fs::read(&self.path) else {
            return Settings::default();
        };
        match serde_json::from_slice::<Settings>(&bytes) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring unreadable settings");
                Settings::default()
            }
        }
    }

    fn save(&self, settings: &Settings) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(settings)?;
        fs::write(&self.path, data)
    }
}
