use directories::ProjectDirs;
use std::path::PathBuf;

/// Centralized application directory resolution
pub struct AppDirs;

impl AppDirs {
    /// Directory exported trials land in: `<data dir>/<prefix>`.
    pub fn sessions_dir(prefix: &str) -> PathBuf {
        Self::data_dir().join(prefix)
    }

    pub fn history_db_path() -> Option<PathBuf> {
        if let Ok(home) = std::env::var("HOME") {
            let state_dir = PathBuf::from(home)
                .join(".local")
                .join("state")
                .join("gaitrec");
            Some(state_dir.join("history.db"))
        } else {
            ProjectDirs::from("", "", "gaitrec")
                .map(|proj_dirs| proj_dirs.data_local_dir().join("history.db"))
        }
    }

    fn data_dir() -> PathBuf {
        ProjectDirs::from("", "", "gaitrec")
            .map(|proj_dirs| proj_dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
