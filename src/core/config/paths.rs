use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub secrets_path: PathBuf,
}

impl AppPaths {
    pub fn new() -> Self {
        Self::from_dir(discover_data_dir())
    }

    pub fn from_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let log_dir = data_dir.join("logs");
        let secrets_path = data_dir.join("secrets.yaml");

        AppPaths {
            data_dir,
            log_dir,
            secrets_path,
        }
    }

    /// Resolves `path` against the data directory unless it is absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn ensure_dirs(&self) {
        for dir in [&self.data_dir, &self.log_dir] {
            let _ = fs::create_dir_all(dir);
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}

fn discover_data_dir() -> PathBuf {
    if let Ok(dir) = env::var("RAG_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}
