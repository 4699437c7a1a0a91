/// Canonical file paths for supervisor data files.
///
/// Both files live in the supervisor data directory, `$WORKER_SUPERVISOR_HOME`
/// when set, otherwise `<data dir>/worker-supervisor`:
///   - config.toml  Written by the operator, read (and watched) by the daemon.
///   - status.toml  Written by the daemon, read by UI clients.
///   - supervisor.lock  Held by the running daemon, holds its pid.
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "worker-supervisor";
pub const HOME_ENV: &str = "WORKER_SUPERVISOR_HOME";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";
pub const LOCK_FILE_NAME: &str = "supervisor.lock";

/// Returns the supervisor data directory, or `None` when neither the
/// override variable nor a platform data directory is available.
pub fn app_data_dir() -> Option<PathBuf> {
    resolve_data_dir(std::env::var_os(HOME_ENV).map(PathBuf::from), dirs::data_dir())
}

fn resolve_data_dir(home: Option<PathBuf>, data_dir: Option<PathBuf>) -> Option<PathBuf> {
    match home {
        Some(home) if !home.as_os_str().is_empty() => Some(home),
        _ => data_dir.map(|d| d.join(APP_DIR_NAME)),
    }
}

pub fn config_file_path(app_dir: &Path) -> PathBuf {
    app_dir.join(CONFIG_FILE_NAME)
}

pub fn status_file_path(app_dir: &Path) -> PathBuf {
    app_dir.join(STATUS_FILE_NAME)
}

pub fn lock_file_path(app_dir: &Path) -> PathBuf {
    app_dir.join(LOCK_FILE_NAME)
}
