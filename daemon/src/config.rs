use anyhow::{bail, Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use crate::event::SupervisorEvent;

pub const DEFAULT_STATUS_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_SCREEN_OFF_SKIP_THRESHOLD: u32 = 10;
pub const DEFAULT_CONNECT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_CONNECT_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_CHECK_ATTEMPTS: u32 = 10;
pub const DEFAULT_CHECK_RATE_MS: u64 = 1000;
/// Shortest polling interval accepted from the config file.
pub const MIN_STATUS_INTERVAL_MS: u64 = 100;

/// Root configuration structure. Deserialized from `config.toml` in the
/// supervisor data directory.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub setup: SetupConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

/// Where the worker lives and how it is started.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Install directory and working directory of the worker process.
    pub working_dir: PathBuf,
    /// Bundled files; the binary sits in a per-architecture subdirectory.
    pub asset_dir: PathBuf,
    pub binary_name: String,
    /// File in `working_dir` holding the control-channel password.
    pub auth_file_name: String,
    /// Control-channel socket. Relative paths resolve inside `working_dir`.
    pub socket_address: String,
    pub launch_args: Vec<String>,
    /// Reinstall on every setup even when hashes match.
    pub force_reinstall: bool,
    pub aux_files: Vec<AuxFileConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("/var/lib/worker-supervisor/client"),
            asset_dir: PathBuf::from("/usr/share/worker-supervisor/assets"),
            binary_name: "boinc".to_string(),
            auth_file_name: "gui_rpc_auth.cfg".to_string(),
            socket_address: "boinc_socket".to_string(),
            launch_args: vec!["--daemon".to_string(), "--gui_rpc_unix_domain".to_string()],
            force_reinstall: false,
            aux_files: vec![
                AuxFileConfig { name: "ca-bundle.crt".to_string(), target: None, overwrite: true },
                AuxFileConfig {
                    name: "all_projects_list.xml".to_string(),
                    target: None,
                    overwrite: true,
                },
                AuxFileConfig {
                    name: "nomedia".to_string(),
                    target: Some(".nomedia".to_string()),
                    overwrite: false,
                },
            ],
        }
    }
}

impl WorkerConfig {
    #[cfg(test)]
    pub fn binary_path(&self) -> PathBuf {
        self.working_dir.join(&self.binary_name)
    }

    pub fn auth_file_path(&self) -> PathBuf {
        self.working_dir.join(&self.auth_file_name)
    }

    pub fn socket_path(&self) -> PathBuf {
        let address = Path::new(&self.socket_address);
        if address.is_absolute() {
            address.to_path_buf()
        } else {
            self.working_dir.join(address)
        }
    }
}

/// A non-executable file installed next to the worker binary.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuxFileConfig {
    /// File name in the asset directory.
    pub name: String,
    /// File name in the working directory, when different from `name`.
    #[serde(default)]
    pub target: Option<String>,
    /// Replace an existing copy on reinstall.
    #[serde(default)]
    pub overwrite: bool,
}

impl AuxFileConfig {
    pub fn target_name(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Minimum time between two regular ticks. Clamped to at least
    /// [`MIN_STATUS_INTERVAL_MS`].
    pub status_interval_ms: u64,
    /// While the display is off, number of minimal reads between full reads.
    pub screen_off_skip_threshold: u32,
    /// Publish a notice signal when new notices arrive.
    pub notify_on_notices: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            status_interval_ms: DEFAULT_STATUS_INTERVAL_MS,
            screen_off_skip_threshold: DEFAULT_SCREEN_OFF_SKIP_THRESHOLD,
            notify_on_notices: true,
        }
    }
}

impl PollingConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(MIN_STATUS_INTERVAL_MS))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    pub connect_retry_attempts: u32,
    pub connect_retry_delay_ms: u64,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            connect_retry_attempts: DEFAULT_CONNECT_RETRY_ATTEMPTS,
            connect_retry_delay_ms: DEFAULT_CONNECT_RETRY_DELAY_MS,
        }
    }
}

/// Termination poll budgets. Kept separate from the setup retry budget.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Checks after a control-channel quit.
    pub graceful_check_attempts: u32,
    pub graceful_check_rate_ms: u64,
    /// Checks after each OS signal.
    pub os_check_attempts: u32,
    pub os_check_rate_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_check_attempts: DEFAULT_CHECK_ATTEMPTS,
            graceful_check_rate_ms: DEFAULT_CHECK_RATE_MS,
            os_check_attempts: DEFAULT_CHECK_ATTEMPTS,
            os_check_rate_ms: DEFAULT_CHECK_RATE_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub wake_lock_path: PathBuf,
    pub wake_unlock_path: PathBuf,
    pub tag: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wake_lock_path: PathBuf::from("/sys/power/wake_lock"),
            wake_unlock_path: PathBuf::from("/sys/power/wake_unlock"),
            tag: "worker-supervisor".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub backlight_dir: PathBuf,
    pub poll_interval_ms: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self { backlight_dir: PathBuf::from("/sys/class/backlight"), poll_interval_ms: 2000 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub power_supply_dir: PathBuf,
    pub net_dir: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            power_supply_dir: PathBuf::from("/sys/class/power_supply"),
            net_dir: PathBuf::from("/sys/class/net"),
        }
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the
/// file does not exist. Errors when the file cannot be read or parsed, or
/// names worker files that are not plain file names.
pub fn load_or_default(path: &Path) -> Result<Config> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read config file {}", path.display()))
        }
    };
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.validate().with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}

impl Config {
    /// File names that are joined onto `working_dir` or `asset_dir` must not
    /// escape them.
    fn validate(&self) -> Result<()> {
        let w = &self.worker;
        plain_file_name("worker.binary_name", &w.binary_name)?;
        plain_file_name("worker.auth_file_name", &w.auth_file_name)?;
        for aux in &w.aux_files {
            plain_file_name("worker.aux_files.name", &aux.name)?;
            plain_file_name("worker.aux_files.target", aux.target_name())?;
        }
        Ok(())
    }

    /// Sections that differ from `previous` but only take effect after a
    /// restart. Polling is applied live and never listed.
    pub fn restart_sections(&self, previous: &Config) -> Vec<&'static str> {
        let mut sections = Vec::new();
        if self.worker != previous.worker {
            sections.push("worker");
        }
        if self.setup != previous.setup {
            sections.push("setup");
        }
        if self.shutdown != previous.shutdown {
            sections.push("shutdown");
        }
        if self.locks != previous.locks {
            sections.push("locks");
        }
        if self.display != previous.display {
            sections.push("display");
        }
        if self.device != previous.device {
            sections.push("device");
        }
        sections
    }
}

fn plain_file_name(field: &str, name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(_)), None) => Ok(()),
        _ => bail!("{field} must be a plain file name, got {name:?}"),
    }
}

/// True for a create or modify event touching `path`. Editors save by
/// writing a new file and renaming it over the old one, which only shows up
/// on the directory.
fn is_config_write(event: &notify::Event, path: &Path) -> bool {
    matches!(event.kind, notify::EventKind::Create(_) | notify::EventKind::Modify(_))
        && event.paths.iter().any(|p| p == path)
}

/// Watches the directory holding `path` and re-reads the file on every
/// write. A `ConfigReloaded` event is sent only when the polling section
/// changed; changes to other sections are logged as needing a restart.
/// Invalid files are logged and leave `current` in effect.
pub async fn watch_config(
    path: PathBuf,
    mut current: Config,
    tx: mpsc::Sender<SupervisorEvent>,
) {
    let Some(watch_dir) = path.parent().map(Path::to_path_buf) else {
        warn!(path = %path.display(), "config path has no parent directory");
        return;
    };
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);
    let watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    );
    let mut watcher = match watcher {
        Ok(w) => w,
        Err(e) => {
            warn!("config watcher unavailable, live reload disabled: {e}");
            return;
        }
    };
    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        warn!(dir = %watch_dir.display(), "cannot watch config directory: {e}");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        if !is_config_write(&event, &path) {
            continue;
        }
        let next = match load_or_default(&path) {
            Ok(next) => next,
            Err(e) => {
                warn!("config reload rejected, keeping current settings: {e:#}");
                continue;
            }
        };

        let restart = next.restart_sections(&current);
        if !restart.is_empty() {
            warn!(sections = ?restart, "config change takes effect after restart");
        }
        let polling_changed = next.polling != current.polling;
        current = next;
        if !polling_changed {
            continue;
        }
        if tx.send(SupervisorEvent::ConfigReloaded(current.clone())).await.is_err() {
            break;
        }
    }
}
