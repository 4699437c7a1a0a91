/// Data reported by the worker over the control channel.
///
/// These types are what a full read collects and what observers see through
/// the shared status model. Field sets are limited to what the supervisor and
/// its UI clients consume; the worker may report more.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Why the worker is currently not computing (or not transferring).
///
/// Serialized as the worker's numeric code. Unknown codes are preserved in
/// [`SuspendReason::Other`] rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum SuspendReason {
    NotSuspended,
    Batteries,
    UserActive,
    UserRequest,
    TimeOfDay,
    Benchmarks,
    DiskSize,
    CpuThrottle,
    NoRecentInput,
    InitialDelay,
    ExclusiveAppRunning,
    CpuUsage,
    NetworkQuotaExceeded,
    Os,
    WifiState,
    BatteryCharging,
    BatteryOverheated,
    NoGuiKeepalive,
    Other(i32),
}

impl SuspendReason {
    /// Whether the worker counts as computing for wake/network lock purposes.
    ///
    /// CPU throttling is treated as computing: the worker is still running
    /// tasks, only at a reduced duty cycle.
    pub fn computing_enabled(self) -> bool {
        matches!(self, SuspendReason::NotSuspended | SuspendReason::CpuThrottle)
    }
}

impl From<i32> for SuspendReason {
    fn from(code: i32) -> Self {
        match code {
            0 => SuspendReason::NotSuspended,
            1 => SuspendReason::Batteries,
            2 => SuspendReason::UserActive,
            4 => SuspendReason::UserRequest,
            8 => SuspendReason::TimeOfDay,
            16 => SuspendReason::Benchmarks,
            32 => SuspendReason::DiskSize,
            64 => SuspendReason::CpuThrottle,
            128 => SuspendReason::NoRecentInput,
            256 => SuspendReason::InitialDelay,
            512 => SuspendReason::ExclusiveAppRunning,
            1024 => SuspendReason::CpuUsage,
            2048 => SuspendReason::NetworkQuotaExceeded,
            4096 => SuspendReason::Os,
            4097 => SuspendReason::WifiState,
            4098 => SuspendReason::BatteryCharging,
            4099 => SuspendReason::BatteryOverheated,
            4100 => SuspendReason::NoGuiKeepalive,
            other => SuspendReason::Other(other),
        }
    }
}

impl From<SuspendReason> for i32 {
    fn from(reason: SuspendReason) -> Self {
        match reason {
            SuspendReason::NotSuspended => 0,
            SuspendReason::Batteries => 1,
            SuspendReason::UserActive => 2,
            SuspendReason::UserRequest => 4,
            SuspendReason::TimeOfDay => 8,
            SuspendReason::Benchmarks => 16,
            SuspendReason::DiskSize => 32,
            SuspendReason::CpuThrottle => 64,
            SuspendReason::NoRecentInput => 128,
            SuspendReason::InitialDelay => 256,
            SuspendReason::ExclusiveAppRunning => 512,
            SuspendReason::CpuUsage => 1024,
            SuspendReason::NetworkQuotaExceeded => 2048,
            SuspendReason::Os => 4096,
            SuspendReason::WifiState => 4097,
            SuspendReason::BatteryCharging => 4098,
            SuspendReason::BatteryOverheated => 4099,
            SuspendReason::NoGuiKeepalive => 4100,
            SuspendReason::Other(code) => code,
        }
    }
}

/// Overall worker status. The only thing a minimal read fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CcStatus {
    pub task_suspend_reason: SuspendReason,
    pub network_suspend_reason: SuspendReason,
    #[serde(default)]
    pub task_mode: i32,
    #[serde(default)]
    pub network_mode: i32,
}

/// A task (result) the worker is processing or has queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub name: String,
    pub project_url: String,
    #[serde(default)]
    pub fraction_done: f64,
    #[serde(default)]
    pub active_task: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub master_url: String,
    pub project_name: String,
    #[serde(default)]
    pub suspended_via_gui: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub name: String,
    pub project_url: String,
    #[serde(default)]
    pub is_upload: bool,
    #[serde(default)]
    pub bytes_transferred: u64,
    #[serde(default)]
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub domain_name: String,
    #[serde(default)]
    pub os_name: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub cpu_count: u32,
}

/// Full worker state. `host_info` is absent when the worker could not
/// report it; a full read treats that as a failed batch member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CcState {
    #[serde(default)]
    pub results: Vec<TaskResult>,
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub host_info: Option<HostInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcctMgrInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub present: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub seqno: u64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub create_time: f64,
    /// Notices originating from a project feed rather than the worker itself.
    #[serde(default)]
    pub is_feed: bool,
}

/// Worker computing preferences, fetched once per successful setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalPreferences {
    #[serde(default)]
    pub run_on_batteries: bool,
    #[serde(default)]
    pub run_if_user_active: bool,
    #[serde(default)]
    pub battery_charge_min_pct: f64,
    #[serde(default)]
    pub battery_max_temperature: f64,
    #[serde(default)]
    pub max_ncpus_pct: f64,
    #[serde(default)]
    pub network_wifi_only: bool,
}

/// Everything a successful full read produced, published as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStatusSnapshot {
    pub status: CcStatus,
    pub tasks: Vec<TaskResult>,
    pub projects: Vec<Project>,
    pub transfers: Vec<Transfer>,
    pub host_info: HostInfo,
    pub acct_mgr_info: AcctMgrInfo,
    /// Notices received so far, ordered by sequence number. Shared with the
    /// previous snapshot when no new notices arrived.
    pub notices: Arc<Vec<Notice>>,
}

impl WorkerStatusSnapshot {
    /// Highest notice sequence number held, 0 when none.
    pub fn latest_notice_seqno(&self) -> u64 {
        self.notices.last().map(|n| n.seqno).unwrap_or(0)
    }
}
