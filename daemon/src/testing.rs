//! In-memory stand-ins for the worker, the process table and the OS, shared
//! by the unit tests of every module.
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};

use crate::config::{SetupConfig, ShutdownConfig, WorkerConfig};
use crate::connection::{ChannelError, ConnectionManager, ControlChannel};
use crate::device::{DeviceStatusSnapshot, DeviceStatusSource, HostIdentity, PowerFields};
use crate::installer::{Installer, Platform};
use crate::model::{
    AcctMgrInfo, CcState, CcStatus, GlobalPreferences, HostInfo, Notice, Project, SuspendReason,
    TaskResult, Transfer,
};
use crate::process::{
    Launcher, ProcessController, ProcessTable, SignalError, SignalSender, StopSignal,
};
use crate::setup::WorkerSetup;

pub fn cc_status(task: SuspendReason, network: SuspendReason) -> CcStatus {
    CcStatus {
        task_suspend_reason: task,
        network_suspend_reason: network,
        task_mode: 2,
        network_mode: 2,
    }
}

pub fn sample_state() -> CcState {
    CcState {
        results: vec![TaskResult {
            name: "wu_1234_0".to_string(),
            project_url: "https://project.example/".to_string(),
            fraction_done: 0.25,
            active_task: true,
        }],
        projects: vec![Project {
            master_url: "https://project.example/".to_string(),
            project_name: "Example".to_string(),
            suspended_via_gui: false,
        }],
        host_info: Some(HostInfo {
            domain_name: "phone".to_string(),
            os_name: "Android".to_string(),
            os_version: "14".to_string(),
            product_name: "Pixel".to_string(),
            cpu_count: 8,
        }),
    }
}

pub fn sample_preferences() -> GlobalPreferences {
    GlobalPreferences {
        run_on_batteries: false,
        run_if_user_active: false,
        battery_charge_min_pct: 90.0,
        battery_max_temperature: 40.0,
        max_ncpus_pct: 100.0,
        network_wifi_only: true,
    }
}

pub fn notice(seqno: u64) -> Notice {
    Notice {
        seqno,
        title: format!("notice {seqno}"),
        description: String::new(),
        create_time: 0.0,
        is_feed: false,
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

/// What the fake worker answers. `None` for a request makes it fail.
pub struct FakeWorkerState {
    pub reachable: bool,
    /// Number of upcoming `open` calls that fail even when reachable.
    pub open_failures: u32,
    pub auth_ok: bool,
    pub connected: bool,
    pub tokens: Vec<String>,
    pub status: Option<CcStatus>,
    pub state: Option<CcState>,
    pub transfers: Option<Vec<Transfer>>,
    pub acct_mgr: Option<AcctMgrInfo>,
    pub prefs: Option<GlobalPreferences>,
    pub notices: Vec<Notice>,
    pub notices_fail: bool,
    pub report_ok: bool,
    pub host_info_ok: bool,
    pub calls: Vec<&'static str>,
    pub reports: Vec<DeviceStatusSnapshot>,
    pub host_info: Option<(String, String)>,
    quit_exits: Option<FakeProcesses>,
}

impl Default for FakeWorkerState {
    fn default() -> Self {
        Self {
            reachable: true,
            open_failures: 0,
            auth_ok: true,
            connected: false,
            tokens: Vec::new(),
            status: Some(cc_status(SuspendReason::NotSuspended, SuspendReason::NotSuspended)),
            state: Some(sample_state()),
            transfers: Some(Vec::new()),
            acct_mgr: Some(AcctMgrInfo::default()),
            prefs: Some(sample_preferences()),
            notices: Vec::new(),
            notices_fail: false,
            report_ok: true,
            host_info_ok: true,
            calls: Vec::new(),
            reports: Vec::new(),
            host_info: None,
            quit_exits: None,
        }
    }
}

impl FakeWorkerState {
    pub fn count(&self, call: &str) -> usize {
        self.calls.iter().filter(|c| **c == call).count()
    }
}

#[derive(Clone, Default)]
pub struct FakeWorker {
    shared: Arc<Mutex<FakeWorkerState>>,
}

impl FakeWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A quit request makes every process in `processes` exit.
    pub fn exits_on_quit(self, processes: &FakeProcesses) -> Self {
        self.shared.lock().quit_exits = Some(processes.clone());
        self
    }

    pub fn channel(&self) -> Box<dyn ControlChannel> {
        Box::new(FakeChannel { shared: self.shared.clone() })
    }

    pub fn state(&self) -> MutexGuard<'_, FakeWorkerState> {
        self.shared.lock()
    }
}

struct FakeChannel {
    shared: Arc<Mutex<FakeWorkerState>>,
}

impl FakeChannel {
    fn call(&self, name: &'static str) -> Result<MutexGuard<'_, FakeWorkerState>, ChannelError> {
        let mut state = self.shared.lock();
        state.calls.push(name);
        if state.connected {
            Ok(state)
        } else {
            Err(ChannelError::NotConnected)
        }
    }
}

fn answer<T: Clone>(value: &Option<T>, what: &'static str) -> Result<T, ChannelError> {
    value.clone().ok_or(ChannelError::UnexpectedResponse(what))
}

#[async_trait]
impl ControlChannel for FakeChannel {
    async fn open(&mut self, _address: &Path) -> Result<(), ChannelError> {
        let mut state = self.shared.lock();
        state.calls.push("open");
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
        }
        if !state.reachable {
            return Err(io::Error::from(io::ErrorKind::NotFound).into());
        }
        state.connected = true;
        Ok(())
    }

    async fn authenticate(&mut self, token: &str) -> Result<(), ChannelError> {
        let mut state = self.call("authenticate")?;
        state.tokens.push(token.to_string());
        if state.auth_ok {
            Ok(())
        } else {
            Err(ChannelError::Rejected("bad password".to_string()))
        }
    }

    fn is_alive(&self) -> bool {
        self.shared.lock().connected
    }

    async fn quit(&mut self) -> Result<(), ChannelError> {
        let state = self.call("quit")?;
        if let Some(processes) = &state.quit_exits {
            processes.clear();
        }
        Ok(())
    }

    async fn get_status(&mut self) -> Result<CcStatus, ChannelError> {
        let state = self.call("get_status")?;
        answer(&state.status, "get_status")
    }

    async fn get_state(&mut self) -> Result<CcState, ChannelError> {
        let state = self.call("get_state")?;
        answer(&state.state, "get_state")
    }

    async fn get_transfers(&mut self) -> Result<Vec<Transfer>, ChannelError> {
        let state = self.call("get_transfers")?;
        answer(&state.transfers, "get_transfers")
    }

    async fn get_acct_mgr_info(&mut self) -> Result<AcctMgrInfo, ChannelError> {
        let state = self.call("get_acct_mgr_info")?;
        answer(&state.acct_mgr, "get_acct_mgr_info")
    }

    async fn get_notices(&mut self, since_seqno: u64) -> Result<Vec<Notice>, ChannelError> {
        let state = self.call("get_notices")?;
        if state.notices_fail {
            return Err(ChannelError::UnexpectedResponse("get_notices"));
        }
        Ok(state.notices.iter().filter(|n| n.seqno > since_seqno).cloned().collect())
    }

    async fn get_preferences(&mut self) -> Result<GlobalPreferences, ChannelError> {
        let state = self.call("get_preferences")?;
        answer(&state.prefs, "get_preferences")
    }

    async fn report_device_status(
        &mut self,
        snapshot: &DeviceStatusSnapshot,
    ) -> Result<(), ChannelError> {
        let mut state = self.call("report_device_status")?;
        if !state.report_ok {
            return Err(ChannelError::Rejected("device status".to_string()));
        }
        state.reports.push(snapshot.clone());
        Ok(())
    }

    async fn set_host_info(&mut self, model: &str, os_version: &str) -> Result<(), ChannelError> {
        let mut state = self.call("set_host_info")?;
        if !state.host_info_ok {
            return Err(ChannelError::Rejected("host info".to_string()));
        }
        state.host_info = Some((model.to_string(), os_version.to_string()));
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.shared.lock();
        state.calls.push("close");
        state.connected = false;
    }
}

// ── Processes ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ProcessRows {
    rows: BTreeMap<u32, String>,
    /// (pid, listings left before the process is gone)
    exiting: Vec<(u32, u32)>,
    next_pid: u32,
}

/// A process table rendered as a `USER PID NAME` listing.
#[derive(Clone, Default)]
pub struct FakeProcesses {
    shared: Arc<Mutex<ProcessRows>>,
}

impl FakeProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, pid: u32, name: &str) {
        self.shared.lock().rows.insert(pid, name.to_string());
    }

    fn spawn(&self, name: &str) -> u32 {
        let mut inner = self.shared.lock();
        inner.next_pid += 1;
        let pid = 1000 + inner.next_pid;
        inner.rows.insert(pid, name.to_string());
        pid
    }

    /// `pid` is absent from the `listings`-th listing onwards.
    pub fn exit_after(&self, pid: u32, listings: u32) {
        self.shared.lock().exiting.push((pid, listings));
    }

    pub fn clear(&self) {
        self.shared.lock().rows.clear();
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.shared.lock().rows.values().any(|n| n == name)
    }
}

impl ProcessTable for FakeProcesses {
    fn listing(&mut self) -> io::Result<String> {
        let mut inner = self.shared.lock();
        let mut gone = Vec::new();
        for (pid, left) in inner.exiting.iter_mut() {
            *left = left.saturating_sub(1);
            if *left == 0 {
                gone.push(*pid);
            }
        }
        inner.exiting.retain(|(_, left)| *left > 0);
        for pid in gone {
            inner.rows.remove(&pid);
        }

        let mut out = String::from("USER PID PPID NAME\n");
        for (pid, name) in &inner.rows {
            out.push_str(&format!("u0_a1 {pid} 1 {name}\n"));
        }
        Ok(out)
    }
}

#[derive(Default)]
struct SignalLog {
    sent: Vec<(u32, StopSignal)>,
    exits: Vec<(StopSignal, u32)>,
}

/// Records signals; processes only exit on signals configured via
/// [`FakeSignals::exit_on`].
#[derive(Clone)]
pub struct FakeSignals {
    processes: FakeProcesses,
    log: Arc<Mutex<SignalLog>>,
}

impl FakeSignals {
    pub fn new(processes: &FakeProcesses) -> Self {
        Self { processes: processes.clone(), log: Arc::default() }
    }

    /// The target exits `listings` process listings after receiving `signal`.
    pub fn exit_on(&mut self, signal: StopSignal, listings: u32) {
        self.log.lock().exits.push((signal, listings));
    }

    pub fn sent(&self) -> Vec<(u32, StopSignal)> {
        self.log.lock().sent.clone()
    }
}

impl SignalSender for FakeSignals {
    fn send(&mut self, pid: u32, signal: StopSignal) -> Result<(), SignalError> {
        let mut log = self.log.lock();
        log.sent.push((pid, signal));
        if let Some((_, listings)) = log.exits.iter().find(|(s, _)| *s == signal) {
            self.processes.exit_after(pid, *listings);
        }
        Ok(())
    }
}

/// Spawning adds a row named after the program path to the process table.
pub struct FakeLauncher {
    processes: FakeProcesses,
    pub fail: bool,
    pub spawned: Arc<Mutex<Vec<(PathBuf, Vec<String>, PathBuf)>>>,
}

impl FakeLauncher {
    pub fn new(processes: &FakeProcesses) -> Self {
        Self { processes: processes.clone(), fail: false, spawned: Arc::default() }
    }
}

impl Launcher for FakeLauncher {
    fn spawn(&mut self, program: &Path, args: &[String], working_dir: &Path) -> io::Result<()> {
        if self.fail {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        self.spawned.lock().push((
            program.to_path_buf(),
            args.to_vec(),
            working_dir.to_path_buf(),
        ));
        self.processes.spawn(&program.to_string_lossy());
        Ok(())
    }
}

// ── Device ────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct FakeDevice {
    pub power: PowerFields,
}

impl DeviceStatusSource for FakeDevice {
    fn snapshot(&mut self, display_on: bool) -> DeviceStatusSnapshot {
        DeviceStatusSnapshot { display_on, user_active: display_on, power: self.power.clone() }
    }
}

// ── Assembled components ──────────────────────────────────────────────────────

/// Worker config rooted in `dir` with an installed, current `worker` binary
/// and an auth token file.
pub fn installed_worker(dir: &Path) -> WorkerConfig {
    let assets = dir.join("assets");
    let client = dir.join("client");
    std::fs::create_dir_all(assets.join(Platform::Arm64.asset_subdir())).unwrap();
    std::fs::create_dir_all(&client).unwrap();
    std::fs::write(assets.join(Platform::Arm64.asset_subdir()).join("worker"), b"worker").unwrap();
    std::fs::write(client.join("worker"), b"worker").unwrap();
    std::fs::write(client.join("gui_rpc_auth.cfg"), "token\n").unwrap();
    WorkerConfig {
        working_dir: client,
        asset_dir: assets,
        binary_name: "worker".to_string(),
        aux_files: Vec::new(),
        ..WorkerConfig::default()
    }
}

pub fn connection(worker: &FakeWorker, config: &WorkerConfig) -> ConnectionManager {
    ConnectionManager::new(worker.channel(), config.socket_path(), config.auth_file_path())
}

/// Setup for [`installed_worker`] with the worker process already running,
/// so a setup run only has to connect.
pub fn ready_setup(config: &WorkerConfig, processes: &FakeProcesses) -> WorkerSetup {
    processes.start(300, &config.binary_path().to_string_lossy());
    let installer = Installer::new(
        config.working_dir.clone(),
        config.asset_dir.clone(),
        &config.binary_name,
        Platform::Arm64,
        Vec::new(),
    );
    let controller = ProcessController::new(
        Box::new(processes.clone()),
        Box::new(FakeSignals::new(processes)),
        Box::new(FakeLauncher::new(processes)),
        ShutdownConfig::default(),
    );
    let host = HostIdentity { model: "test".to_string(), os_version: "1".to_string() };
    WorkerSetup::new(installer, controller, config, SetupConfig::default(), host)
}
