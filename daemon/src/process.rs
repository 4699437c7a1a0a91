/// Process discovery, launch and escalating termination of the worker.
///
/// Processes are found by exact token match in a process-table listing, so a
/// resolved pid is only a point-in-time observation: every caller re-resolves
/// before signaling.
use std::fmt::Write as _;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::ShutdownConfig;
use crate::connection::ConnectionManager;

/// Returns the process-table listing: a header row naming a `PID` column,
/// then one row per process.
pub trait ProcessTable: Send {
    fn listing(&mut self) -> io::Result<String>;

    /// Pid of the first process named `name`, by exact token match in
    /// [`listing`](Self::listing).
    fn find(&mut self, name: &str) -> io::Result<Option<u32>> {
        Ok(find_pid_in_listing(&self.listing()?, name))
    }
}

/// Renders the sysinfo process table as `PID NAME EXE` rows. Lookups match
/// the executable path or process name directly, so paths with spaces
/// resolve.
pub struct SysinfoProcessTable {
    sys: System,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl SysinfoProcessTable {
    fn refresh(&mut self) {
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet),
        );
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn listing(&mut self) -> io::Result<String> {
        self.refresh();

        let mut out = String::from("PID NAME EXE\n");
        for (pid, process) in self.sys.processes() {
            let exe = process
                .exe()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(out, "{} {} {}", pid, process.name().to_string_lossy(), exe);
        }
        Ok(out)
    }

    fn find(&mut self, name: &str) -> io::Result<Option<u32>> {
        self.refresh();

        let path = Path::new(name);
        let mut matches: Vec<u32> = self
            .sys
            .processes()
            .iter()
            .filter(|(_, p)| p.exe() == Some(path) || p.name() == name)
            .map(|(pid, _)| pid.as_u32())
            .collect();
        matches.sort_unstable();
        Ok(matches.first().copied())
    }
}

/// Finds the pid of the first row containing a token exactly equal to
/// `name`. `None` when the listing has no data rows, no `PID` header
/// column, no matching row, or an unparsable pid in the matching row.
pub fn find_pid_in_listing(listing: &str, name: &str) -> Option<u32> {
    let lines: Vec<&str> = listing.split('\n').collect();
    if lines.len() < 2 {
        warn!("process listing has fewer than 2 lines");
        return None;
    }

    let pid_index = lines[0].split_whitespace().position(|token| token == "PID")?;

    for row in &lines[1..] {
        let tokens: Vec<&str> = row.split_whitespace().collect();
        if !tokens.iter().any(|token| *token == name) {
            continue;
        }
        return match tokens.get(pid_index).map(|t| t.parse::<u32>()) {
            Some(Ok(pid)) => Some(pid),
            _ => {
                warn!(row = *row, pid_index, "matching process row has no valid pid");
                None
            }
        };
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGQUIT: lets the worker stop its tasks cleanly.
    Quit,
    /// SIGKILL.
    Kill,
}

impl From<StopSignal> for Signal {
    fn from(signal: StopSignal) -> Self {
        match signal {
            StopSignal::Quit => Signal::SIGQUIT,
            StopSignal::Kill => Signal::SIGKILL,
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to send {signal:?} to pid {pid}: {source}")]
pub struct SignalError {
    pub pid: u32,
    pub signal: StopSignal,
    pub source: nix::errno::Errno,
}

pub trait SignalSender: Send {
    fn send(&mut self, pid: u32, signal: StopSignal) -> Result<(), SignalError>;
}

pub struct NixSignals;

impl SignalSender for NixSignals {
    fn send(&mut self, pid: u32, stop: StopSignal) -> Result<(), SignalError> {
        let raw = i32::try_from(pid).map_err(|_| SignalError {
            pid,
            signal: stop,
            source: nix::errno::Errno::ESRCH,
        })?;
        signal::kill(Pid::from_raw(raw), Signal::from(stop))
            .map_err(|source| SignalError { pid, signal: stop, source })
    }
}

pub trait Launcher: Send {
    fn spawn(&mut self, program: &Path, args: &[String], working_dir: &Path) -> io::Result<()>;
}

/// Spawns the worker in its own process group with no stdio attached, so it
/// outlives the supervisor and is not hit by signals sent to the
/// supervisor's group.
pub struct DetachedLauncher;

impl Launcher for DetachedLauncher {
    fn spawn(&mut self, program: &Path, args: &[String], working_dir: &Path) -> io::Result<()> {
        let child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;
        debug!(pid = ?child.id(), "spawned worker");
        Ok(())
    }
}

/// Lifecycle of the supervised worker as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotRunning,
    Starting,
    Running,
    GracefulStop,
    ForcedStop,
}

/// How a call to [`ProcessController::terminate`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No process was running.
    NotRunning,
    /// Exited after the control-channel quit.
    Graceful,
    /// Exited after SIGQUIT.
    Quit,
    /// Exited after SIGKILL.
    Killed,
    /// Still resolvable after SIGKILL.
    Survived { pid: u32 },
}

pub struct ProcessController {
    table: Box<dyn ProcessTable>,
    signals: Box<dyn SignalSender>,
    launcher: Box<dyn Launcher>,
    budgets: ShutdownConfig,
    state: WorkerState,
}

impl ProcessController {
    pub fn new(
        table: Box<dyn ProcessTable>,
        signals: Box<dyn SignalSender>,
        launcher: Box<dyn Launcher>,
        budgets: ShutdownConfig,
    ) -> Self {
        Self { table, signals, launcher, budgets, state: WorkerState::NotRunning }
    }

    #[cfg(test)]
    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "worker state");
            self.state = state;
        }
    }

    /// Resolves the pid of the process named `name`.
    pub fn find_pid(&mut self, name: &str) -> Option<u32> {
        let pid = match self.table.find(name) {
            Ok(pid) => pid,
            Err(e) => {
                warn!("failed to list processes: {e}");
                return None;
            }
        };
        match pid {
            Some(pid) => {
                debug!(name, pid, "resolved worker pid");
                if matches!(self.state, WorkerState::Starting | WorkerState::NotRunning) {
                    self.set_state(WorkerState::Running);
                }
            }
            None => {
                debug!(name, "process not found");
                if self.state == WorkerState::Running {
                    self.set_state(WorkerState::NotRunning);
                }
            }
        }
        pid
    }

    /// Starts the worker. False when the process could not be spawned.
    pub fn launch(&mut self, path: &Path, args: &[String], working_dir: &Path) -> bool {
        info!(path = %path.display(), dir = %working_dir.display(), "launching worker");
        match self.launcher.spawn(path, args, working_dir) {
            Ok(()) => {
                self.set_state(WorkerState::Starting);
                true
            }
            Err(e) => {
                error!(path = %path.display(), "failed to start worker: {e}");
                self.set_state(WorkerState::NotRunning);
                false
            }
        }
    }

    /// Stops the process named `name`: a control-channel quit first, then
    /// SIGQUIT, then SIGKILL. Never fails; a survivor is only logged.
    pub async fn terminate(&mut self, name: &str, conn: &mut ConnectionManager) -> StopOutcome {
        if self.find_pid(name).is_none() {
            debug!(name, "nothing to terminate");
            self.set_state(WorkerState::NotRunning);
            return StopOutcome::NotRunning;
        }

        // Phase 1: ask the worker to quit over the control channel.
        self.set_state(WorkerState::GracefulStop);
        if conn.connect().await {
            let quit = conn.channel().quit().await;
            conn.close().await;
            match quit {
                Ok(()) => {
                    let attempts = self.budgets.graceful_check_attempts;
                    let rate = Duration::from_millis(self.budgets.graceful_check_rate_ms);
                    if let Some(checks) = self.wait_for_exit(name, attempts, rate).await {
                        info!(name, checks, "worker quit via control channel");
                        self.set_state(WorkerState::NotRunning);
                        return StopOutcome::Graceful;
                    }
                }
                Err(e) => warn!("quit request failed: {e}"),
            }
        } else {
            debug!("control channel unavailable, skipping graceful quit");
        }

        // Phase 2: OS signals.
        let pid = match self.find_pid(name) {
            Some(pid) => pid,
            None => {
                self.set_state(WorkerState::NotRunning);
                return StopOutcome::Graceful;
            }
        };
        self.set_state(WorkerState::ForcedStop);
        let attempts = self.budgets.os_check_attempts;
        let rate = Duration::from_millis(self.budgets.os_check_rate_ms);

        // SIGQUIT first: killing outright leaves the worker's science apps
        // running and they get respawned.
        self.send_signal(pid, StopSignal::Quit);
        if let Some(checks) = self.wait_for_exit(name, attempts, rate).await {
            info!(name, pid, checks, "worker quit after SIGQUIT");
            self.set_state(WorkerState::NotRunning);
            return StopOutcome::Quit;
        }

        let Some(pid) = self.find_pid(name) else {
            info!(name, "worker quit after SIGQUIT");
            self.set_state(WorkerState::NotRunning);
            return StopOutcome::Quit;
        };
        warn!(name, pid, "SIGQUIT failed, sending SIGKILL");
        self.send_signal(pid, StopSignal::Kill);
        if self.wait_for_exit(name, attempts, rate).await.is_none() {
            if let Some(pid) = self.find_pid(name) {
                error!(name, pid, "SIGKILL failed, worker still running");
                self.set_state(WorkerState::Running);
                return StopOutcome::Survived { pid };
            }
        }
        self.set_state(WorkerState::NotRunning);
        StopOutcome::Killed
    }

    fn send_signal(&mut self, pid: u32, signal: StopSignal) {
        if let Err(e) = self.signals.send(pid, signal) {
            warn!("{e}");
        }
    }

    /// Polls until `name` is gone. Returns the number of checks it took, or
    /// `None` when the budget ran out.
    async fn wait_for_exit(&mut self, name: &str, attempts: u32, rate: Duration) -> Option<u32> {
        for check in 1..=attempts {
            tokio::time::sleep(rate).await;
            if self.find_pid(name).is_none() {
                return Some(check);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLauncher, FakeProcesses, FakeSignals, FakeWorker};
    use std::path::PathBuf;

    const WORKER: &str = "/data/client/worker";

    fn budgets() -> ShutdownConfig {
        ShutdownConfig {
            graceful_check_attempts: 3,
            graceful_check_rate_ms: 100,
            os_check_attempts: 4,
            os_check_rate_ms: 100,
        }
    }

    fn controller(processes: &FakeProcesses, signals: &FakeSignals) -> ProcessController {
        ProcessController::new(
            Box::new(processes.clone()),
            Box::new(signals.clone()),
            Box::new(FakeLauncher::new(processes)),
            budgets(),
        )
    }

    fn connection(worker: &FakeWorker, dir: &tempfile::TempDir) -> ConnectionManager {
        let token = dir.path().join("auth");
        std::fs::write(&token, "secret").unwrap();
        ConnectionManager::new(worker.channel(), PathBuf::from("sock"), token)
    }

    // ── find_pid_in_listing ───────────────────────────────────────────────────

    #[test]
    fn listing_with_fewer_than_two_lines_has_no_pid() {
        assert_eq!(find_pid_in_listing("", "worker"), None);
        assert_eq!(find_pid_in_listing("PID NAME", "worker"), None);
    }

    #[test]
    fn listing_without_pid_header_has_no_pid() {
        let listing = "USER PROC NAME\nroot 12 worker\n";
        assert_eq!(find_pid_in_listing(listing, "worker"), None);
    }

    #[test]
    fn pid_column_is_located_by_header() {
        let listing = "USER     PID   PPID  NAME\n\
                       root     1     0     init\n\
                       u0_a12   4242  1     /data/client/worker\n";
        assert_eq!(find_pid_in_listing(listing, "/data/client/worker"), Some(4242));
        assert_eq!(find_pid_in_listing(listing, "init"), Some(1));
    }

    #[test]
    fn header_token_must_match_exactly() {
        let listing = "PPID NAME\n7 worker\n";
        assert_eq!(find_pid_in_listing(listing, "worker"), None);
    }

    #[test]
    fn substring_of_a_token_does_not_match() {
        let listing = "PID NAME\n10 foobar\n11 barfoo\n";
        assert_eq!(find_pid_in_listing(listing, "foo"), None);
    }

    #[test]
    fn first_matching_row_wins() {
        let listing = "PID NAME\n10 other\n20 foo\n30 foo\n";
        assert_eq!(find_pid_in_listing(listing, "foo"), Some(20));
    }

    #[test]
    fn unparsable_pid_in_matching_row_yields_none() {
        let listing = "PID NAME\nabc foo\n30 foo\n";
        assert_eq!(find_pid_in_listing(listing, "foo"), None);
    }

    #[test]
    fn sysinfo_listing_has_pid_header_and_finds_self() {
        let mut table = SysinfoProcessTable::new();
        let listing = table.listing().unwrap();
        assert!(listing.starts_with("PID "));
        let own = std::process::id();
        assert!(listing.lines().any(|l| l.split_whitespace().next() == Some(&own.to_string())));
    }

    #[test]
    fn sysinfo_table_finds_worker_under_path_with_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let client = dir.path().join("my client");
        std::fs::create_dir_all(&client).unwrap();
        let binary = client.join("worker");
        std::fs::copy("/bin/sleep", &binary).unwrap();

        // A concurrent fork elsewhere in the test binary can still hold the
        // copy open for writing.
        let mut child = None;
        for _ in 0..50 {
            match std::process::Command::new(&binary).arg("30").spawn() {
                Ok(c) => {
                    child = Some(c);
                    break;
                }
                Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32) => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => panic!("spawn failed: {e}"),
            }
        }
        let mut child = child.expect("worker copy never became executable");

        let mut table = SysinfoProcessTable::new();
        let found = table.find(&binary.to_string_lossy()).unwrap();
        child.kill().unwrap();
        child.wait().unwrap();

        assert_eq!(found, Some(child.id()));
    }

    #[test]
    fn listing_lookup_is_the_default_find() {
        let processes = FakeProcesses::new();
        processes.start(42, WORKER);
        let mut table = processes.clone();
        assert_eq!(table.find(WORKER).unwrap(), Some(42));
        assert_eq!(table.find("/data/client").unwrap(), None);
    }

    // ── launch ────────────────────────────────────────────────────────────────

    #[test]
    fn launch_reports_spawn_failure() {
        let processes = FakeProcesses::new();
        let signals = FakeSignals::new(&processes);
        let mut launcher = FakeLauncher::new(&processes);
        launcher.fail = true;
        let mut ctl = ProcessController::new(
            Box::new(processes.clone()),
            Box::new(signals),
            Box::new(launcher),
            budgets(),
        );

        assert!(!ctl.launch(Path::new(WORKER), &[], Path::new("/data/client")));
        assert_eq!(ctl.state(), WorkerState::NotRunning);
    }

    #[test]
    fn launch_then_resolved_pid_means_running() {
        let processes = FakeProcesses::new();
        let signals = FakeSignals::new(&processes);
        let mut ctl = controller(&processes, &signals);

        let args = vec!["--daemon".to_string()];
        assert!(ctl.launch(Path::new(WORKER), &args, Path::new("/data/client")));
        assert_eq!(ctl.state(), WorkerState::Starting);
        assert!(ctl.find_pid(WORKER).is_some());
        assert_eq!(ctl.state(), WorkerState::Running);
    }

    // ── terminate ─────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn terminate_without_process_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let processes = FakeProcesses::new();
        let signals = FakeSignals::new(&processes);
        let worker = FakeWorker::new();
        let mut conn = connection(&worker, &dir);
        let mut ctl = controller(&processes, &signals);

        assert_eq!(ctl.terminate(WORKER, &mut conn).await, StopOutcome::NotRunning);
        assert!(signals.sent().is_empty());
        assert!(!worker.state().calls.contains(&"open"));
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_quit_avoids_signals() {
        let dir = tempfile::tempdir().unwrap();
        let processes = FakeProcesses::new();
        processes.start(77, WORKER);
        let signals = FakeSignals::new(&processes);
        let worker = FakeWorker::new().exits_on_quit(&processes);
        let mut conn = connection(&worker, &dir);
        let mut ctl = controller(&processes, &signals);

        assert_eq!(ctl.terminate(WORKER, &mut conn).await, StopOutcome::Graceful);
        assert!(worker.state().calls.contains(&"quit"));
        assert!(signals.sent().is_empty());
        assert!(!conn.is_alive());
        assert_eq!(ctl.state(), WorkerState::NotRunning);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_channel_escalates_to_sigquit() {
        let dir = tempfile::tempdir().unwrap();
        let processes = FakeProcesses::new();
        processes.start(77, WORKER);
        let mut signals = FakeSignals::new(&processes);
        signals.exit_on(StopSignal::Quit, 2);
        let worker = FakeWorker::new();
        worker.state().reachable = false;
        let mut conn = connection(&worker, &dir);
        let mut ctl = controller(&processes, &signals);

        assert_eq!(ctl.terminate(WORKER, &mut conn).await, StopOutcome::Quit);
        assert!(!worker.state().calls.contains(&"quit"));
        assert_eq!(signals.sent(), vec![(77, StopSignal::Quit)]);
    }

    #[tokio::test(start_paused = true)]
    async fn exit_just_after_sigquit_budget_is_not_a_kill() {
        let dir = tempfile::tempdir().unwrap();
        let processes = FakeProcesses::new();
        processes.start(77, WORKER);
        let mut signals = FakeSignals::new(&processes);
        // Gone on the re-check that follows the four budgeted checks.
        signals.exit_on(StopSignal::Quit, 5);
        let worker = FakeWorker::new();
        worker.state().reachable = false;
        let mut conn = connection(&worker, &dir);
        let mut ctl = controller(&processes, &signals);

        assert_eq!(ctl.terminate(WORKER, &mut conn).await, StopOutcome::Quit);
        assert_eq!(signals.sent(), vec![(77, StopSignal::Quit)]);
        assert_eq!(ctl.state(), WorkerState::NotRunning);
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_worker_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let processes = FakeProcesses::new();
        processes.start(77, WORKER);
        let mut signals = FakeSignals::new(&processes);
        signals.exit_on(StopSignal::Kill, 1);
        let worker = FakeWorker::new();
        worker.state().reachable = false;
        let mut conn = connection(&worker, &dir);
        let mut ctl = controller(&processes, &signals);

        assert_eq!(ctl.terminate(WORKER, &mut conn).await, StopOutcome::Killed);
        assert_eq!(signals.sent(), vec![(77, StopSignal::Quit), (77, StopSignal::Kill)]);
    }

    #[tokio::test(start_paused = true)]
    async fn survivor_of_sigkill_is_logged_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let processes = FakeProcesses::new();
        processes.start(77, WORKER);
        let signals = FakeSignals::new(&processes);
        let worker = FakeWorker::new();
        worker.state().reachable = false;
        let mut conn = connection(&worker, &dir);
        let mut ctl = controller(&processes, &signals);

        let started = tokio::time::Instant::now();
        let outcome = ctl.terminate(WORKER, &mut conn).await;

        assert_eq!(outcome, StopOutcome::Survived { pid: 77 });
        assert_eq!(signals.sent(), vec![(77, StopSignal::Quit), (77, StopSignal::Kill)]);
        // Two full OS poll budgets: 2 x 4 checks x 100ms.
        assert_eq!(started.elapsed(), Duration::from_millis(800));
        assert_eq!(ctl.state(), WorkerState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn quit_without_exit_falls_through_to_signals() {
        let dir = tempfile::tempdir().unwrap();
        let processes = FakeProcesses::new();
        processes.start(77, WORKER);
        let mut signals = FakeSignals::new(&processes);
        signals.exit_on(StopSignal::Quit, 1);
        let worker = FakeWorker::new();
        let mut conn = connection(&worker, &dir);
        let mut ctl = controller(&processes, &signals);

        assert_eq!(ctl.terminate(WORKER, &mut conn).await, StopOutcome::Quit);
        assert!(worker.state().calls.contains(&"quit"));
        assert_eq!(signals.sent(), vec![(77, StopSignal::Quit)]);
    }
}
