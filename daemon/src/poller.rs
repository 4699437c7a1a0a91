/// The recurring status poll.
///
/// Each tick makes sure the worker is set up, reports device status, reads
/// worker status (fully or minimally depending on the display) and derives
/// the power locks from the task suspend reason. Ticks run one at a time on
/// a single task; forced refreshes are queued on the same task.
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PollingConfig;
use crate::connection::{ChannelError, ConnectionManager};
use crate::device::DeviceStatusSource;
use crate::locks::PowerLocks;
use crate::model::{CcStatus, Notice, WorkerStatusSnapshot};
use crate::setup::WorkerSetup;
use crate::status::StatusModel;

#[derive(Debug, Error)]
pub enum TickError {
    #[error("status read failed: {0}")]
    Status(#[source] ChannelError),
    #[error("incomplete full read, missing: {}", .0.join(", "))]
    PartialRead(Vec<&'static str>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    /// Overall status only.
    Minimal,
    /// Status, state, transfers, account manager and notices, published.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    SetupFailed,
    Read(ReadKind),
}

pub enum PollerCommand {
    ForceRefresh,
    DisplayChanged(bool),
    Reconfigure(PollingConfig),
    Shutdown,
}

/// Decides between full and minimal reads. `skips` stays within
/// `0..=threshold`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cadence {
    screen_on: bool,
    skips: u32,
    threshold: u32,
}

impl Cadence {
    pub fn new(screen_on: bool, threshold: u32) -> Self {
        Self { screen_on, skips: 0, threshold }
    }

    pub fn screen_on(&self) -> bool {
        self.screen_on
    }

    pub fn skips(&self) -> u32 {
        self.skips
    }

    /// Read for the coming tick. While the screen is off every call below
    /// the threshold counts as one skipped full read.
    pub fn next_read(&mut self, force_full: bool) -> ReadKind {
        if force_full || self.screen_on {
            return ReadKind::Full;
        }
        if self.skips < self.threshold {
            self.skips += 1;
            ReadKind::Minimal
        } else {
            ReadKind::Full
        }
    }

    /// A device status report went through on a full-read tick.
    pub fn reported(&mut self, kind: ReadKind) {
        if kind == ReadKind::Full && !self.screen_on {
            self.skips = 0;
        }
    }

    /// Turning the screen off makes the next tick a full read so the worker
    /// learns about it promptly.
    pub fn set_screen(&mut self, on: bool) {
        self.screen_on = on;
        if !on {
            self.skips = self.threshold;
        }
    }

    pub fn set_threshold(&mut self, threshold: u32) {
        self.threshold = threshold;
        self.skips = self.skips.min(threshold);
    }
}

pub struct Poller {
    conn: ConnectionManager,
    setup: WorkerSetup,
    device: Box<dyn DeviceStatusSource>,
    locks: PowerLocks,
    model: StatusModel,
    cadence: Cadence,
    interval: Duration,
    notify_on_notices: bool,
}

impl Poller {
    pub fn new(
        conn: ConnectionManager,
        setup: WorkerSetup,
        device: Box<dyn DeviceStatusSource>,
        locks: PowerLocks,
        model: StatusModel,
        polling: &PollingConfig,
        display_on: bool,
    ) -> Self {
        Self {
            conn,
            setup,
            device,
            locks,
            model,
            cadence: Cadence::new(display_on, polling.screen_off_skip_threshold),
            interval: polling.status_interval(),
            notify_on_notices: polling.notify_on_notices,
        }
    }

    /// Ticks every `status_interval` and on command until told to stop or
    /// the command channel closes, then releases the channel and locks.
    pub async fn run(mut self, mut commands: mpsc::Receiver<PollerCommand>) {
        let mut ticker = interval_at(Instant::now(), self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_tick(false).await,
                command = commands.recv() => match command {
                    Some(PollerCommand::ForceRefresh) => self.run_tick(true).await,
                    Some(PollerCommand::DisplayChanged(on)) => {
                        info!(display_on = on, "display state changed");
                        self.cadence.set_screen(on);
                        if on {
                            self.run_tick(true).await;
                        }
                    }
                    Some(PollerCommand::Reconfigure(polling)) => {
                        let interval = self.reconfigure(&polling);
                        if let Some(period) = interval {
                            ticker = interval_at(Instant::now() + period, period);
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        }
                    }
                    Some(PollerCommand::Shutdown) | None => break,
                },
            }
        }

        self.shutdown().await;
    }

    /// Applies the live-reloadable polling settings. Returns the new tick
    /// period when it changed.
    fn reconfigure(&mut self, polling: &PollingConfig) -> Option<Duration> {
        self.cadence.set_threshold(polling.screen_off_skip_threshold);
        self.notify_on_notices = polling.notify_on_notices;
        let period = polling.status_interval();
        if period == self.interval {
            return None;
        }
        info!(interval_ms = period.as_millis() as u64, "status interval changed");
        self.interval = period;
        Some(period)
    }

    async fn run_tick(&mut self, force_full: bool) {
        match self.tick(force_full).await {
            Ok(outcome) => debug!(?outcome, skips = self.cadence.skips(), "tick done"),
            Err(e) => warn!("tick failed: {e}"),
        }
    }

    pub async fn tick(&mut self, force_full: bool) -> Result<TickOutcome, TickError> {
        let mut force_full = force_full;
        if !self.conn.is_alive() {
            if !self.setup.run(&mut self.conn, &self.model).await {
                return Ok(TickOutcome::SetupFailed);
            }
            force_full = true;
        }

        let snapshot = self.device.snapshot(self.cadence.screen_on());
        let reported = match self.conn.channel().report_device_status(&snapshot).await {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to report device status: {e}");
                false
            }
        };

        let kind = self.cadence.next_read(force_full);
        if reported {
            self.cadence.reported(kind);
        }

        match kind {
            ReadKind::Minimal => {
                let status = self.conn.channel().get_status().await.map_err(TickError::Status)?;
                self.apply_locks(&status);
            }
            ReadKind::Full => self.full_read().await?,
        }
        Ok(TickOutcome::Read(kind))
    }

    async fn full_read(&mut self) -> Result<(), TickError> {
        let since = self.model.latest_notice_seqno();
        let channel = self.conn.channel();
        let status = channel.get_status().await;
        let state = channel.get_state().await;
        let transfers = channel.get_transfers().await;
        let acct_mgr_info = channel.get_acct_mgr_info().await;
        let notices = channel.get_notices(since).await;

        let mut missing = Vec::new();
        let status = member(status, "status", &mut missing);
        let mut state = member(state, "state", &mut missing);
        let host_info = state.as_mut().and_then(|s| s.host_info.take());
        if state.is_some() && host_info.is_none() {
            missing.push("state.host_info");
        }
        let transfers = member(transfers, "transfers", &mut missing);
        let acct_mgr_info = member(acct_mgr_info, "acctMgrInfo", &mut missing);
        let notices = member(notices, "notices", &mut missing);

        // Locks only need the status, not the whole batch.
        if let Some(status) = &status {
            self.apply_locks(status);
        }

        let (status, state, host_info, transfers, acct_mgr_info, new_notices) =
            match (status, state, host_info, transfers, acct_mgr_info, notices) {
                (Some(a), Some(b), Some(c), Some(d), Some(e), Some(f)) => (a, b, c, d, e, f),
                _ => return Err(TickError::PartialRead(missing)),
            };

        let arrived = new_notices.len();
        let held = self.model.worker().map(|w| Arc::clone(&w.notices)).unwrap_or_default();
        let all_notices = append_notices(held, new_notices);

        self.model.publish(WorkerStatusSnapshot {
            status,
            tasks: state.results,
            projects: state.projects,
            transfers,
            host_info,
            acct_mgr_info,
            notices: all_notices,
        });
        if self.notify_on_notices {
            self.model.signal_notices(arrived);
        }
        Ok(())
    }

    fn apply_locks(&mut self, status: &CcStatus) {
        let computing = status.task_suspend_reason.computing_enabled();
        self.locks.apply(computing);
        self.model.set_computing(computing);
    }

    async fn shutdown(&mut self) {
        self.conn.close().await;
        self.locks.release_all();
        info!("poller stopped");
    }
}

/// Notices kept in the published snapshot.
pub const MAX_NOTICES: usize = 256;

/// Appends `arrived` to `held`, keeping the newest [`MAX_NOTICES`]. `held`
/// is returned as is when nothing arrived.
fn append_notices(held: Arc<Vec<Notice>>, arrived: Vec<Notice>) -> Arc<Vec<Notice>> {
    if arrived.is_empty() {
        return held;
    }
    let mut all = Vec::with_capacity((held.len() + arrived.len()).min(MAX_NOTICES));
    let skip = (held.len() + arrived.len()).saturating_sub(MAX_NOTICES);
    all.extend(held.iter().chain(arrived.iter()).skip(skip).cloned());
    Arc::new(all)
}

fn member<T>(
    result: Result<T, ChannelError>,
    name: &'static str,
    missing: &mut Vec<&'static str>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(member = name, "full read member failed: {e}");
            missing.push(name);
            None
        }
    }
}
