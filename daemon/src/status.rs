use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::model::{GlobalPreferences, SuspendReason, WorkerStatusSnapshot};

const EVENT_CAPACITY: usize = 64;

/// Supervisor readiness as shown to observers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SetupStatus {
    /// Setup has not completed yet (or is being re-run after the channel died).
    Launching,
    /// The worker is installed, running and connected.
    Available,
    /// The last setup attempt failed; the next tick retries.
    Error,
}

/// One consistent view of everything the supervisor knows. Observers get a
/// clone; the worker part is shared and never mutated after publication.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub setup_status: SetupStatus,
    /// Result of the last successful full read.
    pub worker: Option<Arc<WorkerStatusSnapshot>>,
    pub preferences: Option<GlobalPreferences>,
    /// Whether the worker's task suspend reason allows computing.
    pub computing: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            setup_status: SetupStatus::Launching,
            worker: None,
            preferences: None,
            computing: false,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// A full read was published.
    Updated,
    SetupStatusChanged(SetupStatus),
    /// That many notices arrived with the last full read.
    NewNotices(usize),
}

/// Writer side of the shared status. Owned by the poller, the only writer.
///
/// Readers take the watch read lock only long enough to copy a
/// [`StatusSnapshot`], which is a few `Arc` and scalar copies, so a publish
/// never waits on a reader doing real work.
pub struct StatusModel {
    state: watch::Sender<StatusSnapshot>,
    events: broadcast::Sender<StatusEvent>,
}

impl StatusModel {
    pub fn new() -> Self {
        let (state, _) = watch::channel(StatusSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { state, events }
    }

    pub fn handle(&self) -> StatusHandle {
        StatusHandle { state: self.state.subscribe(), events: self.events.subscribe() }
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> StatusSnapshot {
        self.state.borrow().clone()
    }

    /// The last published full read, if any.
    pub fn worker(&self) -> Option<Arc<WorkerStatusSnapshot>> {
        self.state.borrow().worker.clone()
    }

    pub fn latest_notice_seqno(&self) -> u64 {
        self.state.borrow().worker.as_ref().map(|w| w.latest_notice_seqno()).unwrap_or(0)
    }

    /// Replaces the worker snapshot and tells observers.
    pub fn publish(&self, worker: WorkerStatusSnapshot) {
        self.state.send_modify(|s| {
            s.worker = Some(Arc::new(worker));
            s.updated_at = Some(Utc::now());
        });
        self.emit(StatusEvent::Updated);
    }

    pub fn set_setup_status(&self, status: SetupStatus) {
        let changed = self.state.send_if_modified(|s| {
            if s.setup_status == status {
                return false;
            }
            s.setup_status = status;
            true
        });
        if changed {
            debug!(?status, "setup status");
            self.emit(StatusEvent::SetupStatusChanged(status));
        }
    }

    pub fn set_preferences(&self, preferences: GlobalPreferences) {
        self.state.send_modify(|s| s.preferences = Some(preferences));
    }

    pub fn set_computing(&self, computing: bool) {
        self.state.send_if_modified(|s| {
            let changed = s.computing != computing;
            s.computing = computing;
            changed
        });
    }

    pub fn signal_notices(&self, count: usize) {
        if count > 0 {
            self.emit(StatusEvent::NewNotices(count));
        }
    }

    fn emit(&self, event: StatusEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Read-only access to the shared status for observers. Holds no sender, so
/// event streams end once the model is dropped.
pub struct StatusHandle {
    state: watch::Receiver<StatusSnapshot>,
    events: broadcast::Receiver<StatusEvent>,
}

impl Clone for StatusHandle {
    fn clone(&self) -> Self {
        Self { state: self.state.clone(), events: self.events.resubscribe() }
    }
}

impl StatusHandle {
    /// Copies the current snapshot out and releases the read lock at once.
    /// The worker read is shared, not cloned.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.state.borrow().clone()
    }

    /// Events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.resubscribe()
    }
}

/// Runtime summary written to `status.toml` for out-of-process UI clients.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SupervisorStatus {
    /// Supervisor binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub setup_status: SetupStatus,
    pub computing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_suspend_reason: Option<SuspendReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_suspend_reason: Option<SuspendReason>,
    pub tasks: usize,
    pub projects: usize,
    pub transfers: usize,
    pub notices: usize,
    /// RFC 3339 timestamp of the last published full read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
    /// RFC 3339 timestamp of when this file was written.
    pub written_at: String,
}

impl SupervisorStatus {
    pub fn from_snapshot(snapshot: &StatusSnapshot) -> Self {
        let worker = snapshot.worker.as_deref();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            setup_status: snapshot.setup_status,
            computing: snapshot.computing,
            task_suspend_reason: worker.map(|w| w.status.task_suspend_reason),
            network_suspend_reason: worker.map(|w| w.status.network_suspend_reason),
            tasks: worker.map(|w| w.tasks.len()).unwrap_or(0),
            projects: worker.map(|w| w.projects.len()).unwrap_or(0),
            transfers: worker.map(|w| w.transfers.len()).unwrap_or(0),
            notices: worker.map(|w| w.notices.len()).unwrap_or(0),
            last_update: snapshot.updated_at.map(|t| t.to_rfc3339()),
            written_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist. Failures are logged.
pub fn write_status(path: &Path, status: &SupervisorStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(dir = %parent.display(), "failed to create status directory: {e}");
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!(path = %path.display(), "failed to write status file: {e}");
            }
        }
        Err(e) => warn!("failed to serialize status: {e}"),
    }
}

/// Rewrites the status file after every status event until the model is
/// dropped.
pub async fn write_on_change(handle: StatusHandle, path: PathBuf) {
    let mut events = handle.subscribe();
    write_status(&path, &SupervisorStatus::from_snapshot(&handle.snapshot()));
    loop {
        match events.recv().await {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                write_status(&path, &SupervisorStatus::from_snapshot(&handle.snapshot()));
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
