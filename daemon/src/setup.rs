/// Brings the worker to a usable state: installed, running and connected.
///
/// Runs from the poller whenever the control channel is not alive. Every
/// step that fails ends the attempt without rolling anything back; the next
/// tick starts over.
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{SetupConfig, WorkerConfig};
use crate::connection::ConnectionManager;
use crate::device::HostIdentity;
use crate::installer::Installer;
use crate::process::ProcessController;
use crate::status::{SetupStatus, StatusModel};

pub struct WorkerSetup {
    installer: Installer,
    controller: ProcessController,
    working_dir: PathBuf,
    launch_args: Vec<String>,
    force_reinstall: bool,
    retry: SetupConfig,
    host: HostIdentity,
}

impl WorkerSetup {
    pub fn new(
        installer: Installer,
        controller: ProcessController,
        worker: &WorkerConfig,
        retry: SetupConfig,
        host: HostIdentity,
    ) -> Self {
        Self {
            installer,
            controller,
            working_dir: worker.working_dir.clone(),
            launch_args: worker.launch_args.clone(),
            force_reinstall: worker.force_reinstall,
            retry,
            host,
        }
    }

    /// Runs one setup attempt and records the outcome as the setup status.
    pub async fn run(&mut self, conn: &mut ConnectionManager, model: &StatusModel) -> bool {
        model.set_setup_status(SetupStatus::Launching);
        let ok = self.setup_worker(conn, model).await;
        model.set_setup_status(if ok { SetupStatus::Available } else { SetupStatus::Error });
        ok
    }

    async fn setup_worker(&mut self, conn: &mut ConnectionManager, model: &StatusModel) -> bool {
        let binary = self.installer.binary().installed_path.clone();
        let name = binary.to_string_lossy().into_owned();

        if self.force_reinstall || !self.installer.is_current() {
            info!(path = %binary.display(), force = self.force_reinstall, "reinstalling worker");
            self.controller.terminate(&name, conn).await;
            if !self.installer.ensure_installed(self.force_reinstall) {
                error!("worker installation failed");
                return false;
            }
        }

        match self.controller.find_pid(&name) {
            Some(pid) => debug!(pid, "worker already running"),
            None => {
                if !self.controller.launch(&binary, &self.launch_args, &self.working_dir) {
                    return false;
                }
            }
        }

        let attempts = self.retry.connect_retry_attempts;
        let delay = Duration::from_millis(self.retry.connect_retry_delay_ms);
        if !connect_with_retry(conn, attempts, delay).await {
            error!(attempts, "could not connect to worker");
            return false;
        }

        match conn.channel().get_preferences().await {
            Ok(preferences) => model.set_preferences(preferences),
            Err(e) => {
                error!("failed to read worker preferences: {e}");
                // Without a live channel the next tick runs setup again.
                conn.close().await;
                return false;
            }
        }

        if let Err(e) = conn.channel().set_host_info(&self.host.model, &self.host.os_version).await {
            warn!("failed to send host info: {e}");
        }

        info!("worker available");
        true
    }
}

/// Up to `attempts` independent connects, `delay` apart.
async fn connect_with_retry(conn: &mut ConnectionManager, attempts: u32, delay: Duration) -> bool {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        if conn.connect().await {
            debug!(attempt, "connected to worker");
            return true;
        }
        debug!(attempt, attempts, "connection attempt failed");
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    false
}
