mod config;
mod connection;
mod device;
mod display;
mod event;
mod installer;
mod instance;
mod locks;
mod model;
mod paths;
mod poller;
mod process;
mod rpc;
mod setup;
mod status;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::device::{HostIdentity, SysfsDeviceSource};
use crate::event::SupervisorEvent;
use crate::installer::{Installer, Platform};
use crate::instance::InstanceLock;
use crate::locks::{PowerLocks, SysfsWakeLock, TrackedLock};
use crate::poller::{Poller, PollerCommand};
use crate::process::{DetachedLauncher, NixSignals, ProcessController, SysinfoProcessTable};
use crate::rpc::SocketChannel;
use crate::setup::WorkerSetup;
use crate::status::{StatusModel, SupervisorStatus};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ── App data directory ────────────────────────────────────────────────────
    let app_dir = paths::app_data_dir()
        .with_context(|| format!("no data directory, set {}", paths::HOME_ENV))?;
    std::fs::create_dir_all(&app_dir)
        .with_context(|| format!("failed to create data directory {}", app_dir.display()))?;

    // ── Single instance ───────────────────────────────────────────────────────
    // Nothing is installed, launched or signalled before this lock is ours.
    let instance = match InstanceLock::acquire(&paths::lock_file_path(&app_dir)) {
        Ok(lock) => lock,
        Err(e) => {
            error!("{e}, exiting");
            return Err(e.into());
        }
    };

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path(&app_dir);
    let config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        warn!("config error (using defaults): {e:#}");
        Config::default()
    });

    // ── Shared status ─────────────────────────────────────────────────────────
    let status_path = paths::status_file_path(&app_dir);
    let model = StatusModel::new();
    let status_handle = model.handle();
    let status_writer = tokio::spawn(status::write_on_change(model.handle(), status_path.clone()));

    // ── Poller ────────────────────────────────────────────────────────────────
    let display_on = display::initial_display_state(&config.display.backlight_dir);
    let poller = build_poller(&config, model, display_on);
    let (command_tx, command_rx) = mpsc::channel::<PollerCommand>(16);
    let poller_task = tokio::spawn(poller.run(command_rx));

    // ── Background tasks ──────────────────────────────────────────────────────
    let (event_tx, mut event_rx) = mpsc::channel::<SupervisorEvent>(32);
    tokio::spawn(config::watch_config(config_path, config.clone(), event_tx.clone()));
    tokio::spawn(display::run(
        config.display.backlight_dir.clone(),
        Duration::from_millis(config.display.poll_interval_ms),
        display_on,
        event_tx.clone(),
    ));
    spawn_signal_handlers(event_tx).context("failed to install signal handlers")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        dir = %app_dir.display(),
        lock = %instance.path().display(),
        "worker-supervisor started"
    );

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = event_rx.recv().await {
        let command = match evt {
            SupervisorEvent::ConfigReloaded(new_config) => {
                info!("config reloaded");
                PollerCommand::Reconfigure(new_config.polling)
            }
            SupervisorEvent::DisplayChanged(on) => PollerCommand::DisplayChanged(on),
            SupervisorEvent::ForceRefresh => {
                info!("refresh requested");
                PollerCommand::ForceRefresh
            }
            SupervisorEvent::Shutdown => {
                info!("shutting down");
                break;
            }
        };
        if command_tx.send(command).await.is_err() {
            error!("poller stopped unexpectedly");
            break;
        }
    }

    // The in-flight tick finishes first; the worker keeps running.
    let _ = command_tx.send(PollerCommand::Shutdown).await;
    if let Err(e) = poller_task.await {
        error!("poller task failed: {e}");
    }
    if let Err(e) = status_writer.await {
        error!("status writer failed: {e}");
    }
    status::write_status(&status_path, &SupervisorStatus::from_snapshot(&status_handle.snapshot()));
    info!("stopped, worker left running");
    Ok(())
}

fn build_poller(config: &Config, model: StatusModel, display_on: bool) -> Poller {
    let worker = &config.worker;

    let platform = Platform::from_arch(&device::host_arch());
    let installer = Installer::new(
        worker.working_dir.clone(),
        worker.asset_dir.clone(),
        &worker.binary_name,
        platform,
        worker.aux_files.clone(),
    );
    let controller = ProcessController::new(
        Box::new(SysinfoProcessTable::new()),
        Box::new(NixSignals),
        Box::new(DetachedLauncher),
        config.shutdown.clone(),
    );
    let setup = WorkerSetup::new(
        installer,
        controller,
        worker,
        config.setup.clone(),
        HostIdentity::detect(),
    );

    let conn = ConnectionManager::new(
        Box::new(SocketChannel::default()),
        worker.socket_path(),
        worker.auth_file_path(),
    );
    let locks = PowerLocks::new(
        Box::new(SysfsWakeLock::new(
            config.locks.wake_lock_path.clone(),
            config.locks.wake_unlock_path.clone(),
            &config.locks.tag,
        )),
        Box::new(TrackedLock),
    );
    let device =
        SysfsDeviceSource::new(config.device.power_supply_dir.clone(), config.device.net_dir.clone());

    Poller::new(conn, setup, Box::new(device), locks, model, &config.polling, display_on)
}

/// SIGUSR1 forces a status refresh; Ctrl+C and SIGTERM shut down.
fn spawn_signal_handlers(tx: mpsc::Sender<SupervisorEvent>) -> std::io::Result<()> {
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut term = signal(SignalKind::terminate())?;

    {
        let tx = tx.clone();
        tokio::spawn(async move {
            while usr1.recv().await.is_some() {
                if tx.send(SupervisorEvent::ForceRefresh).await.is_err() {
                    break;
                }
            }
        });
    }

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        let _ = tx.send(SupervisorEvent::Shutdown).await;
    });
    Ok(())
}
