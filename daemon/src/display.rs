use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

use crate::event::SupervisorEvent;

/// `bl_power` value of an unblanked backlight.
const BL_POWER_ON: &str = "0";

/// Shortest backlight polling interval.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reads the display state from the backlight class directory. The display
/// counts as on when any backlight device is unblanked. `None` when no
/// device reports a power state.
pub fn read_display_state(backlight_dir: &Path) -> Option<bool> {
    let entries = std::fs::read_dir(backlight_dir).ok()?;
    let mut seen = false;
    for entry in entries.flatten() {
        let Ok(value) = std::fs::read_to_string(entry.path().join("bl_power")) else {
            continue;
        };
        seen = true;
        if value.trim() == BL_POWER_ON {
            return Some(true);
        }
    }
    seen.then_some(false)
}

/// Display state at start-up. Machines without a backlight are treated as
/// having the display on.
pub fn initial_display_state(backlight_dir: &Path) -> bool {
    read_display_state(backlight_dir).unwrap_or(true)
}

/// Polls the backlight every `poll_interval` and emits
/// [`SupervisorEvent::DisplayChanged`] whenever the display is switched on
/// or off. Stops when the receiver goes away. `poll_interval` is clamped to
/// at least [`MIN_POLL_INTERVAL`].
pub async fn run(
    backlight_dir: PathBuf,
    poll_interval: Duration,
    mut display_on: bool,
    tx: mpsc::Sender<SupervisorEvent>,
) {
    let mut ticker = interval(poll_interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(now_on) = read_display_state(&backlight_dir) else {
            continue;
        };
        if now_on == display_on {
            continue;
        }

        info!(display_on = now_on, "display switched");
        display_on = now_on;
        if tx.send(SupervisorEvent::DisplayChanged(now_on)).await.is_err() {
            debug!("event channel closed, stopping display monitor");
            break;
        }
    }
}
