use crate::config::Config;

pub enum SupervisorEvent {
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// The display was switched on (`true`) or off (`false`).
    DisplayChanged(bool),
    /// An external client asked for an immediate status refresh (SIGUSR1).
    ForceRefresh,
    /// Ctrl+C or SIGTERM received; stop polling and release held resources.
    Shutdown,
}
