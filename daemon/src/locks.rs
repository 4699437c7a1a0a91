/// Wake and network locks derived from the worker's suspend reason.
///
/// Both locks are re-derived on every tick, so acquiring a held lock or
/// releasing an unheld one must be a no-op. [`ResourceLock`] tracks the held
/// state and only calls its backend on a real transition.
use std::io;
use std::path::PathBuf;

use tracing::{debug, warn};

/// The OS side of a lock.
pub trait LockBackend: Send {
    fn acquire(&mut self) -> io::Result<()>;
    fn release(&mut self) -> io::Result<()>;
}

/// Kernel wake lock via `/sys/power/wake_lock` and `/sys/power/wake_unlock`.
pub struct SysfsWakeLock {
    lock_path: PathBuf,
    unlock_path: PathBuf,
    tag: String,
}

impl SysfsWakeLock {
    pub fn new(lock_path: impl Into<PathBuf>, unlock_path: impl Into<PathBuf>, tag: &str) -> Self {
        Self { lock_path: lock_path.into(), unlock_path: unlock_path.into(), tag: tag.to_string() }
    }
}

impl LockBackend for SysfsWakeLock {
    fn acquire(&mut self) -> io::Result<()> {
        std::fs::write(&self.lock_path, &self.tag)
    }

    fn release(&mut self) -> io::Result<()> {
        std::fs::write(&self.unlock_path, &self.tag)
    }
}

/// A lock with no OS counterpart; only its held state is kept.
pub struct TrackedLock;

impl LockBackend for TrackedLock {
    fn acquire(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn release(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct ResourceLock {
    name: &'static str,
    backend: Box<dyn LockBackend>,
    held: bool,
}

impl ResourceLock {
    pub fn new(name: &'static str, backend: Box<dyn LockBackend>) -> Self {
        Self { name, backend, held: false }
    }

    #[cfg(test)]
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Moves the lock to `held`. A backend failure leaves the recorded state
    /// unchanged so the transition is retried on the next call.
    pub fn set(&mut self, held: bool) {
        if held == self.held {
            return;
        }
        let result = if held { self.backend.acquire() } else { self.backend.release() };
        match result {
            Ok(()) => {
                self.held = held;
                debug!(lock = self.name, held, "lock state changed");
            }
            Err(e) => warn!(lock = self.name, held, "failed to change lock state: {e}"),
        }
    }
}

/// The wake lock and the network (wifi) lock, always moved together.
pub struct PowerLocks {
    wake: ResourceLock,
    network: ResourceLock,
}

impl PowerLocks {
    pub fn new(wake: Box<dyn LockBackend>, network: Box<dyn LockBackend>) -> Self {
        Self {
            wake: ResourceLock::new("wake", wake),
            network: ResourceLock::new("network", network),
        }
    }

    pub fn apply(&mut self, computing: bool) {
        self.network.set(computing);
        self.wake.set(computing);
    }

    pub fn release_all(&mut self) {
        self.apply(false);
    }

    #[cfg(test)]
    pub fn wake_held(&self) -> bool {
        self.wake.is_held()
    }

    #[cfg(test)]
    pub fn network_held(&self) -> bool {
        self.network.is_held()
    }
}
