/// Control-channel connection to the worker.
///
/// [`ConnectionManager`] opens the channel and authenticates with the token
/// the worker writes into its working directory. It never retries on its
/// own: setup decides how often to call [`ConnectionManager::connect`].
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error};

use crate::device::DeviceStatusSnapshot;
use crate::model::{AcctMgrInfo, CcState, CcStatus, GlobalPreferences, Notice, Transfer};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("control channel is not connected")]
    NotConnected,
    #[error("control channel I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed control channel message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("control channel frame of {0} bytes exceeds limit")]
    FrameTooLarge(u32),
    #[error("control channel request timed out")]
    Timeout,
    #[error("worker rejected request: {0}")]
    Rejected(String),
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}

/// Requests the supervisor sends to the worker.
#[async_trait]
pub trait ControlChannel: Send {
    async fn open(&mut self, address: &Path) -> Result<(), ChannelError>;
    async fn authenticate(&mut self, token: &str) -> Result<(), ChannelError>;
    /// Cheap and side-effect free.
    fn is_alive(&self) -> bool;
    async fn quit(&mut self) -> Result<(), ChannelError>;
    async fn get_status(&mut self) -> Result<CcStatus, ChannelError>;
    async fn get_state(&mut self) -> Result<CcState, ChannelError>;
    async fn get_transfers(&mut self) -> Result<Vec<Transfer>, ChannelError>;
    async fn get_acct_mgr_info(&mut self) -> Result<AcctMgrInfo, ChannelError>;
    /// Notices with a sequence number greater than `since_seqno`.
    async fn get_notices(&mut self, since_seqno: u64) -> Result<Vec<Notice>, ChannelError>;
    async fn get_preferences(&mut self) -> Result<GlobalPreferences, ChannelError>;
    async fn report_device_status(
        &mut self,
        snapshot: &DeviceStatusSnapshot,
    ) -> Result<(), ChannelError>;
    async fn set_host_info(&mut self, model: &str, os_version: &str) -> Result<(), ChannelError>;
    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
}

pub struct ConnectionManager {
    channel: Box<dyn ControlChannel>,
    address: PathBuf,
    auth_token_path: PathBuf,
    state: ConnectionState,
}

impl ConnectionManager {
    pub fn new(channel: Box<dyn ControlChannel>, address: PathBuf, auth_token_path: PathBuf) -> Self {
        Self { channel, address, auth_token_path, state: ConnectionState::Disconnected }
    }

    /// Opens the channel and authenticates. True only if both succeed.
    pub async fn connect(&mut self) -> bool {
        self.state = ConnectionState::Connecting;
        debug!(address = %self.address.display(), "connecting to worker");

        if let Err(e) = self.channel.open(&self.address).await {
            error!(address = %self.address.display(), "connection failed: {e}");
            self.state = ConnectionState::Disconnected;
            return false;
        }

        let token = match tokio::fs::read_to_string(&self.auth_token_path).await {
            Ok(token) => token.trim().to_string(),
            Err(e) => {
                error!(path = %self.auth_token_path.display(), "failed to read auth token: {e}");
                self.disconnect().await;
                return false;
            }
        };

        if let Err(e) = self.channel.authenticate(&token).await {
            error!("authorization failed: {e}");
            self.disconnect().await;
            return false;
        }

        self.state = ConnectionState::Authenticated;
        true
    }

    /// Whether the channel can be used right now. Decides whether a tick
    /// needs to run setup first.
    pub fn is_alive(&self) -> bool {
        self.state == ConnectionState::Authenticated && self.channel.is_alive()
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        match self.state {
            ConnectionState::Authenticated if !self.channel.is_alive() => {
                ConnectionState::Disconnected
            }
            state => state,
        }
    }

    pub fn channel(&mut self) -> &mut dyn ControlChannel {
        self.channel.as_mut()
    }

    pub async fn close(&mut self) {
        self.disconnect().await;
    }

    async fn disconnect(&mut self) {
        self.channel.close().await;
        self.state = ConnectionState::Disconnected;
    }
}
