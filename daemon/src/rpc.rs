/// Control channel over the worker's Unix-domain socket.
///
/// Wire format: 4-byte length prefix (big-endian) + JSON payload. Every
/// request frame is answered by exactly one response frame.
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::connection::{ChannelError, ControlChannel};
use crate::device::DeviceStatusSnapshot;
use crate::model::{AcctMgrInfo, CcState, CcStatus, GlobalPreferences, Notice, Transfer};

/// Largest frame accepted from the worker.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Request from supervisor to worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Authenticate { token: String },
    Quit,
    GetStatus,
    GetState,
    GetTransfers,
    GetAcctMgrInfo,
    GetNotices { since_seqno: u64 },
    GetPreferences,
    ReportDeviceStatus { device: DeviceStatusSnapshot },
    SetHostInfo { model: String, os_version: String },
}

/// Response from worker to supervisor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Error { message: String },
    Status { status: CcStatus },
    State { state: CcState },
    Transfers { transfers: Vec<Transfer> },
    AcctMgrInfo { info: AcctMgrInfo },
    Notices { notices: Vec<Notice> },
    Preferences { preferences: GlobalPreferences },
}

/// Writes one length-prefixed frame.
pub async fn write_message<W>(writer: &mut W, payload: &[u8]) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| ChannelError::FrameTooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge(len));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame.
pub async fn read_message<R>(reader: &mut R) -> Result<Vec<u8>, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn exchange<S>(stream: &mut S, request: &Request) -> Result<Response, ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, &serde_json::to_vec(request)?).await?;
    let payload = read_message(stream).await?;
    Ok(serde_json::from_slice(&payload)?)
}

pub struct SocketChannel {
    stream: Option<UnixStream>,
    timeout: Duration,
}

impl SocketChannel {
    pub fn new(timeout: Duration) -> Self {
        Self { stream: None, timeout }
    }

    /// Sends `request` and returns the worker's answer. Transport, codec and
    /// timeout failures drop the stream; a worker-side rejection does not.
    async fn call(&mut self, request: Request) -> Result<Response, ChannelError> {
        let stream = self.stream.as_mut().ok_or(ChannelError::NotConnected)?;
        let result = match tokio::time::timeout(self.timeout, exchange(stream, &request)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout),
        };
        match result {
            Ok(Response::Error { message }) => Err(ChannelError::Rejected(message)),
            Ok(response) => Ok(response),
            Err(e) => {
                warn!("control channel failed, dropping connection: {e}");
                self.stream = None;
                Err(e)
            }
        }
    }

    async fn expect_ok(&mut self, request: Request, what: &'static str) -> Result<(), ChannelError> {
        match self.call(request).await? {
            Response::Ok => Ok(()),
            _ => Err(ChannelError::UnexpectedResponse(what)),
        }
    }
}

impl Default for SocketChannel {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

#[async_trait]
impl ControlChannel for SocketChannel {
    async fn open(&mut self, address: &Path) -> Result<(), ChannelError> {
        self.stream = None;
        let stream = UnixStream::connect(address).await?;
        debug!(address = %address.display(), "control socket connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn authenticate(&mut self, token: &str) -> Result<(), ChannelError> {
        self.expect_ok(Request::Authenticate { token: token.to_string() }, "authenticate").await
    }

    fn is_alive(&self) -> bool {
        self.stream.is_some()
    }

    async fn quit(&mut self) -> Result<(), ChannelError> {
        self.expect_ok(Request::Quit, "quit").await
    }

    async fn get_status(&mut self) -> Result<CcStatus, ChannelError> {
        match self.call(Request::GetStatus).await? {
            Response::Status { status } => Ok(status),
            _ => Err(ChannelError::UnexpectedResponse("get_status")),
        }
    }

    async fn get_state(&mut self) -> Result<CcState, ChannelError> {
        match self.call(Request::GetState).await? {
            Response::State { state } => Ok(state),
            _ => Err(ChannelError::UnexpectedResponse("get_state")),
        }
    }

    async fn get_transfers(&mut self) -> Result<Vec<Transfer>, ChannelError> {
        match self.call(Request::GetTransfers).await? {
            Response::Transfers { transfers } => Ok(transfers),
            _ => Err(ChannelError::UnexpectedResponse("get_transfers")),
        }
    }

    async fn get_acct_mgr_info(&mut self) -> Result<AcctMgrInfo, ChannelError> {
        match self.call(Request::GetAcctMgrInfo).await? {
            Response::AcctMgrInfo { info } => Ok(info),
            _ => Err(ChannelError::UnexpectedResponse("get_acct_mgr_info")),
        }
    }

    async fn get_notices(&mut self, since_seqno: u64) -> Result<Vec<Notice>, ChannelError> {
        match self.call(Request::GetNotices { since_seqno }).await? {
            Response::Notices { notices } => Ok(notices),
            _ => Err(ChannelError::UnexpectedResponse("get_notices")),
        }
    }

    async fn get_preferences(&mut self) -> Result<GlobalPreferences, ChannelError> {
        match self.call(Request::GetPreferences).await? {
            Response::Preferences { preferences } => Ok(preferences),
            _ => Err(ChannelError::UnexpectedResponse("get_preferences")),
        }
    }

    async fn report_device_status(
        &mut self,
        snapshot: &DeviceStatusSnapshot,
    ) -> Result<(), ChannelError> {
        let request = Request::ReportDeviceStatus { device: snapshot.clone() };
        self.expect_ok(request, "report_device_status").await
    }

    async fn set_host_info(&mut self, model: &str, os_version: &str) -> Result<(), ChannelError> {
        let request =
            Request::SetHostInfo { model: model.to_string(), os_version: os_version.to_string() };
        self.expect_ok(request, "set_host_info").await
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}
