//! Daemon Client - talks to a running daemon over its Unix socket

use crate::error::{DaemonError, Result};
use crate::server::{DaemonRequest, DaemonResponse};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

pub struct DaemonClient {
    socket_path: PathBuf,
    stream: Option<BufReader<UnixStream>>,
}

impl DaemonClient {
    /// Connect to the daemon socket
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let mut client = Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            stream: None,
        };
        client.reconnect().await?;
        Ok(client)
    }

    async fn reconnect(&mut self) -> Result<()> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| {
                DaemonError::Ipc(format!("timed out connecting to {:?}", self.socket_path))
            })?
            .map_err(|e| {
                DaemonError::Ipc(format!("cannot connect to {:?}: {}", self.socket_path, e))
            })?;

        debug!("Connected to daemon at {:?}", self.socket_path);
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Send one request and wait for its response. Reconnects after a
    /// `disconnect`.
    pub async fn send_request(&mut self, request: &DaemonRequest) -> Result<DaemonResponse> {
        if self.stream.is_none() {
            self.reconnect().await?;
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(DaemonError::Ipc("not connected".into()));
        };

        let mut payload = serde_json::to_string(request)?;
        payload.push('\n');
        let sent = stream.get_mut().write_all(payload.as_bytes()).await;
        if let Err(e) = sent {
            self.stream = None;
            return Err(DaemonError::Ipc(e.to_string()));
        }

        let mut line = String::new();
        match stream.read_line(&mut line).await {
            Ok(0) => {
                self.stream = None;
                Err(DaemonError::Ipc("daemon closed the connection".into()))
            }
            Ok(_) => Ok(serde_json::from_str(&line)?),
            Err(e) => {
                self.stream = None;
                Err(DaemonError::Ipc(e.to_string()))
            }
        }
    }

    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!("Disconnected from daemon");
        }
    }
}
