//! Control socket server
//!
//! Accepts one newline-terminated JSON [`ControlRequest`] per connection and
//! answers with one [`ControlResponse`] line.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thumbmap_config::{ControlRequest, ControlResponse};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Unix socket listener that removes its socket file when dropped
pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl ControlServer {
    /// Bind at `socket_path`, replacing a stale socket from a previous run.
    pub fn bind(socket_path: &Path) -> Result<Self> {
        if socket_path.exists() {
            tracing::debug!("Removing stale socket file: {}", socket_path.display());
            std::fs::remove_file(socket_path).with_context(|| {
                format!("Failed to remove stale socket file: {}", socket_path.display())
            })?;
        }

        let listener = UnixListener::bind(socket_path).with_context(|| {
            format!("Failed to create control socket at {}", socket_path.display())
        })?;
        tracing::info!("Control socket listening on {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
        })
    }

    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .context("Failed to accept control connection")?;
        tracing::debug!("Accepted control connection");
        Ok(stream)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if !self.socket_path.exists() {
            return;
        }
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => tracing::debug!("Removed control socket: {}", self.socket_path.display()),
            Err(e) => tracing::warn!("Failed to remove control socket on shutdown: {}", e),
        }
    }
}

/// Serve a single request on `stream` using `handler`.
pub async fn handle_connection<F, Fut>(mut stream: UnixStream, handler: F) -> Result<()>
where
    F: FnOnce(ControlRequest) -> Fut,
    Fut: Future<Output = ControlResponse>,
{
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);

    let mut line = String::new();
    let bytes_read = reader
        .read_line(&mut line)
        .await
        .context("Failed to read control request")?;
    if bytes_read == 0 {
        tracing::debug!("Control connection closed without data");
        return Ok(());
    }

    let line = line.trim();
    tracing::debug!("Received control request: {}", line);

    let response = match serde_json::from_str::<ControlRequest>(line) {
        Ok(request) => handler(request).await,
        Err(e) => {
            tracing::warn!("Failed to parse control request: {}", e);
            ControlResponse::Error {
                message: format!("Invalid request: {}", e),
            }
        }
    };

    let mut response_json =
        serde_json::to_string(&response).context("Failed to serialize control response")?;
    response_json.push('\n');
    writer
        .write_all(response_json.as_bytes())
        .await
        .context("Failed to write control response")?;
    writer.flush().await.context("Failed to flush control response")?;
    Ok(())
}
