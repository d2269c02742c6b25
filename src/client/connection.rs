//! Client connection
//!
//! Unix socket connection to the daemon, speaking the length-prefixed
//! bincode protocol. Unary methods use [`DaemonClient::request`]; the
//! decrypt stream is consumed frame by frame via [`DaemonClient::read_frame`].

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use crate::config::JimPaths;
use crate::daemon::protocol::{
    decode_message, encode_message, Request, Response, MAX_MESSAGE_SIZE,
};

use super::ClientError;

pub struct DaemonClient {
    stream: UnixStream,
}

impl DaemonClient {
    /// Connect to the daemon on the default socket.
    pub async fn connect() -> Result<Self, ClientError> {
        let paths = JimPaths::resolve().map_err(|e| ClientError::Config(e.to_string()))?;
        Self::connect_to(paths.socket()).await
    }

    /// Connect to the daemon at a specific socket path.
    pub async fn connect_to(socket_path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let socket_path: PathBuf = socket_path.as_ref().to_path_buf();
        debug!("connecting to daemon at {}", socket_path.display());

        let stream = UnixStream::connect(&socket_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound
                || e.kind() == std::io::ErrorKind::ConnectionRefused
            {
                ClientError::DaemonNotRunning
            } else {
                ClientError::ConnectionFailed(e.to_string())
            }
        })?;

        Ok(Self { stream })
    }

    /// Send a request and read a single reply frame.
    pub async fn request(&mut self, request: &Request) -> Result<Response, ClientError> {
        self.send(request).await?;
        self.read_frame().await
    }

    /// Send a request without waiting for the reply.
    pub async fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        let encoded = encode_message(request)
            .map_err(|e| ClientError::RequestFailed(format!("failed to encode request: {e}")))?;

        self.stream
            .write_all(&encoded)
            .await
            .map_err(|e| ClientError::RequestFailed(format!("failed to send request: {e}")))?;
        self.stream
            .flush()
            .await
            .map_err(|e| ClientError::RequestFailed(format!("failed to flush: {e}")))?;
        Ok(())
    }

    /// Read one reply frame.
    pub async fn read_frame(&mut self) -> Result<Response, ClientError> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await.map_err(|e| {
            ClientError::RequestFailed(format!("failed to read response length: {e}"))
        })?;

        let msg_len = u32::from_le_bytes(len_buf) as usize;
        if msg_len > MAX_MESSAGE_SIZE {
            return Err(ClientError::RequestFailed(format!(
                "response too large: {msg_len} bytes"
            )));
        }

        let mut payload = vec![0u8; msg_len];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| ClientError::RequestFailed(format!("failed to read response: {e}")))?;

        decode_message(&payload)
            .map_err(|e| ClientError::RequestFailed(format!("failed to decode response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_fails_cleanly_when_daemon_is_absent() {
        let result = DaemonClient::connect_to("/tmp/jim-test-no-such-socket").await;
        assert!(matches!(result, Err(ClientError::DaemonNotRunning)));
    }
}
