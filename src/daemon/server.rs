//! IPC server
//!
//! Unix domain socket endpoint for client-daemon communication. One task per
//! connection; frames are length-prefixed bincode. A `Decrypt` request is
//! answered with a frame per pipeline step until the terminal step.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use super::protocol::{decode_message, encode_message, Request, Response, MAX_MESSAGE_SIZE};
use super::service::JimService;

/// IPC server listening on the config-dir socket.
pub struct IpcServer {
    socket_path: PathBuf,
    service: Arc<JimService>,
}

impl IpcServer {
    pub fn new(socket_path: PathBuf, service: Arc<JimService>) -> Self {
        Self {
            socket_path,
            service,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind and accept until the surrounding task is dropped. Binding
    /// removes a stale socket file first; failures here are startup
    /// failures.
    pub async fn run(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("failed to remove existing socket file")?;
        }

        let listener =
            UnixListener::bind(&self.socket_path).context("failed to bind to Unix socket")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!("IPC server listening on {}", self.socket_path.display());

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("new client connection");
                    let service = self.service.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, service).await {
                            warn!("connection error: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("accept error: {e}");
                }
            }
        }
    }
}

/// Handle a single client connection until it disconnects.
async fn handle_connection(mut stream: UnixStream, service: Arc<JimService>) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("client disconnected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let msg_len = u32::from_le_bytes(len_buf) as usize;
        if msg_len > MAX_MESSAGE_SIZE {
            error!("message too large: {msg_len} bytes");
            let response = Response::error(format!("message too large: {msg_len} bytes"));
            send_response(&mut stream, &response).await?;
            continue;
        }

        let mut payload = vec![0u8; msg_len];
        stream.read_exact(&mut payload).await?;

        let request: Request = match decode_message(&payload) {
            Ok(request) => request,
            Err(e) => {
                error!("failed to decode request: {e}");
                let response = Response::error(format!("failed to decode request: {e}"));
                send_response(&mut stream, &response).await?;
                continue;
            }
        };

        match request {
            Request::Decrypt { password } => {
                let mut steps = service.decrypt_stream(password);
                while let Some(step) = steps.recv().await {
                    send_response(&mut stream, &Response::Step(step)).await?;
                }
            }
            unary => {
                let response = service.handle(unary).await;
                send_response(&mut stream, &response).await?;
            }
        }
    }
}

async fn send_response(stream: &mut UnixStream, response: &Response) -> Result<()> {
    let encoded = encode_message(response)?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}
