//! IPC endpoint: length-framed JSON over a Unix stream socket.
//!
//! Each frame is a 32-bit big-endian length followed by a JSON payload.
//! Requests carry `{command, params}`, responses `{command, data, error}`.
//! The daemon serves one task per accepted connection; requests on a
//! connection are answered in order, and a response carrying an error closes
//! the connection. The socket is world-writable: the daemon itself is the
//! privilege boundary, the CLI runs unprivileged.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::session::SessionController;
use crate::signal::ShutdownToken;

/// Upper bound on a single frame; anything larger is a protocol violation.
const MAX_FRAME_LEN: u32 = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
}

impl Request {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            params: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub command: String,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl Response {
    pub fn ok(command: &str, data: Value) -> Self {
        Self {
            command: command.to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub fn err(command: &str, message: impl Into<String>) -> Self {
        Self {
            command: command.to_string(),
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame header"),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame length {len} exceeds limit {MAX_FRAME_LEN}");
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .context("failed to read frame payload")?;
    Ok(Some(payload))
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).context("frame too large")?;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame length {len} exceeds limit {MAX_FRAME_LEN}");
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Route a request to the session controller.
pub async fn dispatch(session: &SessionController, request: &Request) -> Response {
    let command = request.command.as_str();
    debug!(command, "dispatching ipc command");

    match command {
        "status" => match serde_json::to_value(session.status().await) {
            Ok(data) => Response::ok(command, data),
            Err(e) => Response::err(command, e.to_string()),
        },
        "start" => match session.start().await {
            Ok(()) => Response::ok(command, serde_json::json!({"status": "started"})),
            Err(e) => Response::err(command, format!("{e:#}")),
        },
        "stop" => match session.stop().await {
            Ok(()) => Response::ok(command, serde_json::json!({"status": "stopped"})),
            Err(e) => Response::err(command, format!("{e:#}")),
        },
        "restart" => match session.restart().await {
            Ok(()) => Response::ok(command, serde_json::json!({"status": "restarted"})),
            Err(e) => Response::err(command, format!("{e:#}")),
        },
        "config" => match serde_json::to_value(session.config()) {
            Ok(data) => Response::ok(command, data),
            Err(e) => Response::err(command, e.to_string()),
        },
        "firewall" => match session.firewall_status().await {
            Ok(status) => match serde_json::to_value(status) {
                Ok(data) => Response::ok(command, data),
                Err(e) => Response::err(command, e.to_string()),
            },
            Err(e) => Response::err(command, format!("{e:#}")),
        },
        "processes" => match serde_json::to_value(session.worker_status().await) {
            Ok(data) => Response::ok(command, data),
            Err(e) => Response::err(command, e.to_string()),
        },
        other => Response::err(other, format!("unknown command: {other}")),
    }
}

/// The daemon-side endpoint.
pub struct IpcServer {
    socket_path: PathBuf,
    session: Arc<SessionController>,
    shutdown: ShutdownToken,
}

impl IpcServer {
    pub fn new(
        socket_path: PathBuf,
        session: Arc<SessionController>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            socket_path,
            session,
            shutdown,
        }
    }

    /// Bind and serve until the shutdown token fires. The socket file is
    /// pre-removed on bind and removed again on exit.
    pub async fn run(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("failed to bind socket: {}", self.socket_path.display()))?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o666))
            .with_context(|| "failed to set socket permissions")?;

        info!(socket = %self.socket_path.display(), "ipc server listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let session = self.session.clone();
                            let shutdown = self.shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, session, shutdown).await {
                                    debug!(error = %e, "connection closed with error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "failed to accept connection"),
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        info!("ipc server stopped");
        Ok(())
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    session: Arc<SessionController>,
    shutdown: ShutdownToken,
) -> Result<()> {
    loop {
        let payload = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = read_frame(&mut stream) => match frame? {
                Some(payload) => payload,
                None => return Ok(()),
            },
        };

        let response = match serde_json::from_slice::<Request>(&payload) {
            Ok(request) => dispatch(&session, &request).await,
            Err(e) => Response::err("", format!("malformed request: {e}")),
        };

        let encoded = serde_json::to_vec(&response)?;
        write_frame(&mut stream, &encoded).await?;

        if !response.is_ok() {
            return Ok(());
        }
    }
}

/// Client side of the protocol, used by the CLI.
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// One request/response round-trip on a fresh connection.
    pub async fn call(&self, request: &Request) -> Result<Response> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!(
                    "failed to connect to daemon at {} (is zapretd running?)",
                    self.socket_path.display()
                )
            })?;

        let encoded = serde_json::to_vec(request)?;
        write_frame(&mut stream, &encoded).await?;

        let payload = read_frame(&mut stream)
            .await?
            .context("daemon closed the connection without responding")?;
        let response: Response =
            serde_json::from_slice(&payload).context("failed to decode daemon response")?;
        Ok(response)
    }
}
