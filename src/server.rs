//! Client connection server.
//!
//! Clients connect over a Unix socket, send a single handshake line
//! `{"token": ..., "change_id": ...}`, and then receive newline-delimited
//! autoupdate frames until they disconnect or the service stops. Each
//! connection runs its own autoupdate loop on its own thread.

use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::auth::Auther;
use crate::autoupdate::{AutoupdateLoop, Frame, Sink, SinkError};
use crate::core::{ChangeId, Shutdown};
use crate::datastore::Datastore;
use crate::permission::PermissionIndex;
use crate::restrict::Restricter;

/// How long a client may take to send its handshake line.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll granularity of the accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct ClientServer {
    pub datastore: Arc<Datastore>,
    pub restricter: Arc<Restricter>,
    pub perms: Arc<PermissionIndex>,
    pub auther: Arc<dyn Auther>,
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    change_id: Option<ChangeId>,
}

impl ClientServer {
    /// Accept clients until shutdown. Blocks the calling thread.
    pub fn serve(&self, socket_path: &Path, shutdown: &Shutdown) -> Result<(), ServerError> {
        if let Some(dir) = socket_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        // A second instance must not steal the socket of a live one.
        if UnixStream::connect(socket_path).is_ok() {
            return Err(ServerError::AlreadyRunning {
                path: socket_path.to_path_buf(),
            });
        }
        let _ = std::fs::remove_file(socket_path);

        let listener = UnixListener::bind(socket_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600));
        }
        listener.set_nonblocking(true)?;
        tracing::info!("serving autoupdate clients on {:?}", socket_path);

        loop {
            if shutdown.is_triggered() {
                break;
            }
            match listener.accept() {
                Ok((stream, _)) => {
                    let server = self.clone();
                    let shutdown = shutdown.clone();
                    std::thread::spawn(move || {
                        let _ = stream.set_nonblocking(false);
                        server.handle_client(stream, &shutdown);
                    });
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    tracing::error!("accept error: {err}");
                }
            }
        }

        let _ = std::fs::remove_file(socket_path);
        tracing::info!("client server stopped");
        Ok(())
    }

    fn handle_client(&self, stream: UnixStream, shutdown: &Shutdown) {
        let request = match read_handshake(&stream) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!("handshake failed: {err}");
                reject(&stream, &err.to_string());
                return;
            }
        };

        let uid = match self.auther.authenticate(request.token.as_deref()) {
            Ok(uid) => uid,
            Err(err) => {
                reject(&stream, &err.to_string());
                return;
            }
        };
        if !self.perms.snapshot().knows_user(uid) {
            reject(&stream, "unknown user");
            return;
        }

        tracing::info!(uid, change_id = request.change_id, "client connected");
        let sink = SocketSink {
            writer: BufWriter::new(stream),
        };
        let mut autoupdate = AutoupdateLoop::new(
            Arc::clone(&self.datastore),
            Arc::clone(&self.restricter),
            uid,
            request.change_id.unwrap_or(0),
            sink,
        );
        match autoupdate.run(shutdown) {
            Ok(()) => tracing::info!(uid, "client disconnected"),
            Err(err) => tracing::warn!(uid, "autoupdate loop failed: {err}"),
        }
    }
}

fn read_handshake(stream: &UnixStream) -> Result<ConnectRequest, ServerError> {
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Err(ServerError::EmptyHandshake);
    }
    stream.set_read_timeout(None)?;
    serde_json::from_str(line.trim()).map_err(|err| ServerError::BadHandshake {
        reason: err.to_string(),
    })
}

fn reject(stream: &UnixStream, reason: &str) {
    let mut stream = stream;
    let payload = serde_json::json!({"error": reason});
    let _ = writeln!(stream, "{payload}");
}

struct SocketSink {
    writer: BufWriter<UnixStream>,
}

impl Sink for SocketSink {
    fn emit(&mut self, frame: &Frame) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, frame)
            .map_err(|err| SinkError::Io(std::io::Error::other(err)))?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("another instance is already listening on {path:?}")]
    AlreadyRunning { path: PathBuf },
    #[error("client closed before the handshake")]
    EmptyHandshake,
    #[error("malformed handshake: {reason}")]
    BadHandshake { reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
