//! Broker socket lifecycle.
//!
//! The daemon listens on one Unix socket. Privilege is not a property
//! of the socket: every connection's peer credentials are read from
//! the kernel at accept time, and the dispatcher decides per request
//! what the peer may do. The socket is mode 0660 so the owning group
//! controls who may talk to the broker at all.
//!
//! Binding is defensive about the filesystem: the parent directory is
//! created 0700 when missing, symlinked paths are refused outright,
//! and a stale socket file from a previous run is removed only after
//! verifying it actually is a socket.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use super::error::{ProtocolError, ProtocolResult};

/// Default socket filename.
const DEFAULT_SOCKET_NAME: &str = "broker.sock";

/// Default subdirectory under the runtime directory.
const DEFAULT_SUBDIR: &str = "sessiond";

/// Maximum concurrent connections.
const MAX_CONNECTIONS: usize = 64;

/// Socket permissions (owner + group read/write).
const SOCKET_MODE: u32 = 0o660;

/// Directory permissions (owner only).
const DIRECTORY_MODE: u32 = 0o700;

/// Default socket path: `$XDG_RUNTIME_DIR/sessiond/broker.sock`, with
/// `/run/sessiond/broker.sock` as the fallback.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(
        |_| {
            PathBuf::from("/run")
                .join(DEFAULT_SUBDIR)
                .join(DEFAULT_SOCKET_NAME)
        },
        |runtime_dir| {
            PathBuf::from(runtime_dir)
                .join(DEFAULT_SUBDIR)
                .join(DEFAULT_SOCKET_NAME)
        },
    )
}

/// Configuration for the broker socket.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Socket path (mode 0660).
    pub path: PathBuf,

    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: default_socket_path(),
            max_connections: MAX_CONNECTIONS,
        }
    }
}

impl SocketConfig {
    /// Create a config for the given socket path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the maximum concurrent connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

/// Identity of a connected peer, read from the kernel at accept time.
/// Never derived from anything the client asserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Effective uid of the peer process.
    pub uid: u32,
    /// Pid of the peer process.
    pub pid: i32,
}

/// The bound broker socket.
#[derive(Debug)]
pub struct BrokerSocket {
    config: SocketConfig,
    listener: UnixListener,
    permits: Arc<Semaphore>,
}

impl BrokerSocket {
    /// Bind the broker socket.
    ///
    /// Creates the parent directory (0700) when missing, removes a
    /// stale socket file, binds, and sets the socket to mode 0660.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be prepared,
    /// the path is occupied by a non-socket, or binding fails.
    pub fn bind(config: SocketConfig) -> ProtocolResult<Self> {
        if let Some(parent) = config.path.parent() {
            Self::ensure_directory(parent)?;
        }
        Self::cleanup_stale_socket(&config.path)?;

        let listener = UnixListener::bind(&config.path).map_err(|err| {
            ProtocolError::Io(io::Error::new(
                err.kind(),
                format!("failed to bind {}: {err}", config.path.display()),
            ))
        })?;
        Self::set_socket_permissions(&config.path, SOCKET_MODE)?;

        info!(
            path = %config.path.display(),
            max_connections = config.max_connections,
            "broker socket bound"
        );
        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
        })
    }

    /// The bound socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Accept the next connection.
    ///
    /// Waits for a connection permit first, so the concurrency cap
    /// applies backpressure at accept rather than mid-request. The
    /// permit must be held for the connection's lifetime.
    ///
    /// # Errors
    ///
    /// An I/O error from accept, or a credentials error if the peer's
    /// identity cannot be read.
    pub async fn accept(&self) -> ProtocolResult<(UnixStream, OwnedSemaphorePermit, PeerIdentity)> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProtocolError::Io(io::Error::other("connection semaphore closed")))?;

        let (stream, _addr) = self.listener.accept().await?;
        let peer = Self::peer_identity(&stream)?;
        debug!(uid = peer.uid, pid = peer.pid, "connection accepted");
        Ok((stream, permit, peer))
    }

    /// Read the peer's kernel-reported credentials.
    fn peer_identity(stream: &UnixStream) -> ProtocolResult<PeerIdentity> {
        let cred = stream
            .peer_cred()
            .map_err(|err| ProtocolError::credentials(err.to_string()))?;
        let pid = cred
            .pid()
            .ok_or_else(|| ProtocolError::credentials("kernel did not report a peer pid"))?;
        Ok(PeerIdentity {
            uid: cred.uid(),
            pid,
        })
    }

    /// Ensure the socket directory exists.
    ///
    /// Never alters the permissions of a pre-existing directory; 0700
    /// is applied only to directories created here. Symlinks are
    /// refused to keep a planted link from redirecting the bind.
    fn ensure_directory(path: &Path) -> ProtocolResult<()> {
        match std::fs::symlink_metadata(path) {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(ProtocolError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!(
                            "{} is a symlink, refusing to use as socket directory",
                            path.display()
                        ),
                    )));
                }
                if !metadata.is_dir() {
                    return Err(ProtocolError::Io(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} exists but is not a directory", path.display()),
                    )));
                }
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                std::fs::create_dir_all(path).map_err(|err| {
                    ProtocolError::Io(io::Error::new(
                        err.kind(),
                        format!("failed to create {}: {err}", path.display()),
                    ))
                })?;
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(DIRECTORY_MODE))
                    .map_err(|err| {
                        ProtocolError::Io(io::Error::new(
                            err.kind(),
                            format!("failed to set permissions on {}: {err}", path.display()),
                        ))
                    })?;
                Ok(())
            }
            Err(err) => Err(ProtocolError::Io(io::Error::new(
                err.kind(),
                format!("failed to stat {}: {err}", path.display()),
            ))),
        }
    }

    /// Remove a leftover socket file from a previous run.
    fn cleanup_stale_socket(path: &Path) -> ProtocolResult<()> {
        match std::fs::symlink_metadata(path) {
            Ok(metadata) => {
                use std::os::unix::fs::FileTypeExt;
                if !metadata.file_type().is_socket() {
                    return Err(ProtocolError::Io(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} exists but is not a socket", path.display()),
                    )));
                }
                std::fs::remove_file(path).map_err(|err| {
                    ProtocolError::Io(io::Error::new(
                        err.kind(),
                        format!("failed to remove stale socket {}: {err}", path.display()),
                    ))
                })?;
                debug!(path = %path.display(), "removed stale socket file");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ProtocolError::Io(io::Error::new(
                err.kind(),
                format!("failed to stat {}: {err}", path.display()),
            ))),
        }
    }

    fn set_socket_permissions(path: &Path, mode: u32) -> ProtocolResult<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|err| {
            ProtocolError::Io(io::Error::new(
                err.kind(),
                format!("failed to set socket permissions on {}: {err}", path.display()),
            ))
        })
    }
}

impl Drop for BrokerSocket {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.config.path) {
            if err.kind() != io::ErrorKind::NotFound {
                debug!(path = %self.config.path.display(), %err, "socket cleanup failed");
            }
        }
    }
}
