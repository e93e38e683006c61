//! Listening endpoint: a unix socket path or a tcp host:port

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::error::{PluginError, Result, TransportError};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Unix,
    Tcp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Unix => f.write_str("unix"),
            Network::Tcp => f.write_str("tcp"),
        }
    }
}

impl FromStr for Network {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "unix" => Ok(Network::Unix),
            "tcp" => Ok(Network::Tcp),
            other => Err(PluginError::Startup(format!(
                "unsupported network '{other}' (expected unix or tcp)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub network: Network,
    pub address: String,
}

impl Endpoint {
    pub fn new(network: Network, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
        }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Self::new(Network::Unix, path)
    }

    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::new(Network::Tcp, addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.network, self.address)
    }
}

/// Byte stream carrying one host connection
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Bound listening socket. A unix socket file is removed when the listener
/// is dropped.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint.network {
            Network::Tcp => {
                let listener = TcpListener::bind(&endpoint.address).await.map_err(|e| {
                    PluginError::Startup(format!("failed to listen on {endpoint}: {e}"))
                })?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            Network::Unix => {
                let path = PathBuf::from(&endpoint.address);
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }

                clear_stale_socket(&path, endpoint).await?;

                let listener = UnixListener::bind(&path).map_err(|e| {
                    PluginError::Startup(format!("failed to listen on {endpoint}: {e}"))
                })?;
                Ok(Listener::Unix { listener, path })
            }
            #[cfg(not(unix))]
            Network::Unix => Err(PluginError::Startup(
                "unix sockets are not supported on this platform".to_string(),
            )),
        }
    }

    pub async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), path.display().to_string()))
            }
        }
    }

    /// The bound address; resolves port 0 for tcp
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => Ok(Endpoint::tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(Endpoint::unix(path.display().to_string())),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Listener::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove socket file");
                }
            }
        }
    }
}

/// Remove a socket file left behind by a server that is gone. Anything else
/// at the path, or a socket someone still listens on, is a startup error.
#[cfg(unix)]
async fn clear_stale_socket(path: &Path, endpoint: &Endpoint) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(PluginError::Startup(format!(
                "failed to inspect {endpoint}: {e}"
            )))
        }
    };

    if !metadata.file_type().is_socket() {
        return Err(PluginError::Startup(format!(
            "refusing to listen on {endpoint}: path exists and is not a socket"
        )));
    }

    match UnixStream::connect(path).await {
        Ok(_) => Err(PluginError::Startup(format!(
            "refusing to listen on {endpoint}: another server is listening there"
        ))),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            tokio::fs::remove_file(path).await.map_err(|e| {
                PluginError::Startup(format!("failed to remove stale socket {endpoint}: {e}"))
            })?;
            debug!(path = %path.display(), "Removed stale socket file");
            Ok(())
        }
        Err(e) => Err(PluginError::Startup(format!(
            "failed to probe existing socket {endpoint}: {e}"
        ))),
    }
}

/// Connect to a plugin endpoint
pub async fn connect(endpoint: &Endpoint) -> Result<BoxedStream> {
    let failed = |e: io::Error| TransportError::ConnectionFailed(format!("{endpoint}: {e}"));

    match endpoint.network {
        Network::Tcp => {
            let stream = TcpStream::connect(&endpoint.address).await.map_err(failed)?;
            stream.set_nodelay(true).map_err(failed)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Network::Unix => {
            let stream = UnixStream::connect(&endpoint.address)
                .await
                .map_err(failed)?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        Network::Unix => Err(TransportError::ConnectionFailed(
            "unix sockets are not supported on this platform".to_string(),
        )
        .into()),
    }
}
