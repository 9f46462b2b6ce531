//! Workload side of the Workload API.

use std::path::{Path, PathBuf};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tracing::debug;

use super::{ENDPOINT_SOCKET_ENV, WATCH_X509_CONTEXT, WorkloadApi, WorkloadMessage, X509ContextStream};
use crate::svid::X509Context;
use crate::{Error, Result};

/// Client for an agent listening on a Unix socket.
#[derive(Debug, Clone)]
pub struct WorkloadApiClient {
    socket_path: PathBuf,
}

impl WorkloadApiClient {
    /// Client for an explicit endpoint address.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the address is not a Unix socket address.
    pub fn new(endpoint: &str) -> Result<Self> {
        Ok(Self {
            socket_path: parse_endpoint(endpoint)?,
        })
    }

    /// Client for `endpoint`, falling back to `SPIFFE_ENDPOINT_SOCKET`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if neither is set or the address is invalid.
    pub fn from_endpoint_or_env(endpoint: Option<&str>) -> Result<Self> {
        match endpoint {
            Some(addr) => Self::new(addr),
            None => {
                let addr = std::env::var(ENDPOINT_SOCKET_ENV).map_err(|_| {
                    Error::Config(format!(
                        "No Workload API endpoint configured and {ENDPOINT_SOCKET_ENV} is not set"
                    ))
                })?;
                Self::new(&addr)
            }
        }
    }

    /// Socket the client dials.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[async_trait]
impl WorkloadApi for WorkloadApiClient {
    async fn watch_x509_context(&self) -> Result<X509ContextStream> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        stream
            .write_all(format!("{WATCH_X509_CONTEXT}\n").as_bytes())
            .await?;
        debug!(socket = %self.socket_path.display(), "Subscribed to X509 context updates");

        Ok(Box::pin(frames(BufReader::new(stream).lines())))
    }
}

/// Decode and validate one update per non-empty line.
fn frames(
    mut lines: Lines<BufReader<UnixStream>>,
) -> impl Stream<Item = Result<X509Context>> + Send {
    try_stream! {
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let context = WorkloadMessage::decode(&line)?.into_context()?;
            yield context;
        }
    }
}

/// Resolve an endpoint address to a socket path.
///
/// Accepts `unix:///path`, `unix:/path` and a bare absolute path.
///
/// # Errors
///
/// Returns `Error::Config` for other schemes, relative paths, or an address
/// with a host component.
pub fn parse_endpoint(addr: &str) -> Result<PathBuf> {
    let path = if let Some(rest) = addr.strip_prefix("unix://") {
        if !rest.starts_with('/') {
            return Err(Error::Config(format!(
                "Workload API address '{addr}' must not have a host component"
            )));
        }
        rest
    } else if let Some(rest) = addr.strip_prefix("unix:") {
        rest
    } else if addr.contains("://") {
        return Err(Error::Config(format!(
            "Unsupported Workload API address '{addr}': only unix sockets are supported"
        )));
    } else {
        addr
    };

    if !path.starts_with('/') {
        return Err(Error::Config(format!(
            "Workload API socket path in '{addr}' must be absolute"
        )));
    }

    Ok(PathBuf::from(path))
}
