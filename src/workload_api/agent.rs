//! In-process Workload API agent.
//!
//! [`LocalAgent`] serves whatever was last published to every connected
//! workload, then streams each later publication. It stands in for a real
//! SPIFFE agent in tests and local development:
//!
//! ```no_run
//! # async fn run() -> workload_mtls::Result<()> {
//! use workload_mtls::mtls::LocalCa;
//! use workload_mtls::workload_api::LocalAgent;
//! use workload_mtls::{SpiffeId, TrustDomain};
//!
//! let ca = LocalCa::new(TrustDomain::new("example.org")?)?;
//! let agent = LocalAgent::bind("/tmp/agent.sock").await?;
//! let svid = ca.issue_svid(&SpiffeId::parse("spiffe://example.org/server")?)?;
//! agent.publish_context(&[svid], &[&ca]);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use super::{WATCH_X509_CONTEXT, WorkloadMessage};
use crate::Result;
use crate::error::ProvisioningCode;
use crate::mtls::cert_manager::{IssuedSvid, LocalCa};

/// What connected workloads are sent next.
#[derive(Debug, Clone)]
enum AgentFrame {
    /// Nothing published yet; subscribers wait.
    Pending,
    /// Latest frame.
    Frame(Arc<WorkloadMessage>),
}

/// A Workload API agent bound to a Unix socket.
#[derive(Debug)]
pub struct LocalAgent {
    socket_path: PathBuf,
    frames: Arc<watch::Sender<AgentFrame>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl LocalAgent {
    /// Bind `socket_path` (replacing a stale socket) and start accepting.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the socket cannot be bound.
    pub async fn bind(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();

        if socket_path.exists() {
            tokio::fs::remove_file(&socket_path).await?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        info!(socket = %socket_path.display(), "Workload API agent listening");

        let (frames, _) = watch::channel(AgentFrame::Pending);
        let frames = Arc::new(frames);
        let (shutdown_tx, _) = broadcast::channel(1);

        tokio::spawn(accept_loop(listener, Arc::clone(&frames), shutdown_tx.clone()));

        Ok(Self {
            socket_path,
            frames,
            shutdown_tx,
        })
    }

    /// Socket the agent listens on.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Endpoint address for [`crate::config::SourceConfig::endpoint`].
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("unix://{}", self.socket_path.display())
    }

    /// Send `message` to every current and future subscriber.
    pub fn publish(&self, message: WorkloadMessage) {
        self.frames.send_replace(AgentFrame::Frame(Arc::new(message)));
    }

    /// Publish a context built from issued SVIDs and CA bundles.
    pub fn publish_context(&self, svids: &[IssuedSvid], cas: &[&LocalCa]) {
        self.publish(WorkloadMessage::x509_context(svids, cas));
    }

    /// Send an error frame; subscribers are disconnected after receiving it.
    pub fn fail(&self, code: ProvisioningCode, message: impl Into<String>) {
        self.publish(WorkloadMessage::Error {
            code,
            message: message.into(),
        });
    }

    /// Workloads currently subscribed.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.frames.receiver_count()
    }

    /// Stop accepting and close every subscription.
    pub fn shutdown(&self) {
        // No receivers just means nothing is running any more.
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for LocalAgent {
    fn drop(&mut self) {
        self.shutdown();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn accept_loop(
    listener: UnixListener,
    frames: Arc<watch::Sender<AgentFrame>>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let frames_rx = frames.subscribe();
                    let conn_shutdown = shutdown_tx.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, frames_rx, conn_shutdown).await {
                            debug!(error = %e, "Workload API connection ended with error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "Workload API accept error"),
            },
            _ = shutdown_rx.recv() => {
                info!("Workload API agent shutting down");
                break;
            }
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    mut frames: watch::Receiver<AgentFrame>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut request = String::new();
    reader.read_line(&mut request).await?;
    if request.trim() != WATCH_X509_CONTEXT {
        let reply = WorkloadMessage::Error {
            code: ProvisioningCode::InvalidArgument,
            message: format!("unknown request: {}", request.trim()),
        };
        write_frame(&mut write_half, &reply).await?;
        return Ok(());
    }

    let mut peek = [0u8; 1];
    loop {
        let frame = frames.borrow_and_update().clone();
        if let AgentFrame::Frame(message) = frame {
            write_frame(&mut write_half, &message).await?;
            if matches!(*message, WorkloadMessage::Error { .. }) {
                return Ok(());
            }
        }

        tokio::select! {
            changed = frames.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            // Workloads send nothing after the request; EOF means they left.
            _ = reader.read(&mut peek) => {
                debug!("Workload unsubscribed");
                return Ok(());
            }
            _ = shutdown_rx.recv() => return Ok(()),
        }
    }
}

async fn write_frame(
    writer: &mut (impl AsyncWrite + Unpin),
    message: &WorkloadMessage,
) -> Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::spiffe_id::{SpiffeId, TrustDomain};
    use crate::workload_api::{WorkloadApi, WorkloadApiClient};
    use crate::Error;

    fn id(s: &str) -> SpiffeId {
        SpiffeId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn subscriber_receives_current_then_later_frames() {
        // GIVEN: an agent with one published context
        let dir = tempfile::tempdir().unwrap();
        let agent = LocalAgent::bind(dir.path().join("agent.sock")).await.unwrap();
        let ca = LocalCa::new(TrustDomain::new("example.org").unwrap()).unwrap();
        let first = ca.issue_svid(&id("spiffe://example.org/a")).unwrap();
        agent.publish_context(&[first], &[&ca]);

        // WHEN: a workload subscribes
        let client = WorkloadApiClient::new(&agent.endpoint()).unwrap();
        let mut updates = client.watch_x509_context().await.unwrap();

        // THEN: it gets the current context, then the next publication
        let ctx = updates.next().await.unwrap().unwrap();
        assert_eq!(ctx.svids()[0].id(), &id("spiffe://example.org/a"));

        let second = ca.issue_svid(&id("spiffe://example.org/b")).unwrap();
        agent.publish_context(&[second], &[&ca]);
        let ctx = updates.next().await.unwrap().unwrap();
        assert_eq!(ctx.svids()[0].id(), &id("spiffe://example.org/b"));
    }

    #[tokio::test]
    async fn error_frame_ends_the_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let agent = LocalAgent::bind(dir.path().join("agent.sock")).await.unwrap();
        agent.fail(ProvisioningCode::PermissionDenied, "no registration entries");

        let client = WorkloadApiClient::new(&agent.endpoint()).unwrap();
        let mut updates = client.watch_x509_context().await.unwrap();

        let err = updates.next().await.unwrap().unwrap_err();
        assert!(
            matches!(err, Error::Provisioning { code: ProvisioningCode::PermissionDenied, .. }),
            "{err}"
        );
        assert!(updates.next().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_closes_open_subscriptions() {
        let dir = tempfile::tempdir().unwrap();
        let agent = LocalAgent::bind(dir.path().join("agent.sock")).await.unwrap();

        let client = WorkloadApiClient::new(&agent.endpoint()).unwrap();
        let mut updates = client.watch_x509_context().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while agent.subscriber_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        agent.shutdown();
        assert!(updates.next().await.is_none());
    }
}
