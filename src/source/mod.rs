//! The X509 identity source.
//!
//! [`X509Source`] keeps the workload's current SVID and trust bundles fresh
//! from the Workload API and serves them without blocking:
//!
//! - one background task owns the subscription and is the only writer
//! - each update is validated, then swapped in as a whole [`X509Snapshot`]
//! - readers clone an `Arc` to the snapshot under a short read lock, so a
//!   reader never sees the leaf of one update with the bundles of another
//! - transient failures are retried with backoff while the last good
//!   snapshot keeps being served; terminal failures mark the source degraded
//!
//! # Lifecycle
//!
//! ```text
//! open() ──► connecting ──► ready ◄──► retrying
//!                │            │
//!                │            └──► degraded (terminal error)
//!                └── timeout ──► Error::Connect
//! close() from any state ──► closed
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{DegradedPolicy, SourceConfig};
use crate::mtls::{BundleSource, SvidSource};
use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::svid::{TrustBundle, X509Context, X509Svid};
use crate::workload_api::{WorkloadApi, WorkloadApiClient};
use crate::{Error, Result};

pub mod health;
mod refresh;

pub use health::{SourceHealth, SourceStatus};

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Everything one update delivered, plus the SVID this workload presents.
#[derive(Debug)]
pub struct X509Snapshot {
    generation: u64,
    svid: Arc<X509Svid>,
    context: X509Context,
}

impl X509Snapshot {
    /// Sequence number of the update, starting at 1.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The SVID this workload presents.
    #[must_use]
    pub fn svid(&self) -> &Arc<X509Svid> {
        &self.svid
    }

    /// All SVIDs and bundles of the update.
    #[must_use]
    pub fn context(&self) -> &X509Context {
        &self.context
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

/// State shared by every clone of a source and its refresh task.
pub(crate) struct Shared {
    snapshot: RwLock<Option<Arc<X509Snapshot>>>,
    closed: AtomicBool,
    health: watch::Sender<SourceHealth>,
    expected_id: Option<SpiffeId>,
    degraded_policy: DegradedPolicy,
}

impl Shared {
    /// Validate an update and swap it in. Returns the new generation.
    fn apply(&self, context: X509Context) -> Result<u64> {
        let svid = context.default_svid(self.expected_id.as_ref())?;
        let spiffe_id = svid.id().clone();

        let generation = {
            let mut current = self.snapshot.write();
            let generation = current.as_ref().map_or(1, |s| s.generation + 1);
            *current = Some(Arc::new(X509Snapshot {
                generation,
                svid,
                context,
            }));
            generation
        };

        self.health.send_modify(|h| h.record_update(generation));
        info!(spiffe_id = %spiffe_id, generation, "X509 snapshot updated");
        Ok(generation)
    }

    /// Record a refresh failure. Returns the consecutive failure count.
    fn record_failure(&self, error: &Error, terminal: bool) -> u32 {
        let message = error.to_string();
        let mut failures = 0;
        self.health.send_modify(|h| {
            h.record_failure(&message, terminal);
            failures = h.consecutive_failures;
        });
        failures
    }

    /// `Error::Degraded` when the policy refuses handshakes in degraded state.
    fn check_handshake_allowed(&self) -> Result<()> {
        if self.degraded_policy != DegradedPolicy::RejectNewHandshakes {
            return Ok(());
        }
        let health = self.health.borrow();
        if health.status == SourceStatus::Degraded {
            return Err(Error::Degraded(
                health.last_error.clone().unwrap_or_default(),
            ));
        }
        Ok(())
    }
}

/// Stops the refresh task when the last source clone goes away.
struct TaskGuard {
    shutdown_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskGuard {
    fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Source
// ─────────────────────────────────────────────────────────────────────────────

/// Continuously refreshed SVID and trust bundles.
///
/// Cheap to clone; clones share one snapshot store and one refresh task.
#[derive(Clone)]
pub struct X509Source {
    shared: Arc<Shared>,
    task: Arc<TaskGuard>,
}

impl X509Source {
    /// Connect to the configured Workload API endpoint and wait for the
    /// first update.
    ///
    /// # Errors
    ///
    /// - `Error::Config` if no usable endpoint is configured
    /// - `Error::Connect` if no valid update arrives within
    ///   `initial_fetch_timeout`, or the agent refuses the workload
    pub async fn open(config: &SourceConfig) -> Result<Self> {
        let client = WorkloadApiClient::from_endpoint_or_env(config.endpoint.as_deref())?;
        Self::open_with(Arc::new(client), config.clone()).await
    }

    /// [`X509Source::open`] over any [`WorkloadApi`] implementation.
    pub async fn open_with(api: Arc<dyn WorkloadApi>, config: SourceConfig) -> Result<Self> {
        config.validate()?;

        let (health_tx, mut health_rx) = watch::channel(SourceHealth::connecting());
        let shared = Arc::new(Shared {
            snapshot: RwLock::new(None),
            closed: AtomicBool::new(false),
            health: health_tx,
            expected_id: config.expected_id.clone(),
            degraded_policy: config.degraded_policy,
        });

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(refresh::run(
            api,
            Arc::clone(&shared),
            config.backoff.clone(),
            shutdown_rx,
        ));
        let source = Self {
            shared,
            task: Arc::new(TaskGuard {
                shutdown_tx,
                handle: Mutex::new(Some(handle)),
            }),
        };

        let timeout = config.initial_fetch_timeout;
        let first = tokio::time::timeout(timeout, async {
            health_rx
                .wait_for(|h| h.has_snapshot() || h.status == SourceStatus::Degraded)
                .await
                .map(|h| (h.has_snapshot(), h.last_error.clone()))
        })
        .await;

        let failure = match first {
            Ok(Ok((true, _))) => {
                info!(
                    spiffe_id = %source.current_document()?.id(),
                    "X509 source ready"
                );
                return Ok(source);
            }
            Ok(Ok((false, last_error))) => format!(
                "Workload API refused the initial fetch: {}",
                last_error.unwrap_or_default()
            ),
            Ok(Err(_)) => "refresh task exited before the first update".to_owned(),
            Err(_) => {
                let mut message = format!("no X509 context within {timeout:?}");
                if let Some(e) = source.health().last_error {
                    message.push_str(&format!(" (last error: {e})"));
                }
                message
            }
        };

        source.close();
        Err(Error::Connect(failure))
    }

    /// Latest snapshot.
    ///
    /// # Errors
    ///
    /// `Error::ClosedSource` after [`close`](Self::close); `Error::NotReady`
    /// if no update was ever applied.
    pub fn snapshot(&self) -> Result<Arc<X509Snapshot>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedSource);
        }
        self.shared.snapshot.read().clone().ok_or(Error::NotReady)
    }

    /// The SVID this workload presents.
    pub fn current_document(&self) -> Result<Arc<X509Svid>> {
        Ok(Arc::clone(&self.snapshot()?.svid))
    }

    /// Trust bundle for `trust_domain`.
    ///
    /// # Errors
    ///
    /// As [`snapshot`](Self::snapshot), plus `Error::UnknownTrustDomain`.
    pub fn current_trust_bundle(&self, trust_domain: &TrustDomain) -> Result<Arc<TrustBundle>> {
        self.snapshot()?
            .context
            .bundle(trust_domain)
            .cloned()
            .ok_or_else(|| Error::UnknownTrustDomain(trust_domain.to_string()))
    }

    /// Current health.
    #[must_use]
    pub fn health(&self) -> SourceHealth {
        self.shared.health.borrow().clone()
    }

    /// Receiver that observes every health change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SourceHealth> {
        self.shared.health.subscribe()
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop the refresh task and drop the subscription. Idempotent.
    ///
    /// Readers that already hold a snapshot keep it; later reads fail with
    /// `Error::ClosedSource`.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.task.stop();
        self.shared.health.send_modify(SourceHealth::record_closed);
        info!("X509 source closed");
    }
}

impl std::fmt::Debug for X509Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X509Source")
            .field("health", &*self.shared.health.borrow())
            .finish_non_exhaustive()
    }
}

impl SvidSource for X509Source {
    fn current_svid(&self) -> Result<Arc<X509Svid>> {
        self.shared.check_handshake_allowed()?;
        self.current_document()
    }
}

impl BundleSource for X509Source {
    fn bundle_for_trust_domain(&self, trust_domain: &TrustDomain) -> Result<Arc<TrustBundle>> {
        self.shared.check_handshake_allowed()?;
        self.current_trust_bundle(trust_domain)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
