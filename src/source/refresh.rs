//! Background refresh: one long-lived subscription, retried with backoff.
//!
//! ```text
//! subscribe ──► apply update ──► apply update ──► ... stream ends / error
//!     ▲                                                      │
//!     └──── sleep(backoff) ◄──── retryable? ── yes ──────────┘
//!                                    │
//!                                    no ──► degraded, task exits
//! ```

use std::io;
use std::sync::Arc;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use super::Shared;
use crate::Error;
use crate::config::BackoffConfig;
use crate::workload_api::WorkloadApi;

/// Run until shutdown or a terminal error.
pub(super) async fn run(
    api: Arc<dyn WorkloadApi>,
    shared: Arc<Shared>,
    config: BackoffConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut backoff = config.create_backoff();

    loop {
        let error = tokio::select! {
            error = watch_until_failure(api.as_ref(), &shared, &mut backoff) => error,
            _ = shutdown_rx.recv() => {
                debug!("X509 refresh task stopping");
                return;
            }
        };

        if !error.is_retryable() {
            error!(error = %error, "X509 refresh stopped on terminal error");
            shared.record_failure(&error, true);
            return;
        }

        let delay = config.next_delay(&mut backoff);
        let failures = shared.record_failure(&error, false);
        warn!(
            error = %error,
            consecutive_failures = failures,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "X509 refresh failed, retrying"
        );

        tokio::select! {
            () = sleep(delay) => {}
            _ = shutdown_rx.recv() => {
                debug!("X509 refresh task stopping");
                return;
            }
        }
    }
}

/// Subscribe and apply updates until the subscription fails.
///
/// Always yields the error that ended it; a stream that simply ends counts
/// as a transient I/O failure.
async fn watch_until_failure(
    api: &dyn WorkloadApi,
    shared: &Shared,
    backoff: &mut ExponentialBackoff,
) -> Error {
    let mut updates = match api.watch_x509_context().await {
        Ok(updates) => updates,
        Err(e) => return e,
    };

    while let Some(item) = updates.next().await {
        match item.and_then(|context| shared.apply(context)) {
            Ok(generation) => {
                backoff.reset();
                debug!(generation, "Applied X509 context update");
            }
            Err(e) => return e,
        }
    }

    Error::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "Workload API stream ended",
    ))
}
