//! Workload identity and mutual TLS
//!
//! SPIFFE X.509 workload identities, kept fresh from a Workload API agent and
//! used to authenticate and authorize both ends of a rustls connection.
//!
//! # Features
//!
//! - **Identity names**: validated, canonical `spiffe://` IDs and trust domains
//! - **Identity source**: background-refreshed SVIDs and trust bundles with
//!   retry, backoff and atomic snapshot swaps
//! - **Matchers**: composable authorization policies over peer IDs
//! - **mTLS**: TLS 1.3 server and client configs that present the current SVID
//!   on every handshake and authorize the verified peer
//! - **Local agent**: an in-process Workload API agent and CA for tests and
//!   local development
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> workload_mtls::Result<()> {
//! use workload_mtls::config::SourceConfig;
//! use workload_mtls::matcher::match_any;
//! use workload_mtls::mtls::build_server_config;
//! use workload_mtls::X509Source;
//!
//! let source = X509Source::open(&SourceConfig::default()).await?;
//! let tls = build_server_config(source.clone(), match_any())?;
//! # let _ = tls;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod matcher;
pub mod mtls;
pub mod source;
pub mod spiffe_id;
pub mod svid;
pub mod workload_api;

pub use config::{Config, SourceConfig};
pub use error::{Error, Result};
pub use matcher::Matcher;
pub use source::{SourceHealth, SourceStatus, X509Snapshot, X509Source};
pub use spiffe_id::{SpiffeId, TrustDomain};
pub use svid::{TrustBundle, X509Context, X509Svid};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides `level` when set. `format` of `"json"` selects
/// structured output.
///
/// # Errors
///
/// Returns `Error::Config` if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Config(format!("tracing already initialised: {e}")))
}
