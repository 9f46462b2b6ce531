//! Mutual TLS authenticated by SPIFFE identity.
//!
//! # Architecture
//!
//! ```text
//! X509Source (SvidSource + BundleSource)
//!   → build_server_config / build_client_config
//!   → TLS handshake  (rustls: SvidResolver presents our SVID,
//!                     verifier checks the peer chain against its bundle)
//!   → Matcher::test on the verified peer ID
//!   → peer_identity(&conn) in the application handler
//! ```
//!
//! # Modules
//!
//! - [`identity`]: SPIFFE ID extraction from certificates
//! - [`verifier`]: chain verification and authorization (`verify_peer_chain`)
//! - [`tls_config`]: rustls `ServerConfig` / `ClientConfig` builders
//! - [`cert_manager`]: PEM parsing and the local SVID-issuing CA
//!
//! # Quick start
//!
//! ```no_run
//! # async fn run() -> workload_mtls::Result<()> {
//! use workload_mtls::config::SourceConfig;
//! use workload_mtls::matcher::match_exact;
//! use workload_mtls::mtls::build_client_config;
//! use workload_mtls::{SpiffeId, X509Source};
//!
//! let source = X509Source::open(&SourceConfig::default()).await?;
//! let server_id = SpiffeId::parse("spiffe://example.org/server")?;
//! let tls = build_client_config(source.clone(), match_exact(server_id))?;
//! # let _ = tls;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::Result;
use crate::spiffe_id::TrustDomain;
use crate::svid::{TrustBundle, X509Svid};

pub mod cert_manager;
pub mod identity;
pub mod tls_config;
pub mod verifier;

pub use cert_manager::{IssuedSvid, LocalCa, SvidParams, parse_certs, parse_private_key};
pub use identity::{extract_identity, id_from_cert, peer_identity};
pub use tls_config::{build_client_config, build_server_config, tls_acceptor, tls_connector};
pub use verifier::{PeerRole, io_rejection_reason, rejection_reason, verify_peer_chain};

/// Provides the SVID this workload presents.
///
/// Called on every handshake; implementations must not block.
pub trait SvidSource: Send + Sync {
    /// Current SVID.
    fn current_svid(&self) -> Result<Arc<X509Svid>>;
}

/// Provides trust bundles for verifying peers.
///
/// Called on every handshake; implementations must not block.
pub trait BundleSource: Send + Sync {
    /// Bundle for `trust_domain`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownTrustDomain` when no bundle is known.
    fn bundle_for_trust_domain(&self, trust_domain: &TrustDomain) -> Result<Arc<TrustBundle>>;
}
