//! rustls configuration for SPIFFE mutual TLS.
//!
//! The configs hold the source, not its contents: certificate resolvers ask
//! for the current SVID on every handshake and verifiers look bundles up
//! per peer, so a rotation takes effect without rebuilding anything.
//!
//! Both configs are TLS 1.3 only and use the `aws-lc-rs` provider.

use std::fmt;
use std::sync::Arc;

use rustls::client::ResolvesClientCert;
use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::warn;

use super::verifier::{SpiffeClientCertVerifier, SpiffeServerCertVerifier};
use super::{BundleSource, SvidSource};
use crate::Result;
use crate::matcher::Matcher;

/// Build a server config that presents the source's SVID, requires a client
/// certificate and authorizes the client's SPIFFE ID with `policy`.
///
/// Pass [`Matcher::Any`] to accept any client the bundles trust.
///
/// # Errors
///
/// Returns `Error::Tls` if rustls rejects the protocol selection.
pub fn build_server_config<S>(source: S, policy: Matcher) -> Result<ServerConfig>
where
    S: SvidSource + BundleSource + 'static,
{
    let provider = crypto_provider();
    let source = Arc::new(source);

    let verifier =
        SpiffeClientCertVerifier::new(Arc::clone(&source) as _, policy, Arc::clone(&provider));
    let resolver = SvidResolver { source };

    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_cert_resolver(Arc::new(resolver));

    Ok(config)
}

/// Build a client config that presents the source's SVID and authorizes the
/// server's SPIFFE ID with `policy` (typically [`Matcher::Exact`]).
///
/// # Errors
///
/// Returns `Error::Tls` if rustls rejects the protocol selection.
pub fn build_client_config<S>(source: S, policy: Matcher) -> Result<ClientConfig>
where
    S: SvidSource + BundleSource + 'static,
{
    let provider = crypto_provider();
    let source = Arc::new(source);

    let verifier =
        SpiffeServerCertVerifier::new(Arc::clone(&source) as _, policy, Arc::clone(&provider));
    let resolver = SvidResolver { source };

    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_cert_resolver(Arc::new(resolver));

    Ok(config)
}

/// [`build_server_config`] ready for a `tokio` listener.
pub fn tls_acceptor<S>(source: S, policy: Matcher) -> Result<TlsAcceptor>
where
    S: SvidSource + BundleSource + 'static,
{
    Ok(TlsAcceptor::from(Arc::new(build_server_config(source, policy)?)))
}

/// [`build_client_config`] ready for `tokio` streams.
pub fn tls_connector<S>(source: S, policy: Matcher) -> Result<TlsConnector>
where
    S: SvidSource + BundleSource + 'static,
{
    Ok(TlsConnector::from(Arc::new(build_client_config(source, policy)?)))
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificate resolver
// ─────────────────────────────────────────────────────────────────────────────

/// Hands rustls the current SVID, for either side of a handshake.
struct SvidResolver {
    source: Arc<dyn SvidSource>,
}

impl SvidResolver {
    fn current(&self) -> Option<Arc<CertifiedKey>> {
        match self.source.current_svid() {
            Ok(svid) => Some(svid.certified_key()),
            Err(e) => {
                warn!(error = %e, "No SVID available for handshake");
                None
            }
        }
    }
}

impl fmt::Debug for SvidResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SvidResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SvidResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current()
    }
}

impl ResolvesClientCert for SvidResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.current()
    }

    fn has_certs(&self) -> bool {
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use parking_lot::RwLock;

    use super::*;
    use crate::matcher::match_any;
    use crate::mtls::cert_manager::LocalCa;
    use crate::spiffe_id::{SpiffeId, TrustDomain};
    use crate::svid::{TrustBundle, X509Svid};
    use crate::{Error, Result};

    /// Rotatable in-memory source.
    struct MemorySource {
        svid: RwLock<Option<Arc<X509Svid>>>,
        bundle: Arc<TrustBundle>,
    }

    impl SvidSource for Arc<MemorySource> {
        fn current_svid(&self) -> Result<Arc<X509Svid>> {
            self.svid.read().clone().ok_or(Error::NotReady)
        }
    }

    impl BundleSource for Arc<MemorySource> {
        fn bundle_for_trust_domain(&self, td: &TrustDomain) -> Result<Arc<TrustBundle>> {
            if self.bundle.trust_domain() == td {
                Ok(Arc::clone(&self.bundle))
            } else {
                Err(Error::UnknownTrustDomain(td.to_string()))
            }
        }
    }

    fn memory_source(ca: &LocalCa, id: &str) -> Arc<MemorySource> {
        let svid = ca
            .issue_svid(&SpiffeId::parse(id).unwrap())
            .unwrap()
            .to_svid()
            .unwrap();
        Arc::new(MemorySource {
            svid: RwLock::new(Some(Arc::new(svid))),
            bundle: Arc::new(ca.bundle().unwrap()),
        })
    }

    #[test]
    fn both_configs_build_over_one_source() {
        let ca = LocalCa::new(TrustDomain::new("example.org").unwrap()).unwrap();
        let source = memory_source(&ca, "spiffe://example.org/workload");

        assert!(build_server_config(Arc::clone(&source), match_any()).is_ok());
        let client = build_client_config(source, match_any()).unwrap();
        assert!(client.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn resolver_follows_rotation() {
        // GIVEN: a resolver over a source that rotates its SVID
        let ca = LocalCa::new(TrustDomain::new("example.org").unwrap()).unwrap();
        let source = memory_source(&ca, "spiffe://example.org/server");
        let resolver = SvidResolver {
            source: Arc::new(Arc::clone(&source)),
        };
        let before = resolver.current().unwrap();

        let rotated = ca
            .issue_svid(&SpiffeId::parse("spiffe://example.org/server").unwrap())
            .unwrap()
            .to_svid()
            .unwrap();
        *source.svid.write() = Some(Arc::new(rotated));

        // THEN: the next handshake sees the new leaf
        let after = resolver.current().unwrap();
        assert_ne!(before.cert[0], after.cert[0]);
    }

    #[test]
    fn resolver_yields_nothing_without_svid() {
        let ca = LocalCa::new(TrustDomain::new("example.org").unwrap()).unwrap();
        let source = memory_source(&ca, "spiffe://example.org/server");
        *source.svid.write() = None;
        let resolver = SvidResolver {
            source: Arc::new(source),
        };
        assert!(resolver.current().is_none());
        assert!(ResolvesClientCert::has_certs(&resolver));
    }
}
