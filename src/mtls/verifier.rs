//! Peer certificate verification by trust bundle and SPIFFE ID.
//!
//! Both directions share one synchronous core, [`verify_peer_chain`]:
//!
//! ```text
//! leaf → SPIFFE ID → bundle for its trust domain → chain verified to that bundle
//!      → policy.test(id) → accept
//! ```
//!
//! The ID read before chain verification only selects which bundle to verify
//! against. Authorization runs after the chain is proven.
//!
//! rustls sees every rejection as `rustls::Error::Other` wrapping a crate
//! [`Error`]; [`rejection_reason`] recovers it from a failed handshake.

use std::fmt;
use std::io;
use std::sync::Arc;

use rustls::DigitallySignedStruct;
use rustls::SignatureScheme;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use tracing::{debug, warn};

use super::BundleSource;
use super::identity::id_from_cert;
use crate::matcher::Matcher;
use crate::spiffe_id::SpiffeId;
use crate::svid::TrustBundle;
use crate::{Error, Result};

/// Which side of the handshake the peer is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// The peer is a client; we are the server.
    Client,
    /// The peer is a server; we are the client.
    Server,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Verification core
// ─────────────────────────────────────────────────────────────────────────────

/// Verify a peer chain and authorize the identity it carries.
///
/// # Errors
///
/// - identity errors from [`id_from_cert`] if the leaf has no usable SPIFFE ID
/// - `Error::UnknownTrustDomain` (or `Error::Degraded`) from `bundles`
/// - `Error::Tls` if the chain does not verify to the bundle
/// - `Error::Authorization` if `policy` rejects the verified ID
pub fn verify_peer_chain(
    role: PeerRole,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    bundles: &dyn BundleSource,
    policy: &Matcher,
    now: UnixTime,
    provider: &Arc<CryptoProvider>,
) -> Result<SpiffeId> {
    let id = id_from_cert(end_entity.as_ref())?;
    let bundle = bundles.bundle_for_trust_domain(id.trust_domain())?;

    verify_signed_by(role, end_entity, intermediates, &bundle, now, provider)?;
    policy.test(&id)?;

    Ok(id)
}

fn verify_signed_by(
    role: PeerRole,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    bundle: &TrustBundle,
    now: UnixTime,
    provider: &Arc<CryptoProvider>,
) -> Result<()> {
    match role {
        PeerRole::Client => {
            // Client EKU checks live in the webpki client verifier.
            let verifier =
                WebPkiClientVerifier::builder_with_provider(bundle.roots(), Arc::clone(provider))
                    .build()
                    .map_err(|e| Error::Tls(format!("Failed to build client verifier: {e}")))?;
            verifier.verify_client_cert(end_entity, intermediates, now)?;
        }
        PeerRole::Server => {
            // SPIFFE server certificates carry no DNS name to check.
            let parsed = ParsedCertificate::try_from(end_entity)?;
            rustls::client::verify_server_cert_signed_by_trust_anchor(
                &parsed,
                &bundle.roots(),
                intermediates,
                now,
                provider.signature_verification_algorithms.all,
            )?;
        }
    }
    Ok(())
}

/// Typed reason for a handshake the verifiers rejected.
#[must_use]
pub fn rejection_reason(err: &rustls::Error) -> Option<&Error> {
    match err {
        rustls::Error::Other(other) => other.0.downcast_ref::<Error>(),
        _ => None,
    }
}

/// [`rejection_reason`] for the `io::Error` an async TLS stream reports.
#[must_use]
pub fn io_rejection_reason(err: &io::Error) -> Option<&Error> {
    err.get_ref()?
        .downcast_ref::<rustls::Error>()
        .and_then(rejection_reason)
}

fn other_err(e: Error) -> rustls::Error {
    rustls::Error::Other(rustls::OtherError(Arc::new(e)))
}

/// Log the outcome of a verification and hand it to rustls.
fn report(role: PeerRole, outcome: Result<SpiffeId>) -> std::result::Result<(), rustls::Error> {
    match outcome {
        Ok(id) => {
            debug!(role = %role, spiffe_id = %id, "Peer certificate accepted");
            Ok(())
        }
        Err(e) => {
            warn!(role = %role, error = %e, "Peer certificate rejected");
            Err(other_err(e))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client certificate verifier (server side)
// ─────────────────────────────────────────────────────────────────────────────

/// Verifies client certificates on behalf of a server.
pub(crate) struct SpiffeClientCertVerifier {
    bundles: Arc<dyn BundleSource>,
    policy: Matcher,
    provider: Arc<CryptoProvider>,
}

impl SpiffeClientCertVerifier {
    pub(crate) fn new(
        bundles: Arc<dyn BundleSource>,
        policy: Matcher,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            bundles,
            policy,
            provider,
        }
    }
}

impl fmt::Debug for SpiffeClientCertVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpiffeClientCertVerifier")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ClientCertVerifier for SpiffeClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let outcome = verify_peer_chain(
            PeerRole::Client,
            end_entity,
            intermediates,
            self.bundles.as_ref(),
            &self.policy,
            now,
            &self.provider,
        );
        report(PeerRole::Client, outcome).map(|()| ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server certificate verifier (client side)
// ─────────────────────────────────────────────────────────────────────────────

/// Verifies server certificates on behalf of a client.
///
/// The `ServerName` a connection is opened with is ignored: the server is
/// authorized by SPIFFE ID only.
pub(crate) struct SpiffeServerCertVerifier {
    bundles: Arc<dyn BundleSource>,
    policy: Matcher,
    provider: Arc<CryptoProvider>,
}

impl SpiffeServerCertVerifier {
    pub(crate) fn new(
        bundles: Arc<dyn BundleSource>,
        policy: Matcher,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            bundles,
            policy,
            provider,
        }
    }
}

impl fmt::Debug for SpiffeServerCertVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpiffeServerCertVerifier")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ServerCertVerifier for SpiffeServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let outcome = verify_peer_chain(
            PeerRole::Server,
            end_entity,
            intermediates,
            self.bundles.as_ref(),
            &self.policy,
            now,
            &self.provider,
        );
        report(PeerRole::Server, outcome).map(|()| ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
