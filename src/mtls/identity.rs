//! Peer identity extraction.
//!
//! Reads the SPIFFE ID out of an X.509 certificate: the single URI SAN of the
//! leaf. A certificate with no URI SAN has no identity; one with several is
//! ambiguous and rejected rather than guessed at.
//!
//! Extraction does not verify anything. Call it on chains rustls has already
//! verified, or on the leaf of an SVID being loaded.

use rustls::CommonState;
use rustls::pki_types::CertificateDer;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::spiffe_id::SpiffeId;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// SPIFFE ID of a DER-encoded certificate.
///
/// # Errors
///
/// - `Error::CertParse` if the certificate cannot be decoded
/// - `Error::NoIdentity` / `Error::AmbiguousIdentity` if it does not carry
///   exactly one URI SAN
/// - `Error::InvalidName` if that URI is not a valid SPIFFE ID
pub fn id_from_cert(der: &[u8]) -> Result<SpiffeId> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::CertParse(format!("Failed to parse peer certificate: {e}")))?;
    id_from_parsed(&cert)
}

/// SPIFFE ID of the leaf of a chain (leaf first).
///
/// # Errors
///
/// Returns `Error::NoIdentity` for an empty chain, otherwise as [`id_from_cert`].
pub fn extract_identity(chain: &[CertificateDer<'_>]) -> Result<SpiffeId> {
    let leaf = chain
        .first()
        .ok_or_else(|| Error::NoIdentity("peer presented no certificate".to_owned()))?;
    id_from_cert(leaf.as_ref())
}

/// SPIFFE ID of the peer on an established TLS connection.
///
/// Works for both sides: pass `ServerConnection` or `ClientConnection`
/// (they deref to `CommonState`).
pub fn peer_identity(conn: &CommonState) -> Result<SpiffeId> {
    extract_identity(conn.peer_certificates().unwrap_or_default())
}

/// SPIFFE ID of an already decoded certificate.
pub(crate) fn id_from_parsed(cert: &X509Certificate<'_>) -> Result<SpiffeId> {
    let uris = uri_sans(cert)?;
    match uris.as_slice() {
        [] => Err(Error::NoIdentity(subject_label(cert))),
        [uri] => SpiffeId::parse(uri),
        _ => Err(Error::AmbiguousIdentity(uris.len())),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Every URI entry in the SAN extension.
fn uri_sans<'a>(cert: &'a X509Certificate<'_>) -> Result<Vec<&'a str>> {
    let san = cert
        .subject_alternative_name()
        .map_err(|e| Error::CertParse(format!("Malformed subjectAltName: {e}")))?;

    Ok(san
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::URI(uri) => Some(*uri),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default())
}

/// Subject CN for error messages, or `"<unknown>"`.
fn subject_label(cert: &X509Certificate<'_>) -> String {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or("<unknown>")
        .to_owned()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
