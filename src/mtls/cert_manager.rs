//! Certificate material: PEM parsing and a local SPIFFE certificate authority.
//!
//! Provides:
//! - [`parse_certs`] / [`parse_private_key`]: PEM decoding for Workload API frames
//! - [`LocalCa`]: `rcgen`-backed trust-domain root that issues X509-SVIDs,
//!   used by [`crate::workload_api::LocalAgent`], tests and local development
//!
//! # File format
//!
//! Certificates and keys travel as **PEM**. Keys may be PKCS#8, SEC1 (EC) or
//! PKCS#1 (RSA).

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::svid::{TrustBundle, X509Svid};
use crate::{Error, Result};

/// Default SVID lifetime for [`SvidParams::new`].
const DEFAULT_SVID_TTL: Duration = Duration::from_secs(3600);

/// Backdating applied to `not_before` to tolerate small clock skew.
const CLOCK_SKEW: Duration = Duration::from_secs(60);

// ─────────────────────────────────────────────────────────────────────────────
// Public: PEM parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Parse every certificate in a PEM buffer.
///
/// # Errors
///
/// Returns `Error::CertParse` if the buffer is malformed or contains no
/// certificate blocks.
pub fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &*pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::CertParse(format!("Failed to parse PEM certificates: {e}")))?;

    if certs.is_empty() {
        return Err(Error::CertParse("No certificates found in PEM".to_owned()));
    }

    Ok(certs)
}

/// Parse the first private key in a PEM buffer.
///
/// # Errors
///
/// Returns `Error::CertParse` if the buffer is malformed or holds no key.
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &*pem)
        .map_err(|e| Error::CertParse(format!("Failed to parse PEM private key: {e}")))?
        .ok_or_else(|| Error::CertParse("No private key found in PEM".to_owned()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: SVID issuance
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for issuing an X509-SVID.
#[derive(Debug, Clone)]
pub struct SvidParams {
    /// Identity placed in the URI SAN.
    pub id: SpiffeId,
    /// Start of validity.
    pub not_before: SystemTime,
    /// End of validity.
    pub not_after: SystemTime,
    /// Additional URI SANs. A valid SVID has none; this exists to produce
    /// deliberately malformed certificates.
    pub extra_uris: Vec<String>,
}

impl SvidParams {
    /// One-hour SVID for `id`, valid from now (minus clock skew).
    #[must_use]
    pub fn new(id: SpiffeId) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            not_before: now - CLOCK_SKEW,
            not_after: now + DEFAULT_SVID_TTL,
            extra_uris: Vec::new(),
        }
    }

    /// Replace the lifetime, counted from now.
    #[must_use]
    pub fn with_validity(mut self, ttl: Duration) -> Self {
        self.not_after = SystemTime::now() + ttl;
        self
    }

    /// Make the SVID one that expired an hour ago.
    #[must_use]
    pub fn expired(mut self) -> Self {
        let now = SystemTime::now();
        self.not_before = now - Duration::from_secs(7200);
        self.not_after = now - Duration::from_secs(3600);
        self
    }

    /// Add another URI SAN.
    #[must_use]
    pub fn with_extra_uri(mut self, uri: &str) -> Self {
        self.extra_uris.push(uri.to_owned());
        self
    }
}

/// Issued certificate chain and key in PEM format.
#[derive(Debug, Clone)]
pub struct IssuedSvid {
    /// Identity the SVID was issued for.
    pub id: SpiffeId,
    /// PEM-encoded chain, leaf first.
    pub cert_chain_pem: String,
    /// PEM-encoded PKCS#8 private key.
    pub key_pem: String,
}

impl IssuedSvid {
    /// Validate the PEM material into an [`X509Svid`].
    pub fn to_svid(&self) -> Result<X509Svid> {
        X509Svid::from_pem(self.cert_chain_pem.as_bytes(), self.key_pem.as_bytes())
    }
}

/// Self-signed root for one trust domain that issues X509-SVIDs.
pub struct LocalCa {
    trust_domain: TrustDomain,
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
}

impl LocalCa {
    /// Generate a new root for `trust_domain`.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or certificate serialisation fails.
    pub fn new(trust_domain: TrustDomain) -> Result<Self> {
        let common_name = format!("{trust_domain} root CA");
        Self::with_common_name(trust_domain, &common_name)
    }

    /// Generate a new root with an explicit subject CN.
    ///
    /// Distinct names make rotated roots easy to tell apart in logs and tests.
    pub fn with_common_name(trust_domain: TrustDomain, common_name: &str) -> Result<Self> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Config(format!("Failed to generate CA key: {e}")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "SPIFFE");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.subject_alt_names = vec![uri_san(&trust_domain.id_string())?];

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Config(format!("CA cert generation failed: {e}")))?;

        Ok(Self {
            trust_domain,
            cert_der: cert.der().clone(),
            cert_pem: cert.pem(),
            issuer: Issuer::new(params, key_pair),
        })
    }

    /// Trust domain this root signs for.
    #[must_use]
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// Root certificate as DER.
    #[must_use]
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Root certificate as PEM.
    #[must_use]
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Trust bundle containing this root.
    pub fn bundle(&self) -> Result<TrustBundle> {
        TrustBundle::new(self.trust_domain.clone(), vec![self.cert_der.clone()])
    }

    /// Issue a default one-hour SVID for `id`.
    pub fn issue_svid(&self, id: &SpiffeId) -> Result<IssuedSvid> {
        self.issue(&SvidParams::new(id.clone()))
    }

    /// Issue an SVID.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidDocument` if `params.id` belongs to another trust
    /// domain, or `Error::Config` if key generation or signing fails.
    pub fn issue(&self, params: &SvidParams) -> Result<IssuedSvid> {
        if !params.id.is_member_of(&self.trust_domain) {
            return Err(Error::InvalidDocument(format!(
                "CA for \"{}\" cannot issue {}",
                self.trust_domain, params.id
            )));
        }

        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::Config(format!("Failed to generate SVID key: {e}")))?;

        let mut leaf = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, leaf_common_name(&params.id));
        dn.push(DnType::OrganizationName, "SPIFFE");
        leaf.distinguished_name = dn;
        leaf.is_ca = IsCa::ExplicitNoCa;
        leaf.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        leaf.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        leaf.not_before = to_offset_date_time(params.not_before)?;
        leaf.not_after = to_offset_date_time(params.not_after)?;

        let mut sans = vec![uri_san(&params.id.to_string())?];
        for uri in &params.extra_uris {
            sans.push(uri_san(uri)?);
        }
        leaf.subject_alt_names = sans;

        let cert = leaf
            .signed_by(&leaf_key, &self.issuer)
            .map_err(|e| Error::Config(format!("SVID signing failed: {e}")))?;

        Ok(IssuedSvid {
            id: params.id.clone(),
            cert_chain_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }
}

impl fmt::Debug for LocalCa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCa")
            .field("trust_domain", &self.trust_domain)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn uri_san(uri: &str) -> Result<SanType> {
    let ia5 = Ia5String::try_from(uri)
        .map_err(|e| Error::Config(format!("Invalid URI SAN '{uri}': {e}")))?;
    Ok(SanType::URI(ia5))
}

/// Last path segment, or the trust domain for a bare trust-domain ID.
fn leaf_common_name(id: &SpiffeId) -> String {
    id.path()
        .last()
        .cloned()
        .unwrap_or_else(|| id.trust_domain().to_string())
}

/// Convert a `SystemTime` into the `OffsetDateTime` `rcgen` expects.
fn to_offset_date_time(at: SystemTime) -> Result<time::OffsetDateTime> {
    let secs = at
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Config(format!("System time error: {e}")))?
        .as_secs();

    time::OffsetDateTime::from_unix_timestamp(i64::try_from(secs).unwrap_or(i64::MAX))
        .map_err(|e| Error::Config(format!("Date calculation error: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
