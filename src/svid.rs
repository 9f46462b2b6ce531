//! X.509-SVIDs (identity documents), trust bundles and update sets.
//!
//! Every type here is validated on construction and immutable afterwards.
//! The source hands them out behind `Arc`, and a rotation replaces them
//! wholesale instead of editing them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::mtls::cert_manager::{parse_certs, parse_private_key};
use crate::mtls::identity::id_from_parsed;
use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// X509-SVID
// ─────────────────────────────────────────────────────────────────────────────

/// An identity document: leaf certificate, intermediates and private key,
/// tagged with the SPIFFE ID the leaf carries.
pub struct X509Svid {
    id: SpiffeId,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    certified: Arc<CertifiedKey>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl X509Svid {
    /// Validate and assemble an SVID from a DER chain (leaf first) and key.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidDocument` for an empty chain, a key that does not
    ///   match the leaf, or a leaf outside its validity window
    /// - `Error::CertParse` if the leaf cannot be decoded
    /// - `Error::NoIdentity` / `Error::AmbiguousIdentity` / `Error::InvalidName`
    ///   if the leaf does not carry exactly one valid SPIFFE ID
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Self> {
        let leaf = chain
            .first()
            .ok_or_else(|| Error::InvalidDocument("certificate chain is empty".to_owned()))?;

        let (_, parsed) = X509Certificate::from_der(leaf.as_ref())
            .map_err(|e| Error::CertParse(format!("Failed to parse SVID leaf: {e}")))?;

        let id = id_from_parsed(&parsed)?;
        let not_before = to_utc(parsed.validity().not_before.timestamp())?;
        let not_after = to_utc(parsed.validity().not_after.timestamp())?;

        let now = Utc::now();
        if now > not_after {
            return Err(Error::InvalidDocument(format!(
                "SVID for {id} expired at {not_after}"
            )));
        }
        if now < not_before {
            return Err(Error::InvalidDocument(format!(
                "SVID for {id} is not valid before {not_before}"
            )));
        }

        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
            .map_err(|e| Error::InvalidDocument(format!("Unsupported SVID private key: {e}")))?;
        let certified = CertifiedKey::new(chain.clone(), signing_key);
        certified.keys_match().map_err(|e| {
            Error::InvalidDocument(format!("Private key does not match SVID for {id}: {e}"))
        })?;

        Ok(Self {
            id,
            chain,
            key,
            certified: Arc::new(certified),
            not_before,
            not_after,
        })
    }

    /// Parse an SVID from a PEM certificate chain and a PEM private key.
    pub fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        Self::new(parse_certs(chain_pem)?, parse_private_key(key_pem)?)
    }

    /// SPIFFE ID carried by the leaf.
    #[must_use]
    pub fn id(&self) -> &SpiffeId {
        &self.id
    }

    /// Leaf certificate.
    #[must_use]
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    /// Intermediate certificates, leaf excluded.
    #[must_use]
    pub fn intermediates(&self) -> &[CertificateDer<'static>] {
        &self.chain[1..]
    }

    /// Full chain, leaf first.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Private key for the leaf.
    #[must_use]
    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }

    /// Chain and signing key in the form rustls presents during a handshake.
    #[must_use]
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified)
    }

    /// Start of the leaf validity window.
    #[must_use]
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// End of the leaf validity window.
    #[must_use]
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }
}

impl fmt::Debug for X509Svid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509Svid")
            .field("id", &self.id)
            .field("chain_len", &self.chain.len())
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| Error::CertParse(format!("Certificate timestamp out of range: {timestamp}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Trust bundle
// ─────────────────────────────────────────────────────────────────────────────

/// Trust anchors for one trust domain.
#[derive(Debug)]
pub struct TrustBundle {
    trust_domain: TrustDomain,
    authorities: Vec<CertificateDer<'static>>,
    roots: Arc<RootCertStore>,
}

impl TrustBundle {
    /// Build a bundle from DER authorities.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidDocument` if `authorities` is empty or any of
    /// them cannot be used as a trust anchor.
    pub fn new(trust_domain: TrustDomain, authorities: Vec<CertificateDer<'static>>) -> Result<Self> {
        if authorities.is_empty() {
            return Err(Error::InvalidDocument(format!(
                "Trust bundle for \"{trust_domain}\" has no authorities"
            )));
        }

        let mut roots = RootCertStore::empty();
        for cert in &authorities {
            roots.add(cert.clone()).map_err(|e| {
                Error::InvalidDocument(format!(
                    "Unusable authority in trust bundle for \"{trust_domain}\": {e}"
                ))
            })?;
        }

        Ok(Self {
            trust_domain,
            authorities,
            roots: Arc::new(roots),
        })
    }

    /// Build a bundle from PEM authorities.
    pub fn from_pem(trust_domain: TrustDomain, pem: &[u8]) -> Result<Self> {
        Self::new(trust_domain, parse_certs(pem)?)
    }

    /// Trust domain the bundle belongs to.
    #[must_use]
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// Authorities as DER.
    #[must_use]
    pub fn authorities(&self) -> &[CertificateDer<'static>] {
        &self.authorities
    }

    /// Authorities as a rustls root store.
    #[must_use]
    pub fn roots(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.roots)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Update set
// ─────────────────────────────────────────────────────────────────────────────

/// One complete, validated update from the Workload API: the workload's
/// SVIDs plus the trust bundles they chain to.
#[derive(Debug, Clone)]
pub struct X509Context {
    svids: Vec<Arc<X509Svid>>,
    bundles: HashMap<TrustDomain, Arc<TrustBundle>>,
}

impl X509Context {
    /// Assemble an update.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidDocument` if there are no SVIDs, two bundles for
    /// one trust domain, or an SVID whose trust domain has no bundle.
    pub fn new(svids: Vec<X509Svid>, bundles: Vec<TrustBundle>) -> Result<Self> {
        if svids.is_empty() {
            return Err(Error::InvalidDocument("Update contains no SVIDs".to_owned()));
        }

        let mut by_domain = HashMap::with_capacity(bundles.len());
        for bundle in bundles {
            let td = bundle.trust_domain().clone();
            if by_domain.insert(td.clone(), Arc::new(bundle)).is_some() {
                return Err(Error::InvalidDocument(format!(
                    "Update contains two bundles for \"{td}\""
                )));
            }
        }

        for svid in &svids {
            if !by_domain.contains_key(svid.id().trust_domain()) {
                return Err(Error::InvalidDocument(format!(
                    "No trust bundle for the trust domain of {}",
                    svid.id()
                )));
            }
        }

        Ok(Self {
            svids: svids.into_iter().map(Arc::new).collect(),
            bundles: by_domain,
        })
    }

    /// All SVIDs, in the order the agent sent them.
    #[must_use]
    pub fn svids(&self) -> &[Arc<X509Svid>] {
        &self.svids
    }

    /// Bundles keyed by trust domain.
    #[must_use]
    pub fn bundles(&self) -> &HashMap<TrustDomain, Arc<TrustBundle>> {
        &self.bundles
    }

    /// Bundle for `trust_domain`, if present.
    #[must_use]
    pub fn bundle(&self, trust_domain: &TrustDomain) -> Option<&Arc<TrustBundle>> {
        self.bundles.get(trust_domain)
    }

    /// The SVID a workload presents: the one for `expected` when configured,
    /// otherwise the first.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidDocument` if `expected` is set and absent.
    pub fn default_svid(&self, expected: Option<&SpiffeId>) -> Result<Arc<X509Svid>> {
        let found = match expected {
            Some(want) => self.svids.iter().find(|s| s.id() == want),
            None => self.svids.first(),
        };
        found.cloned().ok_or_else(|| {
            let received: Vec<String> = self.svids.iter().map(|s| s.id().to_string()).collect();
            Error::InvalidDocument(format!(
                "No SVID for expected identity {}; received [{}]",
                expected.map(ToString::to_string).unwrap_or_default(),
                received.join(", ")
            ))
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
