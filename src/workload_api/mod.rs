//! Workload API: the local endpoint that provisions X509-SVIDs and bundles.
//!
//! # Protocol
//!
//! Newline-delimited JSON over a Unix socket. The workload sends one request
//! line and then reads frames until either side closes:
//!
//! ```text
//! → WATCH_X509_CONTEXT
//! ← {"type":"x509_context","svids":[...],"bundles":[...]}
//! ← {"type":"x509_context", ...}            (after each rotation)
//! ← {"type":"error","code":"unavailable","message":"..."}
//! ```
//!
//! - [`client`]: [`WorkloadApiClient`], the workload side
//! - [`agent`]: [`LocalAgent`], an in-process agent for tests and local runs

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ProvisioningCode;
use crate::mtls::cert_manager::{IssuedSvid, LocalCa};
use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::svid::{TrustBundle, X509Context, X509Svid};
use crate::{Error, Result};

pub mod agent;
pub mod client;

pub use agent::LocalAgent;
pub use client::WorkloadApiClient;

/// Request line that opens an X509 context watch.
pub const WATCH_X509_CONTEXT: &str = "WATCH_X509_CONTEXT";

/// Environment variable naming the default endpoint.
pub const ENDPOINT_SOCKET_ENV: &str = "SPIFFE_ENDPOINT_SOCKET";

/// Stream of validated updates. Dropping it unsubscribes.
pub type X509ContextStream = Pin<Box<dyn Stream<Item = Result<X509Context>> + Send>>;

/// A provider of X509 context updates.
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// Subscribe to updates.
    ///
    /// The first item is the current context; later items follow rotations.
    /// An `Err` item ends the subscription.
    async fn watch_x509_context(&self) -> Result<X509ContextStream>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire format
// ─────────────────────────────────────────────────────────────────────────────

/// One frame from the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkloadMessage {
    /// A complete update.
    X509Context {
        /// SVIDs; the first is the default.
        svids: Vec<SvidMessage>,
        /// Bundles, one per trust domain.
        bundles: Vec<BundleMessage>,
    },
    /// The agent cannot serve this workload.
    Error {
        /// Error code.
        code: ProvisioningCode,
        /// Human-readable detail.
        message: String,
    },
}

/// Wire form of an X509-SVID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SvidMessage {
    /// Identity the agent claims the SVID carries.
    pub spiffe_id: String,
    /// PEM chain, leaf first.
    pub cert_chain_pem: String,
    /// PEM private key.
    pub private_key_pem: String,
}

/// Wire form of a trust bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMessage {
    /// Trust domain name.
    pub trust_domain: String,
    /// PEM authorities.
    pub bundle_pem: String,
}

impl WorkloadMessage {
    /// Context frame from issued SVIDs and the CAs whose bundles to ship.
    #[must_use]
    pub fn x509_context(svids: &[IssuedSvid], cas: &[&LocalCa]) -> Self {
        Self::X509Context {
            svids: svids.iter().map(SvidMessage::from).collect(),
            bundles: cas.iter().map(|ca| BundleMessage::from(*ca)).collect(),
        }
    }

    /// Decode one frame.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the line is not a valid frame.
    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::Protocol(format!("Bad frame: {e}")))
    }

    /// Validate the frame into an update.
    ///
    /// # Errors
    ///
    /// Error frames become `Error::Provisioning`; documents that fail
    /// validation become the corresponding identity or document error.
    pub fn into_context(self) -> Result<X509Context> {
        match self {
            Self::X509Context { svids, bundles } => {
                let svids = svids
                    .into_iter()
                    .map(SvidMessage::into_svid)
                    .collect::<Result<Vec<_>>>()?;
                let bundles = bundles
                    .into_iter()
                    .map(BundleMessage::into_bundle)
                    .collect::<Result<Vec<_>>>()?;
                X509Context::new(svids, bundles)
            }
            Self::Error { code, message } => Err(Error::Provisioning { code, message }),
        }
    }
}

impl SvidMessage {
    fn into_svid(self) -> Result<X509Svid> {
        let claimed = SpiffeId::parse(&self.spiffe_id)?;
        let svid = X509Svid::from_pem(
            self.cert_chain_pem.as_bytes(),
            self.private_key_pem.as_bytes(),
        )?;
        if svid.id() != &claimed {
            return Err(Error::InvalidDocument(format!(
                "Agent labelled an SVID for {} as {claimed}",
                svid.id()
            )));
        }
        Ok(svid)
    }
}

impl BundleMessage {
    fn into_bundle(self) -> Result<TrustBundle> {
        let td = TrustDomain::new(&self.trust_domain)?;
        TrustBundle::from_pem(td, self.bundle_pem.as_bytes())
    }
}

impl From<&IssuedSvid> for SvidMessage {
    fn from(issued: &IssuedSvid) -> Self {
        Self {
            spiffe_id: issued.id.to_string(),
            cert_chain_pem: issued.cert_chain_pem.clone(),
            private_key_pem: issued.key_pem.clone(),
        }
    }
}

impl From<&LocalCa> for BundleMessage {
    fn from(ca: &LocalCa) -> Self {
        Self {
            trust_domain: ca.trust_domain().to_string(),
            bundle_pem: ca.cert_pem().to_owned(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn ca() -> LocalCa {
        LocalCa::new(TrustDomain::new("example.org").unwrap()).unwrap()
    }

    fn id(s: &str) -> SpiffeId {
        SpiffeId::parse(s).unwrap()
    }

    #[test]
    fn context_frame_is_tagged_json() {
        let ca = ca();
        let issued = ca.issue_svid(&id("spiffe://example.org/server")).unwrap();
        let frame = WorkloadMessage::x509_context(&[issued], &[&ca]);

        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "x509_context");
        assert_eq!(json["svids"][0]["spiffe_id"], "spiffe://example.org/server");
        assert_eq!(json["bundles"][0]["trust_domain"], "example.org");
    }

    #[test]
    fn error_frame_decodes_to_provisioning_error() {
        let line = r#"{"type":"error","code":"permission_denied","message":"no entries"}"#;
        let err = WorkloadMessage::decode(line).unwrap().into_context().unwrap_err();
        assert!(
            matches!(
                &err,
                Error::Provisioning { code: ProvisioningCode::PermissionDenied, message } if message == "no entries"
            ),
            "{err}"
        );
    }

    #[test]
    fn undecodable_line_is_protocol_error() {
        for line in ["not json", r#"{"type":"mystery"}"#, r#"{"svids":[]}"#] {
            assert!(
                matches!(WorkloadMessage::decode(line), Err(Error::Protocol(_))),
                "{line}"
            );
        }
    }

    #[test]
    fn valid_frame_becomes_context() {
        // GIVEN: a frame encoded and decoded through JSON text
        let ca = ca();
        let issued = ca.issue_svid(&id("spiffe://example.org/server")).unwrap();
        let line = serde_json::to_string(&WorkloadMessage::x509_context(&[issued], &[&ca])).unwrap();

        // WHEN: validating it
        let ctx = WorkloadMessage::decode(&line).unwrap().into_context().unwrap();

        // THEN: SVID and bundle are present
        assert_eq!(ctx.svids()[0].id(), &id("spiffe://example.org/server"));
        assert!(ctx.bundle(ca.trust_domain()).is_some());
    }

    #[test]
    fn mislabelled_svid_is_invalid_document() {
        let ca = ca();
        let issued = ca.issue_svid(&id("spiffe://example.org/server")).unwrap();
        let mut svid = SvidMessage::from(&issued);
        svid.spiffe_id = "spiffe://example.org/admin".to_owned();
        let frame = WorkloadMessage::X509Context {
            svids: vec![svid],
            bundles: vec![BundleMessage::from(&ca)],
        };
        assert!(matches!(frame.into_context(), Err(Error::InvalidDocument(_))));
    }

    #[test]
    fn bundle_with_bad_trust_domain_is_rejected() {
        let ca = ca();
        let issued = ca.issue_svid(&id("spiffe://example.org/server")).unwrap();
        let mut bundle = BundleMessage::from(&ca);
        bundle.trust_domain = "Example.ORG".to_owned();
        let frame = WorkloadMessage::X509Context {
            svids: vec![SvidMessage::from(&issued)],
            bundles: vec![bundle],
        };
        assert!(matches!(frame.into_context(), Err(Error::InvalidName(_))));
    }
}
