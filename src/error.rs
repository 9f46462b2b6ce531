//! Error types for workload identity and mTLS

use std::io;

use thiserror::Error;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Workload identity errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed SPIFFE ID or trust domain
    #[error("Invalid SPIFFE ID: {0}")]
    InvalidName(String),

    /// Initial fetch from the Workload API failed or timed out
    #[error("Unable to connect to Workload API: {0}")]
    Connect(String),

    /// The source has been closed
    #[error("X509 source is closed")]
    ClosedSource,

    /// No identity document has been received yet
    #[error("X509 source has not received an identity document yet")]
    NotReady,

    /// No trust bundle is known for the trust domain
    #[error("No trust bundle for trust domain \"{0}\"")]
    UnknownTrustDomain(String),

    /// The authorization policy rejected a peer
    #[error("Unauthorized SPIFFE ID {id}: {reason}")]
    Authorization {
        /// Peer SPIFFE ID as presented
        id: String,
        /// Diagnostic reason
        reason: String,
    },

    /// Certificate carries no SPIFFE ID
    #[error("Certificate has no SPIFFE ID: {0}")]
    NoIdentity(String),

    /// Certificate carries more than one URI SAN
    #[error("Certificate has {0} URI SANs, expected exactly one")]
    AmbiguousIdentity(usize),

    /// Certificate or key could not be decoded
    #[error("Certificate parse error: {0}")]
    CertParse(String),

    /// Identity document or bundle failed validation
    #[error("Invalid identity document: {0}")]
    InvalidDocument(String),

    /// Error frame sent by the Workload API
    #[error("Workload API error ({code}): {message}")]
    Provisioning {
        /// Error code
        code: ProvisioningCode,
        /// Error message
        message: String,
    },

    /// Undecodable Workload API frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The source stopped refreshing and the configured policy refuses new handshakes
    #[error("X509 source is degraded: {0}")]
    Degraded(String),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an authorization error for `id`
    pub fn unauthorized(id: impl ToString, reason: impl Into<String>) -> Self {
        Self::Authorization {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the background refresh should retry after this error.
    ///
    /// Transport-level failures and `unavailable` frames are transient.
    /// Everything else (bad frames, bad documents, permission denied) stops
    /// the refresh task.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(_) => true,
            Self::Provisioning { code, .. } => code.is_retryable(),
            _ => false,
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}

/// Error codes carried by Workload API error frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningCode {
    /// The agent cannot serve right now; retry later
    Unavailable,
    /// The caller is not entitled to any identity
    PermissionDenied,
    /// The request was malformed
    InvalidArgument,
    /// Agent-side failure
    Internal,
}

impl ProvisioningCode {
    /// Only `unavailable` is worth retrying
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

impl std::fmt::Display for ProvisioningCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unavailable => "unavailable",
            Self::PermissionDenied => "permission_denied",
            Self::InvalidArgument => "invalid_argument",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_retryable() {
        let e = Error::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(e.is_retryable());
    }

    #[test]
    fn unavailable_frames_are_retryable_others_are_not() {
        let unavailable = Error::Provisioning {
            code: ProvisioningCode::Unavailable,
            message: "agent starting".into(),
        };
        let denied = Error::Provisioning {
            code: ProvisioningCode::PermissionDenied,
            message: "no entries".into(),
        };
        assert!(unavailable.is_retryable());
        assert!(!denied.is_retryable());
    }

    #[test]
    fn document_and_protocol_errors_are_terminal() {
        assert!(!Error::InvalidDocument("expired".into()).is_retryable());
        assert!(!Error::Protocol("bad frame".into()).is_retryable());
    }

    #[test]
    fn authorization_error_names_the_peer() {
        let e = Error::unauthorized("spiffe://example.org/attacker", "not allowed");
        assert_eq!(
            e.to_string(),
            "Unauthorized SPIFFE ID spiffe://example.org/attacker: not allowed"
        );
    }

    #[test]
    fn provisioning_code_display_matches_wire_form() {
        let json = serde_json::to_string(&ProvisioningCode::PermissionDenied).unwrap();
        assert_eq!(json, format!("\"{}\"", ProvisioningCode::PermissionDenied));
    }
}
