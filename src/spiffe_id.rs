//! SPIFFE IDs and trust domains.
//!
//! A SPIFFE ID is `spiffe://<trust-domain>/<path>`: a trust domain naming the
//! issuing authority and an ordered, possibly empty list of path segments.
//! Parsing is strict about the trust domain and lenient only about separator
//! noise in the path:
//!
//! | Input                                 | Result                          |
//! |---------------------------------------|---------------------------------|
//! | `spiffe://example.org/ns/prod/sa/web` | ok                              |
//! | `spiffe://example.org`                | ok, empty path                  |
//! | `spiffe://example.org//a/b/`          | ok, formats as `.../a/b`        |
//! | `https://example.org/a`               | wrong scheme                    |
//! | `spiffe://Example.org/a`              | uppercase trust domain          |
//! | `spiffe://example.org/a/../b`         | relative segment                |
//! | `spiffe:///a`                         | missing trust domain            |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// URI scheme of every SPIFFE ID.
pub const SPIFFE_SCHEME: &str = "spiffe";

const SCHEME_PREFIX: &str = "spiffe://";
const MAX_ID_LEN: usize = 2048;
const MAX_TRUST_DOMAIN_LEN: usize = 255;

// ─────────────────────────────────────────────────────────────────────────────
// Trust domain
// ─────────────────────────────────────────────────────────────────────────────

/// The administrative namespace a SPIFFE ID belongs to (e.g. `example.org`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrustDomain {
    name: String,
}

impl TrustDomain {
    /// Parse a trust domain from its bare name or its `spiffe://name` form.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidName` if the name is empty, too long, or
    /// contains anything other than lowercase letters, digits, `.`, `-`, `_`.
    pub fn new(name: &str) -> Result<Self> {
        let bare = name.strip_prefix(SCHEME_PREFIX).unwrap_or(name);
        validate_trust_domain(bare).map_err(|reason| invalid(name, &reason))?;
        Ok(Self {
            name: bare.to_owned(),
        })
    }

    /// The bare trust domain name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The trust domain as a SPIFFE ID string (`spiffe://example.org`).
    #[must_use]
    pub fn id_string(&self) -> String {
        format!("{SCHEME_PREFIX}{}", self.name)
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl FromStr for TrustDomain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for TrustDomain {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(&s)
    }
}

impl From<TrustDomain> for String {
    fn from(td: TrustDomain) -> Self {
        td.name
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SPIFFE ID
// ─────────────────────────────────────────────────────────────────────────────

/// A workload identity name.
///
/// Immutable once constructed. Equality and hashing are structural, which is
/// the same as comparing canonical string forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpiffeId {
    trust_domain: TrustDomain,
    path: Vec<String>,
}

impl SpiffeId {
    /// Parse a SPIFFE ID string.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidName` on a wrong scheme, an invalid or missing
    /// trust domain, or an invalid path segment. Nothing is constructed on error.
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Err(invalid(input, "empty string"));
        }
        if input.len() > MAX_ID_LEN {
            return Err(invalid(
                input,
                &format!("longer than {MAX_ID_LEN} bytes"),
            ));
        }

        let rest = input
            .strip_prefix(SCHEME_PREFIX)
            .ok_or_else(|| invalid(input, "scheme must be \"spiffe://\""))?;

        let (td, path) = match rest.find('/') {
            Some(i) => rest.split_at(i),
            None => (rest, ""),
        };

        validate_trust_domain(td).map_err(|reason| invalid(input, &reason))?;
        let path = parse_path(path).map_err(|reason| invalid(input, &reason))?;

        Ok(Self {
            trust_domain: TrustDomain {
                name: td.to_owned(),
            },
            path,
        })
    }

    /// Build a SPIFFE ID from a trust domain and path segments.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidName` if any segment is empty, relative, or
    /// contains characters outside `[A-Za-z0-9._-]`, or if the whole ID is
    /// longer than `parse` accepts.
    pub fn from_segments(trust_domain: TrustDomain, segments: &[&str]) -> Result<Self> {
        let mut path = Vec::with_capacity(segments.len());
        for seg in segments {
            validate_segment(seg).map_err(|reason| {
                invalid(&format!("{}/{}", trust_domain.id_string(), segments.join("/")), &reason)
            })?;
            path.push((*seg).to_owned());
        }
        let id = Self { trust_domain, path };
        let rendered = id.to_string();
        if rendered.len() > MAX_ID_LEN {
            return Err(invalid(&rendered, &format!("longer than {MAX_ID_LEN} bytes")));
        }
        Ok(id)
    }

    /// The trust domain this ID was issued under.
    #[must_use]
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// Path segments, in order.
    #[must_use]
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Path in its canonical `/a/b` form; empty for the trust domain ID.
    #[must_use]
    pub fn path_string(&self) -> String {
        self.path.iter().map(|seg| format!("/{seg}")).collect()
    }

    /// Whether this ID belongs to `trust_domain`.
    #[must_use]
    pub fn is_member_of(&self, trust_domain: &TrustDomain) -> bool {
        &self.trust_domain == trust_domain
    }

    /// Whether this ID sits strictly below `other` in the same trust domain.
    ///
    /// `spiffe://example.org/ns/prod/web` is subordinate of
    /// `spiffe://example.org/ns/prod` and of `spiffe://example.org`,
    /// but not of itself.
    #[must_use]
    pub fn is_subordinate_of(&self, other: &SpiffeId) -> bool {
        self.trust_domain == other.trust_domain
            && self.path.len() > other.path.len()
            && self.path.starts_with(&other.path)
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME_PREFIX}{}", self.trust_domain.name)?;
        for seg in &self.path {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

impl FromStr for SpiffeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SpiffeId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl TryFrom<&str> for SpiffeId {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<SpiffeId> for String {
    fn from(id: SpiffeId) -> Self {
        id.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation helpers
// ─────────────────────────────────────────────────────────────────────────────

fn invalid(input: &str, reason: &str) -> Error {
    Error::InvalidName(format!("{input:?}: {reason}"))
}

fn validate_trust_domain(td: &str) -> std::result::Result<(), String> {
    if td.is_empty() {
        return Err("trust domain is missing".to_owned());
    }
    if td.len() > MAX_TRUST_DOMAIN_LEN {
        return Err(format!(
            "trust domain is longer than {MAX_TRUST_DOMAIN_LEN} bytes"
        ));
    }
    if let Some(c) = td.chars().find(|c| !is_trust_domain_char(*c)) {
        return Err(format!(
            "trust domain contains {c:?}; only lowercase letters, digits, '.', '-' and '_' are allowed"
        ));
    }
    Ok(())
}

/// Split on `/`, collapsing repeated and trailing separators.
fn parse_path(path: &str) -> std::result::Result<Vec<String>, String> {
    path.split('/')
        .filter(|seg| !seg.is_empty())
        .map(|seg| validate_segment(seg).map(|()| seg.to_owned()))
        .collect()
}

fn validate_segment(seg: &str) -> std::result::Result<(), String> {
    if seg.is_empty() {
        return Err("path contains an empty segment".to_owned());
    }
    if seg == "." || seg == ".." {
        return Err(format!("path contains relative segment {seg:?}"));
    }
    if let Some(c) = seg.chars().find(|c| !is_path_char(*c)) {
        return Err(format!(
            "path segment {seg:?} contains {c:?}; only letters, digits, '.', '-' and '_' are allowed"
        ));
    }
    Ok(())
}

fn is_trust_domain_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_')
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
