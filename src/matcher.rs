//! SPIFFE ID authorization policies.
//!
//! A [`Matcher`] is a stateless predicate over [`SpiffeId`]s. Leaf matchers
//! test one property of the peer ID; [`Matcher::All`], [`Matcher::AnyOf`]
//! and [`Matcher::Not`] compose them and short-circuit in list order.
//!
//! Matchers deserialise from YAML so policies can live in configuration:
//!
//! ```yaml
//! policy:
//!   any_of:
//!     - exact: "spiffe://example.org/client"
//!     - all:
//!         - trust_domain: "example.org"
//!         - subordinate_of: "spiffe://example.org/ns/ci"
//! ```
//!
//! | YAML                        | Matches                                    |
//! |-----------------------------|--------------------------------------------|
//! | `any`                       | every ID                                   |
//! | `exact: <id>`               | exactly `<id>`                             |
//! | `trust_domain: <td>`        | any ID in `<td>`                           |
//! | `one_of: [<id>, ...]`       | any listed ID                              |
//! | `subordinate_of: <id>`      | IDs strictly below `<id>`                  |
//! | `all: [<m>, ...]`           | every sub-matcher (empty list matches)     |
//! | `any_of: [<m>, ...]`        | some sub-matcher (empty list never matches)|
//! | `not: <m>`                  | IDs `<m>` rejects                          |

use serde::{Deserialize, Serialize};

use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::{Error, Result};

/// Authorization policy over peer SPIFFE IDs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Matcher {
    /// Accept every ID.
    #[default]
    Any,
    /// Accept exactly this ID.
    Exact(SpiffeId),
    /// Accept any ID in this trust domain, whatever its path.
    TrustDomain(TrustDomain),
    /// Accept any of these IDs.
    OneOf(Vec<SpiffeId>),
    /// Accept IDs strictly below this one.
    SubordinateOf(SpiffeId),
    /// Accept when every sub-matcher accepts.
    All(Vec<Matcher>),
    /// Accept when at least one sub-matcher accepts.
    AnyOf(Vec<Matcher>),
    /// Accept when the sub-matcher rejects.
    Not(Box<Matcher>),
}

/// Matcher accepting every ID.
#[must_use]
pub fn match_any() -> Matcher {
    Matcher::Any
}

/// Matcher accepting exactly `id`.
#[must_use]
pub fn match_exact(id: SpiffeId) -> Matcher {
    Matcher::Exact(id)
}

/// Matcher accepting every ID in `trust_domain`.
#[must_use]
pub fn match_trust_domain(trust_domain: TrustDomain) -> Matcher {
    Matcher::TrustDomain(trust_domain)
}

/// Matcher accepting any ID in `ids`.
#[must_use]
pub fn match_one_of(ids: impl IntoIterator<Item = SpiffeId>) -> Matcher {
    Matcher::OneOf(ids.into_iter().collect())
}

impl Matcher {
    /// Conjunction of `matchers`.
    #[must_use]
    pub fn and(matchers: impl IntoIterator<Item = Matcher>) -> Self {
        Self::All(matchers.into_iter().collect())
    }

    /// Disjunction of `matchers`.
    #[must_use]
    pub fn or(matchers: impl IntoIterator<Item = Matcher>) -> Self {
        Self::AnyOf(matchers.into_iter().collect())
    }

    /// Negation of `matcher`.
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(matcher: Matcher) -> Self {
        Self::Not(Box::new(matcher))
    }

    /// Test `id` against the policy.
    ///
    /// # Errors
    ///
    /// Returns `Error::Authorization` with a diagnostic reason when the policy
    /// rejects `id`. The reason is for logs only.
    pub fn test(&self, id: &SpiffeId) -> Result<()> {
        self.reject_reason(id)
            .map_or(Ok(()), |reason| Err(Error::unauthorized(id, reason)))
    }

    /// Boolean form of [`Matcher::test`].
    #[must_use]
    pub fn matches(&self, id: &SpiffeId) -> bool {
        self.reject_reason(id).is_none()
    }

    /// `None` when `id` is accepted, otherwise why it was not.
    fn reject_reason(&self, id: &SpiffeId) -> Option<String> {
        match self {
            Self::Any => None,
            Self::Exact(expected) => {
                (id != expected).then(|| format!("expected {expected}"))
            }
            Self::TrustDomain(td) => (!id.is_member_of(td))
                .then(|| format!("expected a member of trust domain \"{td}\"")),
            Self::OneOf(ids) => (!ids.contains(id)).then(|| {
                let listed: Vec<String> = ids.iter().map(ToString::to_string).collect();
                format!("expected one of [{}]", listed.join(", "))
            }),
            Self::SubordinateOf(parent) => (!id.is_subordinate_of(parent))
                .then(|| format!("expected an ID below {parent}")),
            Self::All(matchers) => matchers.iter().find_map(|m| m.reject_reason(id)),
            Self::AnyOf(matchers) => {
                let mut reasons = Vec::with_capacity(matchers.len());
                for m in matchers {
                    match m.reject_reason(id) {
                        None => return None,
                        Some(reason) => reasons.push(reason),
                    }
                }
                if reasons.is_empty() {
                    Some("no alternative configured".to_owned())
                } else {
                    Some(reasons.join("; or "))
                }
            }
            Self::Not(inner) => inner
                .reject_reason(id)
                .is_none()
                .then(|| "matched a negated policy".to_owned()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SpiffeId {
        SpiffeId::parse(s).unwrap()
    }

    fn td(s: &str) -> TrustDomain {
        TrustDomain::new(s).unwrap()
    }

    /// Policies are written in map form (`exact: ...`), not YAML tags.
    fn from_yaml(yaml: &str) -> std::result::Result<Matcher, serde_yaml::Error> {
        serde_yaml::with::singleton_map_recursive::deserialize(serde_yaml::Deserializer::from_str(
            yaml,
        ))
    }

    // ── leaf matchers ────────────────────────────────────────────────────────

    #[test]
    fn any_accepts_everything() {
        assert!(match_any().test(&id("spiffe://anything.example/x")).is_ok());
    }

    #[test]
    fn exact_accepts_only_the_same_id() {
        let client = id("spiffe://example.org/client");
        let m = match_exact(client.clone());
        assert!(m.test(&client).is_ok());
        assert!(m.test(&id("spiffe://example.org/client/")).is_ok());
        for other in [
            "spiffe://example.org/attacker",
            "spiffe://example.org/client/sub",
            "spiffe://example.org",
            "spiffe://example.com/client",
        ] {
            let err = m.test(&id(other)).unwrap_err();
            assert!(matches!(err, Error::Authorization { .. }), "{other}");
        }
    }

    #[test]
    fn trust_domain_ignores_path() {
        let m = match_trust_domain(td("example.org"));
        assert!(m.matches(&id("spiffe://example.org")));
        assert!(m.matches(&id("spiffe://example.org/a/b/c")));
        assert!(!m.matches(&id("spiffe://example.com/a")));
        assert!(!m.matches(&id("spiffe://sub.example.org/a")));
    }

    #[test]
    fn one_of_is_set_membership() {
        let m = match_one_of([id("spiffe://example.org/a"), id("spiffe://example.org/b")]);
        assert!(m.matches(&id("spiffe://example.org/b")));
        assert!(!m.matches(&id("spiffe://example.org/c")));
        assert!(!match_one_of([]).matches(&id("spiffe://example.org/a")));
    }

    #[test]
    fn subordinate_of_excludes_parent() {
        let m = Matcher::SubordinateOf(id("spiffe://example.org/ns/ci"));
        assert!(m.matches(&id("spiffe://example.org/ns/ci/runner")));
        assert!(!m.matches(&id("spiffe://example.org/ns/ci")));
    }

    // ── composition ──────────────────────────────────────────────────────────

    #[test]
    fn and_requires_every_matcher() {
        let m = Matcher::and([
            match_trust_domain(td("example.org")),
            Matcher::not(match_exact(id("spiffe://example.org/attacker"))),
        ]);
        assert!(m.matches(&id("spiffe://example.org/client")));
        assert!(!m.matches(&id("spiffe://example.org/attacker")));
        assert!(!m.matches(&id("spiffe://example.com/client")));
        assert!(Matcher::and([]).matches(&id("spiffe://example.org/x")));
    }

    #[test]
    fn or_requires_some_matcher() {
        let m = Matcher::or([
            match_exact(id("spiffe://example.org/client")),
            match_trust_domain(td("partner.io")),
        ]);
        assert!(m.matches(&id("spiffe://example.org/client")));
        assert!(m.matches(&id("spiffe://partner.io/anything")));
        assert!(!m.matches(&id("spiffe://example.org/server")));
        assert!(!Matcher::or([]).matches(&id("spiffe://example.org/x")));
    }

    #[test]
    fn or_reason_lists_every_alternative() {
        let m = Matcher::or([
            match_exact(id("spiffe://example.org/a")),
            match_exact(id("spiffe://example.org/b")),
        ]);
        let err = m.test(&id("spiffe://example.org/c")).unwrap_err().to_string();
        assert!(err.contains("spiffe://example.org/a"), "{err}");
        assert!(err.contains("spiffe://example.org/b"), "{err}");
    }

    #[test]
    fn double_negation_restores_the_matcher() {
        let inner = match_exact(id("spiffe://example.org/a"));
        let m = Matcher::not(Matcher::not(inner.clone()));
        for s in ["spiffe://example.org/a", "spiffe://example.org/b"] {
            assert_eq!(m.matches(&id(s)), inner.matches(&id(s)));
        }
    }

    // ── configuration form ───────────────────────────────────────────────────

    #[test]
    fn deserialises_from_yaml_expression() {
        let yaml = r#"
any_of:
  - exact: "spiffe://example.org/client"
  - all:
      - trust_domain: "example.org"
      - not:
          exact: "spiffe://example.org/attacker"
"#;
        let m = from_yaml(yaml).unwrap();
        assert!(m.matches(&id("spiffe://example.org/client")));
        assert!(m.matches(&id("spiffe://example.org/server")));
        assert!(!m.matches(&id("spiffe://example.org/attacker")));
    }

    #[test]
    fn unit_any_deserialises_from_bare_word() {
        let m = from_yaml("any").unwrap();
        assert_eq!(m, Matcher::Any);
    }

    #[test]
    fn invalid_id_in_policy_fails_to_deserialise() {
        // GIVEN: a well-formed policy naming a non-SPIFFE URI
        let err = from_yaml("exact: \"https://example.org\"").unwrap_err();

        // THEN: the failure is about the ID, not the policy shape
        assert!(err.to_string().contains("Invalid SPIFFE ID"), "{err}");
    }

    #[test]
    fn one_of_deserialises_from_yaml_list() {
        let yaml = r#"
one_of:
  - "spiffe://example.org/a"
  - "spiffe://example.org/b"
"#;
        let m = from_yaml(yaml).unwrap();
        assert!(m.matches(&id("spiffe://example.org/b")));
        assert!(!m.matches(&id("spiffe://example.org/c")));
    }
}
