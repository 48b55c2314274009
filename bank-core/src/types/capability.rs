use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named class of bus actions a capability may authorize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Query and read patterns held by the peer
    ReadPatterns,
    /// Commit patterns into the peer's store
    WritePatterns,
    /// Open reasoning streams toward the peer
    StreamReasoning,
    /// Ask the peer for a bulk snapshot
    RequestSnapshot,
    /// Participate in periodic summary exchange
    Gossip,
}

impl Scope {
    const ALL: [Scope; 5] = [
        Scope::ReadPatterns,
        Scope::WritePatterns,
        Scope::StreamReasoning,
        Scope::RequestSnapshot,
        Scope::Gossip,
    ];

    fn bit(self) -> u16 {
        match self {
            Scope::ReadPatterns => 1 << 0,
            Scope::WritePatterns => 1 << 1,
            Scope::StreamReasoning => 1 << 2,
            Scope::RequestSnapshot => 1 << 3,
            Scope::Gossip => 1 << 4,
        }
    }

    /// High-cost scopes count one unit against a capability's spend cap
    /// per successful action; the rest are free.
    #[must_use]
    pub fn is_high_cost(self) -> bool {
        matches!(self, Scope::WritePatterns | Scope::RequestSnapshot)
    }

    /// Stable wire tag for this scope.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Scope::ReadPatterns => "read_patterns",
            Scope::WritePatterns => "write_patterns",
            Scope::StreamReasoning => "stream_reasoning",
            Scope::RequestSnapshot => "request_snapshot",
            Scope::Gossip => "gossip",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "read_patterns" => Ok(Scope::ReadPatterns),
            "write_patterns" => Ok(Scope::WritePatterns),
            "stream_reasoning" => Ok(Scope::StreamReasoning),
            "request_snapshot" => Ok(Scope::RequestSnapshot),
            "gossip" => Ok(Scope::Gossip),
            other => Err(format!("unknown scope: {other}")),
        }
    }
}

/// Compact set of [`Scope`] tags carried inside a capability token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSet(u16);

impl ScopeSet {
    /// The empty set.
    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    /// Set containing every scope.
    #[must_use]
    pub fn all() -> Self {
        Scope::ALL.iter().copied().collect()
    }

    /// True if `scope` is a member.
    #[must_use]
    pub fn contains(&self, scope: Scope) -> bool {
        self.0 & scope.bit() != 0
    }

    /// Add a scope, returning the extended set.
    #[must_use]
    pub fn with(mut self, scope: Scope) -> Self {
        self.0 |= scope.bit();
        self
    }

    /// Iterate members in the fixed vocabulary order.
    pub fn iter(&self) -> impl Iterator<Item = Scope> + '_ {
        Scope::ALL.into_iter().filter(|s| self.contains(*s))
    }
}

impl FromIterator<Scope> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = Scope>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), ScopeSet::with)
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<&str> = self.iter().map(Scope::tag).collect();
        f.write_str(&tags.join(","))
    }
}

/// Signed token bounding what a peer may do on a bus session.
///
/// Valid only while the signature verifies against `issuer_key`, the
/// current time lies in `[not_before, not_after]`, the requested scope is a
/// member of `scopes`, and cumulative spend from this
/// `(issuer, subject, nonce)` stays below `spend_cap`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentCapability {
    /// Ed25519 public key of the party that signed the token
    pub issuer_key: [u8; 32],
    /// Ed25519 public key of the party the token empowers
    pub subject_key: [u8; 32],
    /// Action classes the token authorizes
    pub scopes: ScopeSet,
    /// Start of the validity window
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub not_before: DateTime<Utc>,
    /// End of the validity window
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub not_after: DateTime<Utc>,
    /// Maximum number of high-cost actions the token may authorize
    pub spend_cap: u32,
    /// Uniquifier; reuse across sessions within the replay window is rejected
    pub nonce: [u8; 16],
    /// Ed25519 signature over the canonical encoding of the fields above
    pub signature: Vec<u8>,
}

impl IntentCapability {
    /// Canonical byte string the signature covers: the postcard encoding of
    /// every field except the signature itself.
    #[must_use]
    pub fn signing_bytes(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct SignBody<'a> {
            issuer_key: &'a [u8; 32],
            subject_key: &'a [u8; 32],
            scopes: ScopeSet,
            not_before_us: i64,
            not_after_us: i64,
            spend_cap: u32,
            nonce: &'a [u8; 16],
        }
        let body = SignBody {
            issuer_key: &self.issuer_key,
            subject_key: &self.subject_key,
            scopes: self.scopes,
            not_before_us: self.not_before.timestamp_micros(),
            not_after_us: self.not_after.timestamp_micros(),
            spend_cap: self.spend_cap,
            nonce: &self.nonce,
        };
        postcard::to_allocvec(&body).unwrap_or_default()
    }
}
