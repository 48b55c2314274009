//! # Capability Verification
//!
//! Pure, synchronous validation of signed intent capabilities, plus the
//! keyring of trusted issuer keys.
//!
//! The verifier is a plain function so stream handlers on any task can
//! invoke it without scheduling; key material lives in a [`Keyring`]
//! passed by reference. Spend accounting and replay tracking are the
//! caller's state (the bus session keeps both); the verifier only judges
//! the numbers it is handed.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::types::{IntentCapability, Scope, ScopeSet};

/// Why a capability check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    /// The signature does not verify against the issuer key (or the nonce
    /// was replayed)
    #[error("capability signature invalid")]
    SignatureInvalid,
    /// The validity window has ended
    #[error("capability expired")]
    Expired,
    /// The validity window has not started
    #[error("capability not yet valid")]
    NotYetValid,
    /// The requested scope is not among the token's scopes
    #[error("scope denied")]
    ScopeDenied,
    /// The spend cap has been exhausted
    #[error("spend cap exhausted")]
    SpendExhausted,
    /// The issuer key is not in the keyring
    #[error("unknown issuer")]
    UnknownIssuer,
}

impl CapabilityError {
    /// Short stable code suitable for exposing to remote peers.
    pub fn reason_code(&self) -> &'static str {
        match self {
            CapabilityError::SignatureInvalid => "signature_invalid",
            CapabilityError::Expired => "expired",
            CapabilityError::NotYetValid => "not_yet_valid",
            CapabilityError::ScopeDenied => "scope_denied",
            CapabilityError::SpendExhausted => "spend_exhausted",
            CapabilityError::UnknownIssuer => "unknown_issuer",
        }
    }
}

/// Registry of issuer public keys this instance trusts.
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    trusted: HashSet<[u8; 32]>,
}

impl Keyring {
    /// Empty keyring; trusts nobody.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an issuer key as trusted.
    pub fn trust(&mut self, issuer_key: [u8; 32]) {
        self.trusted.insert(issuer_key);
    }

    /// True if the issuer key is trusted.
    #[must_use]
    pub fn is_trusted(&self, issuer_key: &[u8; 32]) -> bool {
        self.trusted.contains(issuer_key)
    }

    /// Number of trusted issuers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trusted.len()
    }

    /// True if no issuer is trusted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trusted.is_empty()
    }
}

/// Sign a capability for `subject_key` with the issuer's signing key.
#[must_use]
pub fn issue_capability(
    issuer: &SigningKey,
    subject_key: [u8; 32],
    scopes: ScopeSet,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    spend_cap: u32,
    nonce: [u8; 16],
) -> IntentCapability {
    let mut capability = IntentCapability {
        issuer_key: issuer.verifying_key().to_bytes(),
        subject_key,
        scopes,
        not_before,
        not_after,
        spend_cap,
        nonce,
        signature: Vec::new(),
    };
    let signature = issuer.sign(&capability.signing_bytes());
    capability.signature = signature.to_bytes().to_vec();
    capability
}

/// Validate a capability's issuer, signature, and validity window without
/// naming a scope. Used at session handshake, where no action is being
/// requested yet.
pub fn verify_capability_bounds(
    capability: &IntentCapability,
    now: DateTime<Utc>,
    keyring: &Keyring,
) -> Result<(), CapabilityError> {
    if !keyring.is_trusted(&capability.issuer_key) {
        return Err(CapabilityError::UnknownIssuer);
    }
    let verifying_key = VerifyingKey::from_bytes(&capability.issuer_key)
        .map_err(|_| CapabilityError::SignatureInvalid)?;
    let signature = Signature::from_slice(&capability.signature)
        .map_err(|_| CapabilityError::SignatureInvalid)?;
    verifying_key
        .verify(&capability.signing_bytes(), &signature)
        .map_err(|_| CapabilityError::SignatureInvalid)?;
    if now < capability.not_before {
        return Err(CapabilityError::NotYetValid);
    }
    if now > capability.not_after {
        return Err(CapabilityError::Expired);
    }
    Ok(())
}

/// Validate a capability for one requested action.
///
/// `observed_spend` is the number of high-cost actions this
/// `(issuer, subject, nonce)` has already been charged for. Checks run in
/// a fixed order so a token failing several ways reports deterministically:
/// issuer, signature, validity window, scope, spend.
pub fn verify_capability(
    capability: &IntentCapability,
    now: DateTime<Utc>,
    requested: Scope,
    observed_spend: u32,
    keyring: &Keyring,
) -> Result<(), CapabilityError> {
    if !keyring.is_trusted(&capability.issuer_key) {
        return Err(CapabilityError::UnknownIssuer);
    }

    let verifying_key = VerifyingKey::from_bytes(&capability.issuer_key)
        .map_err(|_| CapabilityError::SignatureInvalid)?;
    let signature = Signature::from_slice(&capability.signature)
        .map_err(|_| CapabilityError::SignatureInvalid)?;
    verifying_key
        .verify(&capability.signing_bytes(), &signature)
        .map_err(|_| CapabilityError::SignatureInvalid)?;

    if now < capability.not_before {
        return Err(CapabilityError::NotYetValid);
    }
    if now > capability.not_after {
        return Err(CapabilityError::Expired);
    }
    if !capability.scopes.contains(requested) {
        return Err(CapabilityError::ScopeDenied);
    }
    if requested.is_high_cost() && observed_spend >= capability.spend_cap {
        return Err(CapabilityError::SpendExhausted);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_issuer() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn capability_with(scopes: ScopeSet, spend_cap: u32) -> (IntentCapability, Keyring) {
        let issuer = test_issuer();
        let now = Utc::now();
        let capability = issue_capability(
            &issuer,
            [9u8; 32],
            scopes,
            now - Duration::minutes(1),
            now + Duration::hours(1),
            spend_cap,
            [3u8; 16],
        );
        let mut keyring = Keyring::new();
        keyring.trust(issuer.verifying_key().to_bytes());
        (capability, keyring)
    }

    #[test]
    fn valid_token_passes() {
        let (cap, keyring) = capability_with(ScopeSet::all(), 2);
        assert!(verify_capability(&cap, Utc::now(), Scope::ReadPatterns, 0, &keyring).is_ok());
    }

    #[test]
    fn unknown_issuer_rejected() {
        let (cap, _) = capability_with(ScopeSet::all(), 2);
        let empty = Keyring::new();
        assert_eq!(
            verify_capability(&cap, Utc::now(), Scope::ReadPatterns, 0, &empty),
            Err(CapabilityError::UnknownIssuer)
        );
    }

    #[test]
    fn tampered_token_fails_signature() {
        let (mut cap, keyring) = capability_with(ScopeSet::empty().with(Scope::ReadPatterns), 2);
        cap.spend_cap = 1_000_000;
        assert_eq!(
            verify_capability(&cap, Utc::now(), Scope::ReadPatterns, 0, &keyring),
            Err(CapabilityError::SignatureInvalid)
        );
    }

    #[test]
    fn window_is_enforced() {
        let (cap, keyring) = capability_with(ScopeSet::all(), 2);
        assert_eq!(
            verify_capability(
                &cap,
                cap.not_before - Duration::seconds(1),
                Scope::ReadPatterns,
                0,
                &keyring
            ),
            Err(CapabilityError::NotYetValid)
        );
        assert_eq!(
            verify_capability(
                &cap,
                cap.not_after + Duration::seconds(1),
                Scope::ReadPatterns,
                0,
                &keyring
            ),
            Err(CapabilityError::Expired)
        );
    }

    #[test]
    fn scope_is_enforced() {
        let (cap, keyring) = capability_with(ScopeSet::empty().with(Scope::Gossip), 2);
        assert_eq!(
            verify_capability(&cap, Utc::now(), Scope::WritePatterns, 0, &keyring),
            Err(CapabilityError::ScopeDenied)
        );
    }

    #[test]
    fn spend_cap_binds_high_cost_scopes_only() {
        let (cap, keyring) = capability_with(ScopeSet::all(), 2);
        // Two units spent: a third write is refused
        assert_eq!(
            verify_capability(&cap, Utc::now(), Scope::WritePatterns, 2, &keyring),
            Err(CapabilityError::SpendExhausted)
        );
        // Reads and gossip never consume the cap
        assert!(verify_capability(&cap, Utc::now(), Scope::ReadPatterns, 2, &keyring).is_ok());
        assert!(verify_capability(&cap, Utc::now(), Scope::Gossip, 2, &keyring).is_ok());
    }

    #[test]
    fn zero_cap_refuses_first_write() {
        let (cap, keyring) = capability_with(ScopeSet::all(), 0);
        assert_eq!(
            verify_capability(&cap, Utc::now(), Scope::WritePatterns, 0, &keyring),
            Err(CapabilityError::SpendExhausted)
        );
    }
}
