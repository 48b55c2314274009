//! Session state shared with stream handler tasks.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;

use bank_core::capability::{verify_capability, CapabilityError, Keyring};
use bank_core::types::{IntentCapability, Scope};

struct CapabilityState {
    capability: IntentCapability,
    spent: u32,
}

/// Capability and spend accounting for one session.
///
/// Handlers on any task authorize through this synchronously; rotation
/// swaps the token and resets spend atomically under the same lock, so a
/// frame is judged against exactly one capability.
pub struct SessionShared {
    /// Long-term public key of the peer (issuer of the accepted capability)
    pub peer_key: [u8; 32],
    /// Process-unique session number
    pub session_id: u64,
    keyring: Arc<Keyring>,
    state: Mutex<CapabilityState>,
}

impl SessionShared {
    pub(crate) fn new(
        peer_key: [u8; 32],
        session_id: u64,
        keyring: Arc<Keyring>,
        capability: IntentCapability,
    ) -> Self {
        Self {
            peer_key,
            session_id,
            keyring,
            state: Mutex::new(CapabilityState {
                capability,
                spent: 0,
            }),
        }
    }

    /// Authorize one action under the current capability.
    ///
    /// On success a high-cost scope is charged immediately, so the check
    /// and the spend are one atomic step.
    pub fn authorize(&self, scope: Scope) -> Result<(), CapabilityError> {
        let mut state = self.state.lock();
        verify_capability(
            &state.capability,
            Utc::now(),
            scope,
            state.spent,
            &self.keyring,
        )?;
        if scope.is_high_cost() {
            state.spent += 1;
        }
        Ok(())
    }

    /// Replace the session capability; subsequent frames are judged
    /// against the new token with a fresh spend counter.
    pub fn rotate(&self, capability: IntentCapability) {
        let mut state = self.state.lock();
        state.capability = capability;
        state.spent = 0;
    }

    /// High-cost units charged so far under the current token.
    #[must_use]
    pub fn observed_spend(&self) -> u32 {
        self.state.lock().spent
    }

    /// Nonce of the currently accepted capability.
    #[must_use]
    pub fn capability_nonce(&self) -> [u8; 16] {
        self.state.lock().capability.nonce
    }
}
