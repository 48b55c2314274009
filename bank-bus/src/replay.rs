//! Bounded nonce-replay window shared by all sessions of a node.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

type ReplayKey = ([u8; 32], [u8; 16]);

/// LRU of recently accepted `(issuer_key, nonce)` pairs.
///
/// A capability nonce reused across sessions within the retention window
/// is rejected as a replay.
pub struct ReplayGuard {
    seen: Mutex<LruCache<ReplayKey, ()>>,
}

impl ReplayGuard {
    /// Guard retaining up to `window` entries.
    #[must_use]
    pub fn new(window: usize) -> Self {
        let capacity = NonZeroUsize::new(window.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record `(issuer, nonce)`; returns `false` if it was already seen
    /// within the window.
    pub fn check_and_insert(&self, issuer: [u8; 32], nonce: [u8; 16]) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains(&(issuer, nonce)) {
            return false;
        }
        seen.put((issuer, nonce), ());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_nonce_passes_replay_fails() {
        let guard = ReplayGuard::new(8);
        assert!(guard.check_and_insert([1; 32], [2; 16]));
        assert!(!guard.check_and_insert([1; 32], [2; 16]));
        // Same nonce from a different issuer is a different key
        assert!(guard.check_and_insert([3; 32], [2; 16]));
    }

    #[test]
    fn window_is_bounded() {
        let guard = ReplayGuard::new(2);
        assert!(guard.check_and_insert([1; 32], [1; 16]));
        assert!(guard.check_and_insert([2; 32], [2; 16]));
        assert!(guard.check_and_insert([3; 32], [3; 16]));
        // Oldest entry fell out of the window and passes again
        assert!(guard.check_and_insert([1; 32], [1; 16]));
    }
}
