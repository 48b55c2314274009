//! Signing-key persistence for the bus node.

use std::path::Path;

use anyhow::Context;
use ed25519_dalek::SigningKey;
use rand::Rng;

/// Load the node signing key from `path`, generating and saving a fresh
/// one when the file does not exist. The file holds the 32-byte seed in
/// hex.
pub fn load_or_generate(path: &Path) -> anyhow::Result<SigningKey> {
    if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading key file {}", path.display()))?;
        let bytes = hex::decode(raw.trim())
            .with_context(|| format!("decoding key file {}", path.display()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("key file must hold a 32-byte hex seed"))?;
        return Ok(SigningKey::from_bytes(&seed));
    }

    let mut seed = [0u8; 32];
    rand::rng().fill_bytes(&mut seed);
    let key = SigningKey::from_bytes(&seed);
    std::fs::write(path, hex::encode(seed))
        .with_context(|| format!("writing key file {}", path.display()))?;
    tracing::info!(path = %path.display(), "generated new signing key");
    Ok(key)
}

/// Parse a peer public key given as hex.
pub fn parse_public_key(raw: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(raw.trim()).context("peer key is not valid hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("peer key must be 32 bytes"))
}
