//! Ed25519 signing-key persistence: load a key from a hex file, or
//! generate and save one on first run. Factored out so both the
//! `swarm-node` binary and the standalone `swarm-keygen` tool can share it.

use anyhow::{Context, Result};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use std::path::Path;

/// Load the signing key at `path`, generating and persisting a new one if
/// it doesn't exist yet.
pub fn load_or_create(path: &Path) -> Result<SigningKey> {
    if path.exists() {
        load(path)
    } else {
        generate_and_save(path)
    }
}

pub fn load(path: &Path) -> Result<SigningKey> {
    let hex_str = std::fs::read_to_string(path)
        .with_context(|| format!("reading signing key from {}", path.display()))?;
    let bytes = hex::decode(hex_str.trim())
        .with_context(|| format!("invalid hex in signing key file {}", path.display()))?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("signing key in {} is not 32 bytes", path.display()))?;
    Ok(SigningKey::from_bytes(&array))
}

pub fn generate_and_save(path: &Path) -> Result<SigningKey> {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let key = SigningKey::from_bytes(&bytes);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    std::fs::write(path, hex::encode(bytes))
        .with_context(|| format!("writing signing key to {}", path.display()))?;
    tracing::info!(path = %path.display(), "generated new signing key");
    Ok(key)
}
