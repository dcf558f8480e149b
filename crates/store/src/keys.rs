//! Identity key files

use std::path::Path;

use swarmroute_crypto::SigningKeypair;
use thiserror::Error;
use tracing::info;

use crate::paths::expand_path;

#[derive(Error, Debug)]
pub enum KeyfileError {
    #[error("Failed to read keyfile: {0}")]
    Read(std::io::Error),

    #[error("Failed to write keyfile: {0}")]
    Write(std::io::Error),

    #[error("Invalid keyfile format: {0}")]
    InvalidFormat(String),

    #[error("Failed to create directory: {0}")]
    CreateDir(std::io::Error),
}

/// Load the ed25519 key that signs an identity's retrieves, creating it on
/// first use. The file holds the raw 32-byte secret.
pub fn load_or_generate_signing_keypair(keyfile: &Path) -> Result<SigningKeypair, KeyfileError> {
    let path = expand_path(keyfile);

    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(KeyfileError::CreateDir)?;
        }
    }

    if path.exists() {
        let bytes = std::fs::read(&path).map_err(KeyfileError::Read)?;
        let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            KeyfileError::InvalidFormat(format!("Expected 32 bytes, got {}", bytes.len()))
        })?;
        info!("Loaded signing key from {:?}", path);
        return Ok(SigningKeypair::from_secret_bytes(&secret));
    }

    let keypair = SigningKeypair::generate();
    std::fs::write(&path, keypair.secret_key_bytes()).map_err(KeyfileError::Write)?;
    info!("Generated new signing key, saved to {:?}", path);
    Ok(keypair)
}
