//! SwarmRoute Crypto
//!
//! - X25519 encryption keypairs and per-hop [`DestinationContext`] sealing
//! - XChaCha20-Poly1305 symmetric layers keyed through HKDF-SHA256
//! - Ed25519 identity validation and request signatures

mod keys;
mod onion;
mod sign;

pub use keys::{is_valid_identity_key, EncryptionKeypair, SigningKeypair};
pub use onion::{
    decrypt_symmetric, decrypt_with_keypair, derive_symmetric_key, encrypt_for_pubkey,
    encrypt_symmetric, DestinationContext, SymmetricKey, NONCE_LEN, TAG_LEN,
};
pub use sign::{request_signable_data, sign_data, sign_request, verify_signature};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
