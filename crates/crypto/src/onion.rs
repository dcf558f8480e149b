//! Per-hop onion layer encryption.
//!
//! Each layer is sealed with a key derived from an X25519 exchange between a
//! fresh ephemeral secret and the hop's static key. The ephemeral public key
//! travels next to the ciphertext so the hop can derive the same key.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use swarmroute_core::PublicKey;
use x25519_dalek::EphemeralSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::keys::EncryptionKeypair;
use crate::{CryptoError, Result};

/// HKDF context string binding derived keys to this protocol
const ONION_KDF_INFO: &[u8] = b"swarmroute-onion-layer-v1";

/// XChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length
pub const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// SymmetricKey
// ---------------------------------------------------------------------------

/// 256-bit layer key, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

// ---------------------------------------------------------------------------
// DestinationContext
// ---------------------------------------------------------------------------

/// One sealed layer: what the hop receives plus the key it will derive
#[derive(Debug)]
pub struct DestinationContext {
    pub ciphertext: Vec<u8>,
    pub symmetric_key: SymmetricKey,
    pub ephemeral_key: PublicKey,
}

/// Seal `plaintext` so only the holder of `recipient`'s secret can open it.
///
/// A new ephemeral secret is drawn on every call.
pub fn encrypt_for_pubkey(recipient: &PublicKey, plaintext: &[u8]) -> Result<DestinationContext> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_key = *x25519_dalek::PublicKey::from(&ephemeral).as_bytes();

    let shared = ephemeral.diffie_hellman(&x25519_dalek::PublicKey::from(*recipient));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("non-contributory x25519 key".into()));
    }

    let symmetric_key = derive_symmetric_key(shared.as_bytes())?;
    let ciphertext = encrypt_symmetric(&symmetric_key, plaintext)?;

    Ok(DestinationContext {
        ciphertext,
        symmetric_key,
        ephemeral_key,
    })
}

/// Open a layer addressed to `keypair`, returning the plaintext and the
/// layer key (used by a destination to seal its reply).
pub fn decrypt_with_keypair(
    keypair: &EncryptionKeypair,
    ephemeral_key: &PublicKey,
    ciphertext: &[u8],
) -> Result<(Vec<u8>, SymmetricKey)> {
    let shared = keypair
        .secret
        .diffie_hellman(&x25519_dalek::PublicKey::from(*ephemeral_key));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("non-contributory x25519 key".into()));
    }

    let key = derive_symmetric_key(shared.as_bytes())?;
    let plaintext = decrypt_symmetric(&key, ciphertext)?;
    Ok((plaintext, key))
}

/// HKDF-SHA256 over an ECDH output
pub fn derive_symmetric_key(shared_secret: &[u8]) -> Result<SymmetricKey> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; 32];
    hk.expand(ONION_KDF_INFO, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let key = SymmetricKey(okm);
    okm.zeroize();
    Ok(key)
}

// ---------------------------------------------------------------------------
// Symmetric sealing
// ---------------------------------------------------------------------------

/// `nonce ‖ ciphertext ‖ tag`
pub fn encrypt_symmetric(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Inverse of [`encrypt_symmetric`]
pub fn decrypt_symmetric(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Malformed(format!(
            "ciphertext too short: {} bytes",
            data.len()
        )));
    }
    let (nonce, sealed) = data.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(XNonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::DecryptionFailed)
}
