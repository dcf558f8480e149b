use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};

use crate::keys::SigningKeypair;

/// Sign data with a signing keypair
pub fn sign_data(keypair: &SigningKeypair, data: &[u8]) -> [u8; 64] {
    let signature: Signature = keypair.signing_key.sign(data);
    signature.to_bytes()
}

/// Verify a signature
pub fn verify_signature(pubkey: &[u8; 32], data: &[u8], signature: &[u8; 64]) -> bool {
    let verifying_key = match VerifyingKey::from_bytes(pubkey) {
        Ok(vk) => vk,
        Err(_) => return false,
    };

    let signature = Signature::from_bytes(signature);

    verifying_key.verify(data, &signature).is_ok()
}

/// Bytes a mailbox owner signs to authorize `method` at `timestamp_ms`
pub fn request_signable_data(method: &str, timestamp_ms: u64) -> Vec<u8> {
    format!("{}{}", method, timestamp_ms).into_bytes()
}

/// Base64 signature authorizing a storage request
pub fn sign_request(keypair: &SigningKeypair, method: &str, timestamp_ms: u64) -> String {
    BASE64.encode(sign_data(keypair, &request_signable_data(method, timestamp_ms)))
}
