use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use swarmroute_core::PublicKey;
use x25519_dalek::StaticSecret;

/// Ed25519 keypair: a node's routing identity, or a mailbox owner's signing key
pub struct SigningKeypair {
    pub(crate) signing_key: SigningKey,
}

impl SigningKeypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn public_key_bytes(&self) -> PublicKey {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

/// X25519 keypair used to open onion layers addressed to a node
pub struct EncryptionKeypair {
    pub(crate) secret: StaticSecret,
    public: x25519_dalek::PublicKey,
}

impl EncryptionKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> PublicKey {
        *self.public.as_bytes()
    }
}

/// Whether `bytes` decode to a usable ed25519 point
pub fn is_valid_identity_key(bytes: &PublicKey) -> bool {
    VerifyingKey::from_bytes(bytes).is_ok()
}
