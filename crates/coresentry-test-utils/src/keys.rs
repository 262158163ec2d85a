//! Ed25519 key fixtures.

use std::time::SystemTime;

use coresentry_core::auth::{self, AuthGate};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

/// A client key pair plus its public half in the form operators install.
pub struct TestKeys {
    pub signing: SigningKey,
    /// Base64 DER SubjectPublicKeyInfo.
    pub public_b64: String,
}

impl TestKeys {
    /// A fresh random key pair.
    pub fn generate() -> Self {
        Self::from_signing(SigningKey::generate(&mut OsRng))
    }

    /// A deterministic key pair derived from `seed`.
    pub fn from_seed(seed: u8) -> Self {
        Self::from_signing(SigningKey::from_bytes(&[seed; 32]))
    }

    fn from_signing(signing: SigningKey) -> Self {
        let public_b64 = auth::encode_public_key_base64(&signing.verifying_key())
            .expect("ed25519 public key always encodes");
        Self {
            signing,
            public_b64,
        }
    }

    /// Install this key as the gate's trusted key, persisting it.
    pub fn install(&self, gate: &AuthGate) {
        gate.set_public_key(&self.public_b64)
            .expect("failed to install test key");
    }

    /// `(X-Timestamp, X-Signature)` values signed at `now`.
    pub fn headers_at(&self, now: SystemTime) -> (String, String) {
        auth::sign_request(&self.signing, now)
    }

    /// `(X-Timestamp, X-Signature)` values signed now.
    pub fn headers(&self) -> (String, String) {
        self.headers_at(SystemTime::now())
    }
}
