//! Signature-based request authentication.
//!
//! Every mutating control request carries two headers: a decimal Unix
//! timestamp and a base64 Ed25519 signature over that exact timestamp
//! string. The [`AuthGate`] holds the single trusted public key and checks
//! both, rejecting timestamps outside the drift window to bound replay.
//!
//! ```text
//! client                                   AuthGate
//!   ts  = "1718000000"
//!   sig = base64(sign(sk, ts))
//!   ── X-Timestamp: ts, X-Signature: sig ──▶ parse ts → drift check
//!                                            → key loaded? → verify(pk, ts, sig)
//! ```
//!
//! The trusted key is installed once by an operator (base64 DER
//! SubjectPublicKeyInfo) and persisted as PEM under the key directory.
//! Re-initialization replaces it; there is no rotation history.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::spki::{self, SubjectPublicKeyInfoRef};
use ed25519_dalek::pkcs8::{DecodePublicKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use tracing::{debug, info, warn};

/// File name of the persisted trusted key inside the key directory.
pub const PUBLIC_KEY_FILE: &str = "public_key.pem";

/// Header carrying the decimal Unix timestamp.
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";

/// Header carrying the base64 signature over the timestamp string.
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Object identifier of the Ed25519 signature algorithm (RFC 8410).
const ED25519_OID: &str = "1.3.101.112";

/// Errors from key management and request authentication.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing authentication headers")]
    MissingCredentials,

    #[error("invalid timestamp format: {0:?}")]
    InvalidTimestamp(String),

    #[error("request expired or timestamp invalid (drift {drift_secs}s exceeds {max_secs}s)")]
    ExpiredTimestamp { drift_secs: u64, max_secs: u64 },

    #[error("service is not initialized: no trusted public key")]
    KeyNotInitialized,

    #[error("signature is not valid base64: {0}")]
    SignatureEncoding(base64::DecodeError),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("public key is not valid base64: {0}")]
    KeyEncoding(base64::DecodeError),

    #[error("failed to parse public key DER: {0}")]
    KeyDer(String),

    #[error("public key is not an Ed25519 key (algorithm {0})")]
    UnsupportedKeyType(String),

    #[error("invalid PEM in {path}: {reason}")]
    KeyPem { path: PathBuf, reason: String },

    #[error("key file IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Holds the trusted public key and authenticates control requests.
///
/// Constructed once at daemon startup and shared through the router state.
#[derive(Debug)]
pub struct AuthGate {
    key_path: PathBuf,
    max_drift: Duration,
    key: RwLock<Option<VerifyingKey>>,
}

impl AuthGate {
    /// Create a gate with no key loaded. The key will live at
    /// `<key_dir>/public_key.pem`.
    pub fn new(key_dir: impl AsRef<Path>, max_drift: Duration) -> Self {
        Self {
            key_path: key_dir.as_ref().join(PUBLIC_KEY_FILE),
            max_drift,
            key: RwLock::new(None),
        }
    }

    /// Create the key directory if needed and load a previously persisted key.
    ///
    /// A missing key file is not an error: the gate starts uninitialized and
    /// authenticated requests fail with [`AuthError::KeyNotInitialized`].
    pub fn open(key_dir: impl AsRef<Path>, max_drift: Duration) -> Result<Self, AuthError> {
        let key_dir = key_dir.as_ref();
        std::fs::create_dir_all(key_dir).map_err(|source| AuthError::Io {
            path: key_dir.to_path_buf(),
            source,
        })?;

        let gate = Self::new(key_dir, max_drift);
        if gate.key_path.exists() {
            gate.load()?;
        } else {
            warn!(path = %gate.key_path.display(), "No trusted public key found, service is uninitialized");
        }
        Ok(gate)
    }

    /// (Re)load the persisted key from disk.
    pub fn load(&self) -> Result<(), AuthError> {
        let pem = std::fs::read(&self.key_path).map_err(|source| AuthError::Io {
            path: self.key_path.clone(),
            source,
        })?;
        let (label, der) =
            spki::der::pem::decode_vec(&pem).map_err(|e| AuthError::KeyPem {
                path: self.key_path.clone(),
                reason: e.to_string(),
            })?;
        if label != "PUBLIC KEY" {
            return Err(AuthError::KeyPem {
                path: self.key_path.clone(),
                reason: format!("unexpected PEM label {label:?}"),
            });
        }

        let key = decode_public_key_der(&der)?;
        self.install_key(key);
        info!(path = %self.key_path.display(), "Trusted public key loaded");
        Ok(())
    }

    /// Install a new trusted key from base64-encoded SubjectPublicKeyInfo DER.
    ///
    /// The key is persisted as PEM before it replaces the in-memory key, so a
    /// failed write leaves the previous key in effect.
    pub fn set_public_key(&self, public_key_base64: &str) -> Result<(), AuthError> {
        let der = BASE64
            .decode(public_key_base64.trim())
            .map_err(AuthError::KeyEncoding)?;
        let key = decode_public_key_der(&der)?;

        let pem = key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AuthError::KeyDer(e.to_string()))?;

        if let Some(dir) = self.key_path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| AuthError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&self.key_path, pem).map_err(|source| AuthError::Io {
            path: self.key_path.clone(),
            source,
        })?;

        self.install_key(key);
        info!(path = %self.key_path.display(), "Trusted public key saved");
        Ok(())
    }

    /// Replace the in-memory key without touching disk.
    pub fn install_key(&self, key: VerifyingKey) {
        let mut slot = self.key.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(key);
    }

    /// Whether a trusted key is loaded.
    pub fn is_initialized(&self) -> bool {
        self.current_key().is_some()
    }

    /// Path of the persisted key file.
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Maximum accepted clock drift of a request timestamp.
    pub fn max_drift(&self) -> Duration {
        self.max_drift
    }

    /// Verify a base64 signature over `message` with the trusted key.
    pub fn verify_signature(&self, message: &str, signature_base64: &str) -> Result<(), AuthError> {
        let key = self.current_key().ok_or(AuthError::KeyNotInitialized)?;

        let raw = BASE64
            .decode(signature_base64.trim())
            .map_err(AuthError::SignatureEncoding)?;
        let signature = Signature::from_slice(&raw).map_err(|_| AuthError::SignatureInvalid)?;

        key.verify(message.as_bytes(), &signature)
            .map_err(|_| AuthError::SignatureInvalid)
    }

    /// Authenticate a request from its timestamp and signature headers.
    pub fn authenticate(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
    ) -> Result<(), AuthError> {
        self.authenticate_at(timestamp, signature, SystemTime::now())
    }

    /// Like [`authenticate`](Self::authenticate) with an explicit "now".
    pub fn authenticate_at(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        now: SystemTime,
    ) -> Result<(), AuthError> {
        let (Some(timestamp), Some(signature)) = (
            timestamp.filter(|t| !t.is_empty()),
            signature.filter(|s| !s.is_empty()),
        ) else {
            return Err(AuthError::MissingCredentials);
        };

        let claimed: i64 = timestamp
            .parse()
            .map_err(|_| AuthError::InvalidTimestamp(timestamp.to_string()))?;
        let now_secs = unix_secs(now);
        let drift_secs = now_secs.abs_diff(claimed);
        if drift_secs > self.max_drift.as_secs() {
            debug!(claimed, now = now_secs, "Rejecting request outside drift window");
            return Err(AuthError::ExpiredTimestamp {
                drift_secs,
                max_secs: self.max_drift.as_secs(),
            });
        }

        if !self.is_initialized() {
            return Err(AuthError::KeyNotInitialized);
        }

        self.verify_signature(timestamp, signature)
    }

    fn current_key(&self) -> Option<VerifyingKey> {
        *self.key.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Decode SubjectPublicKeyInfo DER into an Ed25519 verifying key.
///
/// Malformed DER and a non-Ed25519 algorithm are reported distinctly.
pub fn decode_public_key_der(der: &[u8]) -> Result<VerifyingKey, AuthError> {
    let info =
        SubjectPublicKeyInfoRef::try_from(der).map_err(|e| AuthError::KeyDer(e.to_string()))?;
    let oid = info.algorithm.oid.to_string();
    if oid != ED25519_OID {
        return Err(AuthError::UnsupportedKeyType(oid));
    }
    VerifyingKey::from_public_key_der(der).map_err(|e| AuthError::KeyDer(e.to_string()))
}

/// Encode a verifying key as base64 SubjectPublicKeyInfo DER, the format
/// accepted by [`AuthGate::set_public_key`].
pub fn encode_public_key_base64(key: &VerifyingKey) -> Result<String, AuthError> {
    let der = key
        .to_public_key_der()
        .map_err(|e| AuthError::KeyDer(e.to_string()))?;
    Ok(BASE64.encode(der.as_bytes()))
}

/// Produce the `(X-Timestamp, X-Signature)` header values for `now`.
pub fn sign_request(key: &SigningKey, now: SystemTime) -> (String, String) {
    let timestamp = unix_secs(now).to_string();
    let signature = BASE64.encode(key.sign(timestamp.as_bytes()).to_bytes());
    (timestamp, signature)
}

fn unix_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}
