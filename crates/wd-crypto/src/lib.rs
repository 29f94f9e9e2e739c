//! Secret handling for the WatchDog hub.
//!
//! Provides [`SecretBox`] for AES-256-GCM sealing of agent secrets and
//! channel configs, Argon2id password hashing, constant-time comparison,
//! and CSPRNG generation of agent API secrets.

#![forbid(unsafe_code)]

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::password_hash::rand_core::OsRng as SaltRng;
use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand_core::{OsRng, RngCore};
use std::collections::HashMap;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Required length of the AEAD key (AES-256).
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length.
const NONCE_LEN: usize = 12;

/// Length in bytes of a generated agent API secret.
pub const API_SECRET_LEN: usize = 32;

/// Fixed-length buffer compared against when the looked-up record does not
/// exist, so unknown and known ids take the same time to reject.
pub const DUMMY_SECRET: [u8; API_SECRET_LEN] = [0u8; API_SECRET_LEN];

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be exactly {KEY_LEN} bytes, got {0}")]
    KeyLength(usize),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed: ciphertext corrupt or wrong key")]
    Decrypt,

    #[error("malformed sealed value: {0}")]
    Encoding(String),

    #[error("password hashing failed: {0}")]
    Hash(String),
}

// ─── SecretBox ───────────────────────────────────────────────────────────────

/// Seals and opens small secrets with AES-256-GCM.
///
/// The sealed form is `base64(nonce || ciphertext)` with a fresh random
/// nonce per seal, suitable for storage in a single column.
#[derive(Clone)]
pub struct SecretBox {
    key: [u8; KEY_LEN],
}

impl SecretBox {
    /// Build from raw key material. The key must be exactly 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| CryptoError::KeyLength(key.len()))?;
        Ok(Self { key })
    }

    /// Seal a plaintext, returning the encoded sealed form.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(&nonce);
        packed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(packed))
    }

    /// Open a sealed value produced by [`Self::seal`].
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, CryptoError> {
        let packed = BASE64
            .decode(sealed)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        if packed.len() < NONCE_LEN {
            return Err(CryptoError::Encoding("sealed value too short".to_string()));
        }
        let (nonce, ciphertext) = packed.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Seal a UTF-8 string.
    pub fn seal_str(&self, plaintext: &str) -> Result<String, CryptoError> {
        self.seal(plaintext.as_bytes())
    }

    /// Open a sealed value into a UTF-8 string.
    pub fn open_str(&self, sealed: &str) -> Result<String, CryptoError> {
        String::from_utf8(self.open(sealed)?).map_err(|_| CryptoError::Decrypt)
    }

    /// Seal a string→string mapping (alert channel configs).
    pub fn seal_map(&self, map: &HashMap<String, String>) -> Result<String, CryptoError> {
        let json = serde_json::to_vec(map).map_err(|_| CryptoError::Encrypt)?;
        self.seal(&json)
    }

    /// Open a sealed string→string mapping.
    pub fn open_map(&self, sealed: &str) -> Result<HashMap<String, String>, CryptoError> {
        let json = self.open(sealed)?;
        serde_json::from_slice(&json).map_err(|_| CryptoError::Decrypt)
    }
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBox(..)")
    }
}

// ─── Constant-time comparison ────────────────────────────────────────────────

/// Compare two byte buffers without early exit. Unequal lengths compare
/// unequal in constant time over the shorter input.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

// ─── Password hashing ────────────────────────────────────────────────────────

/// Hash a password with Argon2id and a fresh random salt.
pub fn hash_password(password: &str) -> Result<String, CryptoError> {
    let salt = SaltString::generate(&mut SaltRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| CryptoError::Hash(e.to_string()))
}

/// Verify a password against a stored Argon2 hash. Unparseable hashes
/// verify as false rather than erroring.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

// ─── Secret generation ───────────────────────────────────────────────────────

/// Generate a fresh agent API secret: 32 random bytes, hex-encoded.
pub fn generate_api_secret() -> String {
    let mut bytes = [0u8; API_SECRET_LEN];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_box() -> SecretBox {
        SecretBox::new(&[7u8; KEY_LEN]).expect("key")
    }

    #[test]
    fn test_seal_open_identity() {
        let sb = make_box();
        let sealed = sb.seal(b"hunter2").expect("seal");
        assert_eq!(sb.open(&sealed).expect("open"), b"hunter2");
    }

    #[test]
    fn test_seal_is_randomized() {
        let sb = make_box();
        let a = sb.seal(b"same").expect("seal a");
        let b = sb.seal(b"same").expect("seal b");
        assert_ne!(a, b, "two seals of the same plaintext must differ");
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let sealed = make_box().seal(b"secret").expect("seal");
        let other = SecretBox::new(&[9u8; KEY_LEN]).expect("key");
        assert!(matches!(other.open(&sealed), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let sb = make_box();
        assert!(sb.open("!!not base64!!").is_err());
        assert!(sb.open("AAAA").is_err()); // too short for a nonce
    }

    #[test]
    fn test_key_length_enforced() {
        assert!(matches!(
            SecretBox::new(&[0u8; 16]),
            Err(CryptoError::KeyLength(16))
        ));
    }

    #[test]
    fn test_map_roundtrip() {
        let sb = make_box();
        let mut config = HashMap::new();
        config.insert("webhook_url".to_string(), "https://hooks.example".to_string());
        config.insert("channel".to_string(), "#alerts".to_string());

        let sealed = sb.seal_map(&config).expect("seal");
        let back = sb.open_map(&sealed).expect("open");
        assert_eq!(back, config);
    }

    #[test]
    fn test_password_hash_verify() {
        let hash = hash_password("correct horse").expect("hash");
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("correct horse", "not-a-hash"));
    }

    #[test]
    fn test_generate_api_secret_shape() {
        let secret = generate_api_secret();
        assert_eq!(secret.len(), API_SECRET_LEN * 2);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(secret, generate_api_secret());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"", b"x"));
    }
}
