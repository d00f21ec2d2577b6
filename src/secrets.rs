//! Upstream-key plaintext vault.
//!
//! Resolves the open question in SPEC_FULL.md §11 ("secure resolution from
//! fingerprint to plaintext for the outbound request") as option (a):
//! plaintexts are encrypted at rest under a process-held AES-256-GCM key
//! and decrypted only at the instant the Proxy Engine needs to set the
//! `Authorization` header. The fingerprint itself remains the plain SHA-256
//! of the plaintext and is unaffected by this scheme — the vault stores an
//! additional ciphertext field keyed by that same fingerprint.
//!
//! Mirrors the nonce-prefixed-ciphertext AES-256-GCM pattern used elsewhere
//! in this corpus for holding a secret past the instant it's received.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::VaultError;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A 32-byte AES-256-GCM key, zeroized on drop.
pub struct VaultKey(Zeroizing<[u8; 32]>);

impl VaultKey {
    pub fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| VaultError::InvalidKeyLength(0))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        if bytes.len() != 32 {
            return Err(VaultError::InvalidKeyLength(bytes.len()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(bytes);
        Ok(Self(Zeroizing::new(key)))
    }

    /// Generates a fresh random key. Only appropriate for local development
    /// — an ephemeral key loses every stored upstream plaintext on restart.
    pub fn generate_ephemeral() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self(Zeroizing::new(key))
    }
}

/// Computes the canonical SHA-256 hex fingerprint of a plaintext secret.
/// Used identically for client-key and upstream-key fingerprinting.
pub fn fingerprint(plaintext: &str) -> String {
    let digest = Sha256::digest(plaintext.as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Encrypts `plaintext`, returning a base64 blob of `nonce || ciphertext+tag`.
pub fn encrypt(plaintext: &str, key: &VaultKey) -> Result<String, VaultError> {
    let cipher = Aes256Gcm::new_from_slice(key.0.as_slice()).map_err(|_| VaultError::InvalidKeyLength(key.0.len()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| VaultError::EncryptFailed)?;

    let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    packed.extend_from_slice(&nonce_bytes);
    packed.extend_from_slice(&ciphertext);

    Ok(base64::engine::general_purpose::STANDARD.encode(packed))
}

/// Decrypts a blob produced by [`encrypt`].
pub fn decrypt(blob: &str, key: &VaultKey) -> Result<String, VaultError> {
    let packed = base64::engine::general_purpose::STANDARD
        .decode(blob)
        .map_err(|_| VaultError::DecryptFailed)?;

    if packed.len() < NONCE_LEN + TAG_LEN {
        return Err(VaultError::CiphertextTooShort);
    }

    let (nonce_bytes, ciphertext) = packed.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key.0.as_slice()).map_err(|_| VaultError::InvalidKeyLength(key.0.len()))?;
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| VaultError::DecryptFailed)?;

    String::from_utf8(plaintext).map_err(|_| VaultError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_sha256_hex() {
        // Known SHA-256("") — confirms we're computing the standard hash,
        // not some home-grown variant.
        assert_eq!(
            fingerprint(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
        assert_eq!(fingerprint("abc").len(), 64);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = VaultKey::generate_ephemeral();
        let plaintext = "sk-or-v1-super-secret-upstream-key";
        let encrypted = encrypt(plaintext, &key).unwrap();
        assert_ne!(encrypted, plaintext);

        let decrypted = decrypt(&encrypted, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn decrypt_fails_with_wrong_key() {
        let key_a = VaultKey::generate_ephemeral();
        let key_b = VaultKey::generate_ephemeral();
        let encrypted = encrypt("a-secret", &key_a).unwrap();
        assert!(decrypt(&encrypted, &key_b).is_err());
    }

    #[test]
    fn decrypt_rejects_truncated_ciphertext() {
        let key = VaultKey::generate_ephemeral();
        let short = base64::engine::general_purpose::STANDARD.encode([1, 2, 3]);
        assert!(matches!(decrypt(&short, &key), Err(VaultError::CiphertextTooShort)));
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        assert!(matches!(
            VaultKey::from_bytes(&[0u8; 16]),
            Err(VaultError::InvalidKeyLength(16))
        ));
    }
}
