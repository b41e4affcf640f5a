//! Credential blob cipher
//!
//! AES-256-GCM with a fresh random 96-bit nonce per seal.
//!
//! Blob layout: `[ nonce (12 bytes) | ciphertext + tag ]`
//!
//! `open(seal(p)) == p` under the same key; any bit flip in the blob, or a
//! different key, fails authentication and surfaces as `CredentialCorrupt`.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::{Error, Result};
use crate::key::VaultKey;

const NONCE_LEN: usize = 12;

/// Encrypt a plaintext under the vault key, prepending the random nonce.
pub fn seal(key: &VaultKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher =
        Aes256Gcm::new_from_slice(key.bytes()).map_err(|e| Error::Encrypt(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| Error::Encrypt(e.to_string()))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a nonce-prefixed blob. Every failure mode (truncated blob, wrong
/// key, tampering) collapses into `CredentialCorrupt` so callers cannot
/// leak which one occurred.
pub fn open(key: &VaultKey, blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(Error::CredentialCorrupt);
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher =
        Aes256Gcm::new_from_slice(key.bytes()).map_err(|_| Error::CredentialCorrupt)?;

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::CredentialCorrupt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> VaultKey {
        VaultKey::from_bytes([0x42; 32])
    }

    #[test]
    fn open_inverts_seal() {
        let key = test_key();
        let blob = seal(&key, "user@example.com".as_bytes()).unwrap();
        let plaintext = open(&key, &blob).unwrap();
        assert_eq!(plaintext, b"user@example.com");
    }

    #[test]
    fn roundtrips_arbitrary_utf8() {
        let key = test_key();
        for input in ["", "p@ssw0rd!", "пароль", "密码🔐", "a\nb\tc"] {
            let blob = seal(&key, input.as_bytes()).unwrap();
            assert_eq!(open(&key, &blob).unwrap(), input.as_bytes());
        }
    }

    #[test]
    fn nonces_are_unique_per_seal() {
        let key = test_key();
        let a = seal(&key, b"same plaintext").unwrap();
        let b = seal(&key, b"same plaintext").unwrap();
        assert_ne!(a, b, "two seals of the same plaintext must differ");
    }

    #[test]
    fn wrong_key_fails_closed() {
        let blob = seal(&test_key(), b"secret").unwrap();
        let other = VaultKey::from_bytes([0x43; 32]);
        assert!(matches!(
            open(&other, &blob),
            Err(Error::CredentialCorrupt)
        ));
    }

    #[test]
    fn tampered_blob_fails_closed() {
        let key = test_key();
        let mut blob = seal(&key, b"secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(open(&key, &blob), Err(Error::CredentialCorrupt)));
    }

    #[test]
    fn truncated_blob_fails_closed() {
        let key = test_key();
        assert!(matches!(
            open(&key, &[0u8; 5]),
            Err(Error::CredentialCorrupt)
        ));
    }
}
