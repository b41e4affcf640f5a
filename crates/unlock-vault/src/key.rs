//! Process-wide vault key
//!
//! The key is entered interactively at startup as base64 and must decode to
//! exactly 32 bytes (AES-256). It is immutable after construction and wiped
//! from memory on drop. Concurrent reads are safe; there is no mutation.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Length the decoded key must have.
pub const KEY_LEN: usize = 32;

/// The symmetric key protecting all credential blobs.
pub struct VaultKey([u8; KEY_LEN]);

impl VaultKey {
    /// Parse a base64-encoded key. Standard and URL-safe alphabets are both
    /// accepted (operator key generators differ); surrounding whitespace is
    /// ignored. Anything that does not decode to exactly 32 bytes is
    /// rejected.
    pub fn from_base64(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let mut decoded = STANDARD
            .decode(trimmed)
            .or_else(|_| URL_SAFE.decode(trimmed))
            .map_err(|e| Error::KeyEncoding(e.to_string()))?;

        if decoded.len() != KEY_LEN {
            let got = decoded.len();
            decoded.zeroize();
            return Err(Error::KeyLength(got));
        }

        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self(bytes))
    }

    /// Construct from raw bytes (tests and key generation).
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub(crate) fn bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Drop for VaultKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VaultKey([REDACTED])")
    }
}
