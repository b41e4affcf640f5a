//! Per-attempt device identifiers
//!
//! Every unlock attempt presents itself as a fresh device: an uppercase hex
//! digest over random entropy plus the current wall clock. Identifiers are
//! never reused across attempts and never persisted.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Generate a fresh device identifier.
pub fn generate() -> String {
    let mut entropy = [0u8; 16];
    rand::rng().fill_bytes(&mut entropy);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    let mut hasher = Sha256::new();
    hasher.update(entropy);
    hasher.update(nanos.to_be_bytes());
    hex::encode_upper(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_unique() {
        let a = generate();
        let b = generate();
        assert_ne!(a, b);
    }

    #[test]
    fn identifier_is_uppercase_hex() {
        let id = generate();
        assert_eq!(id.len(), 64);
        assert!(
            id.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()),
            "got: {id}"
        );
    }
}
