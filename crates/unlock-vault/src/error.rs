//! Error types for vault operations

/// Errors from vault and account-store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("vault key is not valid base64: {0}")]
    KeyEncoding(String),

    #[error("vault key must decode to exactly 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    /// Wrong key or damaged blob. Callers treat this exactly like a missing
    /// credential; the distinct variant exists so the log can say why.
    #[error("credential blob failed to decrypt")]
    CredentialCorrupt,

    #[error("account not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("account store parse error: {0}")]
    Parse(String),
}

/// Result alias for vault operations.
pub type Result<T> = std::result::Result<T, Error>;
