//! Error types for engine operations

/// Errors from unlock requests and registry operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The unlock request never produced an HTTP response.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The service responded with a body that is not the expected shape.
    #[error("malformed service response: {0}")]
    Parse(String),

    #[error("token fetch failed: {0}")]
    TokenFetch(String),

    #[error(transparent)]
    Vault(#[from] unlock_vault::Error),
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
