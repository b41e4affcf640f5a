//! External-collaborator interfaces for the unlock engine
//!
//! The engine drives two pieces of machinery it does not own:
//!
//! - `TokenProvider` — turns a decrypted login/secret pair into the
//!   short-lived token set the unlock request needs. The real mechanism is a
//!   browser-automation scrape, out of scope here; `CommandTokenProvider`
//!   delegates it to a helper subprocess.
//! - `StatusNotifier` — delivers human-readable progress lines for an
//!   account (chat relay, log sink, test capture). Strictly best-effort:
//!   a failing notifier must never disturb the engine.
//!
//! Both traits use `Pin<Box<dyn Future>>` return types for dyn-compatibility
//! (`Arc<dyn TokenProvider>` / `Arc<dyn StatusNotifier>`).

pub mod command;
pub mod notify;

pub use command::CommandTokenProvider;
pub use notify::{LogNotifier, StatusNotifier};

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Sentinel written by the scraper when a token cookie never appeared.
pub const MISSING_TOKEN: &str = "MISSING";

/// The token pair required for one unlock attempt.
///
/// Field names on the wire match the service's cookie names. A set is only
/// usable when both tokens are present and neither is the `MISSING` sentinel.
/// Tokens live for one fetch window; the engine regenerates them every cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    #[serde(rename = "new_bbs_serviceToken")]
    pub service_token: String,
    #[serde(rename = "popRunToken")]
    pub run_token: String,
}

impl TokenSet {
    /// Whether both tokens are present and real.
    pub fn is_complete(&self) -> bool {
        !self.service_token.is_empty()
            && self.service_token != MISSING_TOKEN
            && !self.run_token.is_empty()
            && self.run_token != MISSING_TOKEN
    }
}

/// Errors from token acquisition.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("token fetch failed: {0}")]
    Fetch(String),

    #[error("token helper output was not a token set: {0}")]
    Parse(String),

    #[error("token helper timed out after {0}s")]
    Timeout(u64),
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Source of fresh authentication tokens for one account.
///
/// Implementations may be arbitrarily slow (tens of seconds for a headless
/// browser login). The engine only calls this during the fetch window, never
/// on the final countdown to the boundary, and survives any failure.
pub trait TokenProvider: Send + Sync {
    /// Fetch a fresh token set for the given credentials.
    fn fetch<'a>(
        &'a self,
        login: &'a str,
        secret: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenSet>> + Send + 'a>>;
}
