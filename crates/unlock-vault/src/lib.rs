//! Credential vault and per-account persistence
//!
//! Account secrets are encrypted at rest with a process-wide symmetric key
//! supplied once at startup. Plaintext exists only transiently in process
//! memory during a decrypt→use cycle — it is never written to disk and never
//! logged.
//!
//! Flow:
//! 1. Operator enters the base64 key → `VaultKey::from_base64`
//! 2. `AccountStore::open` loads the account record file
//! 3. Credentials stored via `AccountStore::put_credential` (sealed blobs)
//! 4. The engine loads them via `AccountStore::load_credential` per cycle
//! 5. The registry persists the per-account status marker across restarts

pub mod cipher;
pub mod error;
pub mod key;
pub mod store;

pub use error::{Error, Result};
pub use key::VaultKey;
pub use store::{AccountRecord, AccountStore, Credential, Status};
