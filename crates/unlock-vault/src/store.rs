//! Per-account persisted records
//!
//! One JSON file maps account ids to their record: the two encrypted
//! credential blobs, the status marker driving resume-on-restart, and the
//! last fetched token set (inspection artifact, not authoritative). All
//! writes use atomic temp-file + rename with 0600 permissions. A tokio Mutex
//! serializes writers; reads clone the in-memory state under the same lock.
//!
//! Status is mutated only by the task registry (start/stop/termination),
//! never by an engine mid-cycle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use provider::TokenSet;

use crate::cipher;
use crate::error::{Error, Result};
use crate::key::VaultKey;

/// Persisted per-account task status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "autounlock")]
    AutoUnlockActive,
    #[serde(rename = "stopped")]
    Stopped,
}

impl Status {
    /// Marker label for logging and the admin API.
    pub fn label(self) -> &'static str {
        match self {
            Status::None => "none",
            Status::AutoUnlockActive => "autounlock",
            Status::Stopped => "stopped",
        }
    }
}

/// One account's record as stored on disk. `login` and `secret` are
/// base64-encoded sealed blobs — plaintext never reaches this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub login: String,
    pub secret: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tokens: Option<TokenSet>,
}

/// A decrypted credential pair, alive only in process memory.
pub struct Credential {
    pub login: String,
    pub secret: common::Secret<String>,
}

/// Thread-safe account record file manager.
pub struct AccountStore {
    path: PathBuf,
    key: VaultKey,
    state: Mutex<HashMap<String, AccountRecord>>,
}

impl AccountStore {
    /// Open the record file, creating it empty if absent (cold start).
    pub async fn open(path: PathBuf, key: VaultKey) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading account store: {e}")))?;
            let records: HashMap<String, AccountRecord> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing account store: {e}")))?;
            info!(path = %path.display(), accounts = records.len(), "loaded account store");
            records
        } else {
            info!(path = %path.display(), "account store not found, starting empty");
            let records = HashMap::new();
            write_atomic(&path, &records).await?;
            records
        };

        Ok(Self {
            path,
            key,
            state: Mutex::new(state),
        })
    }

    /// Encrypt and store a credential pair. An existing record keeps its
    /// status and last token set; a new record starts at `Status::None`.
    pub async fn put_credential(&self, account: &str, login: &str, secret: &str) -> Result<()> {
        let sealed_login = STANDARD.encode(cipher::seal(&self.key, login.as_bytes())?);
        let sealed_secret = STANDARD.encode(cipher::seal(&self.key, secret.as_bytes())?);

        let mut state = self.state.lock().await;
        match state.get_mut(account) {
            Some(record) => {
                record.login = sealed_login;
                record.secret = sealed_secret;
            }
            None => {
                state.insert(
                    account.to_string(),
                    AccountRecord {
                        login: sealed_login,
                        secret: sealed_secret,
                        status: Status::None,
                        last_tokens: None,
                    },
                );
            }
        }
        debug!(account, "stored credential");
        write_atomic(&self.path, &state).await
    }

    /// Decrypt an account's credential pair.
    ///
    /// `NotFound` for absent accounts; `CredentialCorrupt` when either blob
    /// fails to decode or decrypt. Callers must treat both the same way — no
    /// partial-credential state is ever returned.
    pub async fn load_credential(&self, account: &str) -> Result<Credential> {
        let record = {
            let state = self.state.lock().await;
            state
                .get(account)
                .cloned()
                .ok_or_else(|| Error::NotFound(account.to_string()))?
        };

        let login = open_field(&self.key, &record.login)?;
        let secret = open_field(&self.key, &record.secret)?;
        Ok(Credential {
            login,
            secret: common::Secret::new(secret),
        })
    }

    /// Current status marker; `None` for unknown accounts.
    pub async fn status(&self, account: &str) -> Status {
        let state = self.state.lock().await;
        state.get(account).map(|r| r.status).unwrap_or_default()
    }

    /// Persist a new status marker for an existing account.
    pub async fn set_status(&self, account: &str, status: Status) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .get_mut(account)
            .ok_or_else(|| Error::NotFound(account.to_string()))?;
        record.status = status;
        debug!(account, status = status.label(), "persisted status");
        write_atomic(&self.path, &state).await
    }

    /// Record the last fetched token set for later inspection.
    pub async fn record_tokens(&self, account: &str, tokens: &TokenSet) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .get_mut(account)
            .ok_or_else(|| Error::NotFound(account.to_string()))?;
        record.last_tokens = Some(tokens.clone());
        write_atomic(&self.path, &state).await
    }

    /// The last recorded token set, if any.
    pub async fn last_tokens(&self, account: &str) -> Option<TokenSet> {
        let state = self.state.lock().await;
        state.get(account).and_then(|r| r.last_tokens.clone())
    }

    /// Erase an account entirely. Returns whether a record existed.
    pub async fn remove(&self, account: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let removed = state.remove(account).is_some();
        if removed {
            debug!(account, "removed account record");
            write_atomic(&self.path, &state).await?;
        }
        Ok(removed)
    }

    /// Snapshot of (account, status) pairs, for resume-on-restart.
    pub async fn entries(&self) -> Vec<(String, Status)> {
        let state = self.state.lock().await;
        state
            .iter()
            .map(|(account, record)| (account.clone(), record.status))
            .collect()
    }

    /// All known account ids.
    pub async fn accounts(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.keys().cloned().collect()
    }

    /// Number of stored accounts.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Decode and decrypt one credential field.
fn open_field(key: &VaultKey, blob_b64: &str) -> Result<String> {
    let blob = STANDARD
        .decode(blob_b64)
        .map_err(|_| Error::CredentialCorrupt)?;
    let plaintext = cipher::open(key, &blob)?;
    String::from_utf8(plaintext).map_err(|_| Error::CredentialCorrupt)
}

/// Write the record map to disk atomically (temp file + rename, 0600).
async fn write_atomic(path: &Path, records: &HashMap<String, AccountRecord>) -> Result<()> {
    let json = serde_json::to_string_pretty(records)
        .map_err(|e| Error::Parse(format!("serializing account store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("account store path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp account store: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting account store permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp account store: {e}")))?;

    debug!(path = %path.display(), "persisted account store");
    Ok(())
}
