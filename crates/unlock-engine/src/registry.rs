//! Task lifecycle registry
//!
//! Owns the table of running engines: one per account, enforced under a
//! single lock. Start persists the `autounlock` marker before returning;
//! stop cancels the engine, persists `stopped`, and waits for the task to
//! wind down. A watcher task per engine performs termination bookkeeping —
//! whichever side (stop or watcher) actually evicts the handle is the one
//! that persists the final status, so it happens exactly once even under
//! concurrent stops.
//!
//! Deliberately absent: a shutdown-all operation. On process exit engines
//! die with the runtime and their accounts keep the `autounlock` marker, so
//! `resume_all` revives them on the next start.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use provider::{StatusNotifier, TokenProvider};
use unlock_vault::{AccountStore, Status};

use crate::client::{Outcome, UnlockClient};
use crate::engine::{AutoUnlockEngine, EngineConfig};
use crate::error::{Error, Result};
use crate::{device, probe, schedule};

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

/// Live record of a running engine.
struct EngineHandle {
    engine_id: u64,
    cancel: CancellationToken,
    done: CancellationToken,
}

/// Registry of running per-account engines.
///
/// The handle table lives behind an `Arc` so each engine's watcher task can
/// reach it for termination bookkeeping after the registry call returns.
pub struct Registry {
    engines: Arc<Mutex<HashMap<String, EngineHandle>>>,
    next_engine_id: AtomicU64,
    store: Arc<AccountStore>,
    tokens: Arc<dyn TokenProvider>,
    client: UnlockClient,
    config: EngineConfig,
}

impl Registry {
    pub fn new(
        store: Arc<AccountStore>,
        tokens: Arc<dyn TokenProvider>,
        client: UnlockClient,
        config: EngineConfig,
    ) -> Self {
        Self {
            engines: Arc::new(Mutex::new(HashMap::new())),
            next_engine_id: AtomicU64::new(0),
            store,
            tokens,
            client,
            config,
        }
    }

    /// Spawn an engine for the account unless one is already running.
    ///
    /// The `autounlock` marker is persisted before this returns, so a crash
    /// right after a successful start still resumes the account.
    pub async fn start(
        &self,
        account: &str,
        notifier: Arc<dyn StatusNotifier>,
    ) -> Result<StartOutcome> {
        let mut engines = self.engines.lock().await;
        if engines.contains_key(account) {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let credential = self.store.load_credential(account).await?;
        self.store
            .set_status(account, Status::AutoUnlockActive)
            .await?;

        let engine_id = self.next_engine_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        let engine = AutoUnlockEngine::new(
            account.to_string(),
            credential,
            self.config.clone(),
            self.tokens.clone(),
            notifier,
            self.client.clone(),
            self.store.clone(),
        );
        let task = tokio::spawn(engine.run(cancel.clone()));
        metrics::gauge!("engines_running").increment(1.0);

        // Watcher: bookkeeping when the engine ends for any reason.
        {
            let table = self.engines.clone();
            let store = self.store.clone();
            let account = account.to_string();
            let done = done.clone();
            tokio::spawn(async move {
                if let Err(e) = task.await {
                    warn!(account, error = %e, "engine task aborted abnormally");
                }
                metrics::gauge!("engines_running").decrement(1.0);
                settle(&table, &store, &account, engine_id).await;
                done.cancel();
            });
        }

        engines.insert(
            account.to_string(),
            EngineHandle {
                engine_id,
                cancel,
                done,
            },
        );
        info!(account, "auto unlock started");
        Ok(StartOutcome::Started)
    }

    /// Cancel and remove the account's engine, if any.
    ///
    /// Waits for the engine task to finish winding down before returning,
    /// so a follow-up `start` never races the old engine.
    pub async fn stop(&self, account: &str) -> Result<StopOutcome> {
        let handle = {
            let mut engines = self.engines.lock().await;
            engines.remove(account)
        };
        let Some(handle) = handle else {
            return Ok(StopOutcome::NotRunning);
        };

        handle.cancel.cancel();
        // This caller evicted the handle, so this caller persists the marker.
        if let Err(e) = self.store.set_status(account, Status::Stopped).await {
            warn!(account, error = %e, "failed to persist stopped status");
        }
        handle.done.cancelled().await;
        info!(account, "auto unlock stopped");
        Ok(StopOutcome::Stopped)
    }

    /// Whether an engine is currently registered for the account.
    pub async fn is_running(&self, account: &str) -> bool {
        let engines = self.engines.lock().await;
        engines.contains_key(account)
    }

    /// Accounts with a running engine.
    pub async fn running(&self) -> Vec<String> {
        let engines = self.engines.lock().await;
        engines.keys().cloned().collect()
    }

    /// Restart engines for every account persisted as `autounlock`.
    ///
    /// Accounts whose credentials are missing or fail to decrypt are skipped
    /// with a log line; they keep their marker and will be retried on the
    /// next process start. Returns the number of engines started.
    pub async fn resume_all(&self, notifier: Arc<dyn StatusNotifier>) -> usize {
        let mut resumed = 0;
        for (account, status) in self.store.entries().await {
            if status != Status::AutoUnlockActive {
                continue;
            }
            if self.is_running(&account).await {
                continue;
            }
            match self.start(&account, notifier.clone()).await {
                Ok(StartOutcome::Started) => {
                    info!(account, "auto unlock resumed after restart");
                    notifier
                        .notify(&account, "auto unlock resumed after restart")
                        .await;
                    resumed += 1;
                }
                Ok(StartOutcome::AlreadyRunning) => {}
                Err(e) => {
                    warn!(account, error = %e, "skipping resume, credential unavailable");
                }
            }
        }
        resumed
    }

    /// One-shot immediate attempt: fetch tokens, probe, fire now.
    ///
    /// Independent of the daily cycle — no boundary wait, no retry loop.
    pub async fn manual_unlock(
        &self,
        account: &str,
        notifier: &Arc<dyn StatusNotifier>,
    ) -> Result<Outcome> {
        let credential = self.store.load_credential(account).await?;

        notifier
            .notify(account, "starting manual unlock, fetching fresh tokens")
            .await;
        let tokens = self
            .tokens
            .fetch(&credential.login, credential.secret.expose())
            .await
            .map_err(|e| Error::TokenFetch(e.to_string()))?;
        if !tokens.is_complete() {
            return Err(Error::TokenFetch("token scrape came back incomplete".into()));
        }
        if let Err(e) = self.store.record_tokens(account, &tokens).await {
            warn!(account, error = %e, "failed to record token set");
        }

        // Single sample per candidate; the manual path favors speed.
        if let Some(best) = probe::select_best(
            &self.config.candidates,
            1,
            self.config.probe_timeout,
        )
        .await
        {
            let offset = schedule::compensation_offset(best.avg_rtt_ms);
            notifier
                .notify(
                    account,
                    &format!(
                        "best endpoint {} with average ping {:.1} ms ({:.3}s one way)",
                        best.address,
                        best.avg_rtt_ms,
                        offset.as_secs_f64()
                    ),
                )
                .await;
        } else {
            notifier
                .notify(account, "no candidate endpoint reachable, firing anyway")
                .await;
        }

        let device_id = device::generate();
        let outcome = self.client.send(&tokens, &device_id).await?;
        metrics::counter!("unlock_attempts_total", "outcome" => outcome.label()).increment(1);
        notifier.notify(account, &outcome.describe()).await;
        Ok(outcome)
    }
}

/// Termination bookkeeping from the watcher: evict the handle if it still
/// belongs to this engine incarnation and persist the marker. Whoever evicts
/// persists — exactly once even when a stop races the watcher.
async fn settle(
    table: &Mutex<HashMap<String, EngineHandle>>,
    store: &AccountStore,
    account: &str,
    engine_id: u64,
) {
    let evicted = {
        let mut engines = table.lock().await;
        match engines.get(account) {
            Some(handle) if handle.engine_id == engine_id => {
                engines.remove(account);
                true
            }
            _ => false,
        }
    };
    if evicted {
        if let Err(e) = store.set_status(account, Status::Stopped).await {
            warn!(account, error = %e, "failed to persist stopped status");
        }
        info!(account, "engine terminated, account settled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    use provider::{Error as ProviderError, TokenSet};
    use unlock_vault::VaultKey;

    /// Provider whose fetch never completes — engines park in the fetch
    /// window, which is all registry tests need.
    struct PendingProvider;

    impl TokenProvider for PendingProvider {
        fn fetch<'a>(
            &'a self,
            _login: &'a str,
            _secret: &'a str,
        ) -> Pin<Box<dyn Future<Output = provider::Result<TokenSet>> + Send + 'a>> {
            Box::pin(std::future::pending())
        }
    }

    struct InstantProvider(TokenSet);

    impl TokenProvider for InstantProvider {
        fn fetch<'a>(
            &'a self,
            _login: &'a str,
            _secret: &'a str,
        ) -> Pin<Box<dyn Future<Output = provider::Result<TokenSet>> + Send + 'a>> {
            let tokens = self.0.clone();
            Box::pin(async move { Ok(tokens) })
        }
    }

    struct FailingProvider;

    impl TokenProvider for FailingProvider {
        fn fetch<'a>(
            &'a self,
            _login: &'a str,
            _secret: &'a str,
        ) -> Pin<Box<dyn Future<Output = provider::Result<TokenSet>> + Send + 'a>> {
            Box::pin(async { Err(ProviderError::Fetch("no browser".into())) })
        }
    }

    struct NullNotifier;

    impl StatusNotifier for NullNotifier {
        fn notify<'a>(
            &'a self,
            _account: &'a str,
            _message: &'a str,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            Box::pin(async {})
        }
    }

    async fn test_store(dir: &tempfile::TempDir) -> Arc<AccountStore> {
        let path = dir.path().join("accounts.json");
        Arc::new(
            AccountStore::open(path, VaultKey::from_bytes([1; 32]))
                .await
                .unwrap(),
        )
    }

    fn test_registry(store: Arc<AccountStore>, tokens: Arc<dyn TokenProvider>) -> Arc<Registry> {
        let config = EngineConfig {
            candidates: Vec::new(),
            ..EngineConfig::default()
        };
        Arc::new(Registry::new(
            store,
            tokens,
            UnlockClient::new("http://127.0.0.1:1/bl-auth".into()).unwrap(),
            config,
        ))
    }

    fn null_notifier() -> Arc<dyn StatusNotifier> {
        Arc::new(NullNotifier)
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        store.put_credential("a", "login", "secret").await.unwrap();
        let registry = test_registry(store.clone(), Arc::new(PendingProvider));

        let first = registry.start("a", null_notifier()).await.unwrap();
        let second = registry.start("a", null_notifier()).await.unwrap();

        assert_eq!(first, StartOutcome::Started);
        assert_eq!(second, StartOutcome::AlreadyRunning);
        assert_eq!(registry.running().await, vec!["a".to_string()]);
        assert_eq!(store.status("a").await, Status::AutoUnlockActive);
    }

    #[tokio::test]
    async fn start_without_credentials_errors_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let registry = test_registry(store.clone(), Arc::new(PendingProvider));

        assert!(registry.start("ghost", null_notifier()).await.is_err());
        assert!(!registry.is_running("ghost").await);
    }

    #[tokio::test]
    async fn stop_cancels_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        store.put_credential("a", "login", "secret").await.unwrap();
        let registry = test_registry(store.clone(), Arc::new(PendingProvider));

        registry.start("a", null_notifier()).await.unwrap();
        assert!(registry.is_running("a").await);

        let outcome = registry.stop("a").await.unwrap();
        assert_eq!(outcome, StopOutcome::Stopped);
        assert!(!registry.is_running("a").await);
        assert_eq!(store.status("a").await, Status::Stopped);
    }

    #[tokio::test]
    async fn stop_non_running_account_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        store.put_credential("b", "login", "secret").await.unwrap();
        let registry = test_registry(store.clone(), Arc::new(PendingProvider));

        let outcome = registry.stop("b").await.unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
        assert_eq!(store.status("b").await, Status::None);
    }

    #[tokio::test]
    async fn concurrent_stops_settle_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        store.put_credential("a", "login", "secret").await.unwrap();
        let registry = test_registry(store.clone(), Arc::new(PendingProvider));
        registry.start("a", null_notifier()).await.unwrap();

        let r1 = registry.clone();
        let r2 = registry.clone();
        let (s1, s2) = tokio::join!(r1.stop("a"), r2.stop("a"));
        let outcomes = [s1.unwrap(), s2.unwrap()];

        assert!(
            outcomes.contains(&StopOutcome::Stopped),
            "one stop must win: {outcomes:?}"
        );
        assert!(
            outcomes.contains(&StopOutcome::NotRunning),
            "the other must observe not-running: {outcomes:?}"
        );
        assert_eq!(store.status("a").await, Status::Stopped);
    }

    #[tokio::test]
    async fn restart_after_stop_works() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        store.put_credential("a", "login", "secret").await.unwrap();
        let registry = test_registry(store.clone(), Arc::new(PendingProvider));

        registry.start("a", null_notifier()).await.unwrap();
        registry.stop("a").await.unwrap();
        let outcome = registry.start("a", null_notifier()).await.unwrap();

        assert_eq!(outcome, StartOutcome::Started);
        assert_eq!(store.status("a").await, Status::AutoUnlockActive);
    }

    #[tokio::test]
    async fn resume_starts_only_active_accounts_with_good_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");

        // Seed with one key...
        let store = AccountStore::open(path.clone(), VaultKey::from_bytes([1; 32]))
            .await
            .unwrap();
        store
            .put_credential("active-good", "login", "secret")
            .await
            .unwrap();
        store
            .set_status("active-good", Status::AutoUnlockActive)
            .await
            .unwrap();
        store
            .put_credential("stopped", "login", "secret")
            .await
            .unwrap();
        store
            .set_status("stopped", Status::Stopped)
            .await
            .unwrap();
        drop(store);

        // ...then sneak in a record sealed under a different key, so its
        // credential fails to decrypt at resume time.
        let other = AccountStore::open(dir.path().join("other.json"), VaultKey::from_bytes([9; 32]))
            .await
            .unwrap();
        other
            .put_credential("active-corrupt", "login", "secret")
            .await
            .unwrap();
        let sealed: serde_json::Value = serde_json::from_str(
            &tokio::fs::read_to_string(dir.path().join("other.json"))
                .await
                .unwrap(),
        )
        .unwrap();
        let mut records: serde_json::Value =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        records["active-corrupt"] = serde_json::json!({
            "login": sealed["active-corrupt"]["login"],
            "secret": sealed["active-corrupt"]["secret"],
            "status": "autounlock",
        });
        tokio::fs::write(&path, records.to_string()).await.unwrap();

        let store = Arc::new(
            AccountStore::open(path, VaultKey::from_bytes([1; 32]))
                .await
                .unwrap(),
        );
        let registry = test_registry(store.clone(), Arc::new(PendingProvider));

        let resumed = registry.resume_all(null_notifier()).await;

        assert_eq!(resumed, 1, "exactly one account must resume");
        assert!(registry.is_running("active-good").await);
        assert!(!registry.is_running("stopped").await);
        assert!(!registry.is_running("active-corrupt").await);
    }

    #[tokio::test]
    async fn manual_unlock_fires_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        store.put_credential("a", "login", "secret").await.unwrap();

        // Local mock endpoint accepting the request.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/bl-auth",
                axum::routing::post(|| async {
                    (
                        [(axum::http::header::CONTENT_TYPE, "application/json")],
                        r#"{"code":0,"data":{"apply_result":1}}"#,
                    )
                }),
            );
            axum::serve(listener, app).await.unwrap();
        });

        let tokens = TokenSet {
            service_token: "svc".into(),
            run_token: "run".into(),
        };
        let config = EngineConfig {
            candidates: Vec::new(),
            ..EngineConfig::default()
        };
        let registry = Arc::new(Registry::new(
            store.clone(),
            Arc::new(InstantProvider(tokens.clone())),
            UnlockClient::new(format!("http://{addr}/bl-auth")).unwrap(),
            config,
        ));

        let outcome = registry
            .manual_unlock("a", &null_notifier())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Accepted);
        assert_eq!(store.last_tokens("a").await, Some(tokens));
    }

    #[tokio::test]
    async fn manual_unlock_surfaces_fetch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        store.put_credential("a", "login", "secret").await.unwrap();
        let registry = test_registry(store, Arc::new(FailingProvider));

        let err = registry
            .manual_unlock("a", &null_notifier())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenFetch(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn manual_unlock_without_credentials_is_vault_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let registry = test_registry(store, Arc::new(PendingProvider));

        let err = registry
            .manual_unlock("ghost", &null_notifier())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Vault(_)), "got {err:?}");
    }
}
