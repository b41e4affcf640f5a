//! The per-account daily cycle
//!
//! One engine owns one account and loops through the same seven steps until
//! cancelled:
//!
//! 1. ComputeBoundary — next local midnight strictly after now
//! 2. WaitForFetchWindow — sleep until boundary − fetch lead
//! 3. FetchTokens — call the token provider, retrying on a fixed backoff
//! 4. Probe — measure candidates, derive the one-way compensation offset
//! 5. WaitForTarget — sleep until boundary + offset
//! 6. FireUnlock — fresh device id, one POST, report the outcome
//! 7. Advance — boundary += 1 day, back to step 2
//!
//! Every sleep and the fetch-retry loop observe the cancellation token; once
//! cancellation is seen the engine returns promptly and never reaches step 6.
//! All other failures are reported through the notifier and absorbed — only
//! cancellation ends the loop.
//!
//! If the boundary passes while step 3 is still retrying, the cycle is
//! abandoned for that day and the engine advances to the next boundary
//! rather than firing late.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use provider::{StatusNotifier, TokenProvider, TokenSet};
use unlock_vault::{AccountStore, Credential};

use crate::client::UnlockClient;
use crate::{device, probe, schedule};

/// Default submission endpoint for unlock requests.
pub const DEFAULT_ENDPOINT: &str = "https://sgp-api.buy.mi.com/bbs/api/global/apply/bl-auth";

/// Default probe candidates (service frontends, TCP 443).
pub fn default_candidates() -> Vec<String> {
    vec!["161.117.96.161:443".into(), "20.157.18.26:443".into()]
}

/// Timing and probing knobs shared by every engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Boundary timezone as a fixed UTC offset.
    pub zone: FixedOffset,
    /// How long before the boundary token fetching starts.
    pub fetch_lead: Duration,
    /// Backoff between failed token fetches.
    pub retry_backoff: Duration,
    /// Connect round-trips per probe candidate.
    pub probe_samples: u32,
    /// Timeout per probe sample.
    pub probe_timeout: Duration,
    /// Candidate endpoints to probe.
    pub candidates: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            zone: schedule::boundary_zone(8).expect("UTC+8 is a valid offset"),
            fetch_lead: Duration::from_secs(300),
            retry_backoff: Duration::from_secs(30),
            probe_samples: 3,
            probe_timeout: Duration::from_secs(2),
            candidates: default_candidates(),
        }
    }
}

/// What the token-fetch step produced.
enum FetchOutcome {
    Tokens(TokenSet),
    MissedBoundary,
    Cancelled,
}

/// One account's running instance of the daily cycle.
pub struct AutoUnlockEngine {
    account: String,
    credential: Credential,
    config: EngineConfig,
    tokens: Arc<dyn TokenProvider>,
    notifier: Arc<dyn StatusNotifier>,
    client: UnlockClient,
    store: Arc<AccountStore>,
}

impl AutoUnlockEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account: String,
        credential: Credential,
        config: EngineConfig,
        tokens: Arc<dyn TokenProvider>,
        notifier: Arc<dyn StatusNotifier>,
        client: UnlockClient,
        store: Arc<AccountStore>,
    ) -> Self {
        Self {
            account,
            credential,
            config,
            tokens,
            notifier,
            client,
            store,
        }
    }

    /// Drive the cycle until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut boundary = schedule::next_boundary(Utc::now(), self.config.zone);
        debug!(account = %self.account, %boundary, "engine started");

        loop {
            // WaitForFetchWindow
            let lead = chrono::Duration::from_std(self.config.fetch_lead)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
            let fetch_at = boundary - lead;
            if !self.pause(schedule::wait_duration(Utc::now(), fetch_at), &cancel).await {
                break;
            }

            // FetchTokens
            let tokens = match self.fetch_tokens(boundary, &cancel).await {
                FetchOutcome::Tokens(tokens) => tokens,
                FetchOutcome::MissedBoundary => {
                    self.notify("midnight passed before tokens were ready, skipping to the next day")
                        .await;
                    boundary = schedule::next_day(boundary);
                    continue;
                }
                FetchOutcome::Cancelled => break,
            };
            self.notify("tokens fetched, unlock will fire at the boundary")
                .await;
            if let Err(e) = self.store.record_tokens(&self.account, &tokens).await {
                warn!(account = %self.account, error = %e, "failed to record token set");
            }

            // Probe
            let offset = self.probe_offset().await;

            // WaitForTarget
            let target = boundary
                + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero());
            let wait = schedule::wait_duration(Utc::now(), target);
            if wait > Duration::ZERO {
                self.notify(&format!(
                    "waiting {:.2}s until the exact unlock instant",
                    wait.as_secs_f64()
                ))
                .await;
            } else {
                self.notify("unlock instant already passed, firing immediately")
                    .await;
            }
            if !self.pause(wait, &cancel).await {
                break;
            }
            // A cancel observed during the final wait must never fire.
            if cancel.is_cancelled() {
                break;
            }

            // FireUnlock
            self.fire(&tokens).await;

            // Advance
            boundary = schedule::next_day(boundary);
            self.notify("auto unlock cycle finished, waiting for the next day")
                .await;
        }

        debug!(account = %self.account, "engine stopped");
    }

    /// Token fetch with unbounded, cancellable retry and a boundary guard.
    async fn fetch_tokens(
        &self,
        boundary: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        loop {
            if cancel.is_cancelled() {
                return FetchOutcome::Cancelled;
            }
            self.notify("fetching fresh tokens for auto unlock").await;

            let fetched = tokio::select! {
                () = cancel.cancelled() => return FetchOutcome::Cancelled,
                fetched = self
                    .tokens
                    .fetch(&self.credential.login, self.credential.secret.expose()) => fetched,
            };

            match fetched {
                Ok(tokens) if tokens.is_complete() => return FetchOutcome::Tokens(tokens),
                Ok(_) => {
                    metrics::counter!("token_fetch_failures_total").increment(1);
                    self.notify(&format!(
                        "token scrape came back incomplete, retrying in {}s",
                        self.config.retry_backoff.as_secs()
                    ))
                    .await;
                }
                Err(e) => {
                    metrics::counter!("token_fetch_failures_total").increment(1);
                    self.notify(&format!(
                        "token fetch failed ({e}), retrying in {}s",
                        self.config.retry_backoff.as_secs()
                    ))
                    .await;
                }
            }

            if Utc::now() >= boundary {
                return FetchOutcome::MissedBoundary;
            }
            if !self.pause(self.config.retry_backoff, cancel).await {
                return FetchOutcome::Cancelled;
            }
        }
    }

    /// Probe candidates and derive the compensation offset.
    async fn probe_offset(&self) -> Duration {
        match probe::select_best(
            &self.config.candidates,
            self.config.probe_samples,
            self.config.probe_timeout,
        )
        .await
        {
            Some(best) => {
                let offset = schedule::compensation_offset(best.avg_rtt_ms);
                self.notify(&format!(
                    "best endpoint {} with average ping {:.1} ms, compensating by {:.3}s",
                    best.address,
                    best.avg_rtt_ms,
                    offset.as_secs_f64()
                ))
                .await;
                offset
            }
            None => {
                self.notify("no candidate endpoint reachable, firing with zero offset")
                    .await;
                Duration::ZERO
            }
        }
    }

    /// Generate a device identity, fire the request, report the outcome.
    async fn fire(&self, tokens: &TokenSet) {
        let device_id = device::generate();
        match self.client.send(tokens, &device_id).await {
            Ok(outcome) => {
                metrics::counter!("unlock_attempts_total", "outcome" => outcome.label())
                    .increment(1);
                self.notify(&outcome.describe()).await;
            }
            Err(e) => {
                metrics::counter!("unlock_attempts_total", "outcome" => "request_error")
                    .increment(1);
                self.notify(&format!("unlock request failed: {e}")).await;
            }
        }
    }

    /// Cancellable sleep. Returns false when cancelled.
    async fn pause(&self, wait: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(wait) => true,
        }
    }

    async fn notify(&self, message: &str) {
        self.notifier.notify(&self.account, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use common::Secret;
    use unlock_vault::VaultKey;

    struct StaticProvider(TokenSet);

    impl TokenProvider for StaticProvider {
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
            Box::pin(async { Err(provider::Error::Fetch("browser crashed".into())) })
        }
    }

    struct CaptureNotifier(Arc<Mutex<Vec<String>>>);

    impl StatusNotifier for CaptureNotifier {
        fn notify<'a>(
            &'a self,
            _account: &'a str,
            message: &'a str,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            self.0.lock().unwrap().push(message.to_string());
            Box::pin(async {})
        }
    }

    async fn test_store() -> (tempfile::TempDir, Arc<AccountStore>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let store = AccountStore::open(path, VaultKey::from_bytes([1; 32]))
            .await
            .unwrap();
        store
            .put_credential("4217", "login", "secret")
            .await
            .unwrap();
        (dir, Arc::new(store))
    }

    fn test_engine(
        provider: Arc<dyn TokenProvider>,
        lines: Arc<Mutex<Vec<String>>>,
        store: Arc<AccountStore>,
    ) -> AutoUnlockEngine {
        let config = EngineConfig {
            candidates: Vec::new(),
            ..EngineConfig::default()
        };
        AutoUnlockEngine::new(
            "4217".into(),
            Credential {
                login: "login".into(),
                secret: Secret::new("secret".into()),
            },
            config,
            provider,
            Arc::new(CaptureNotifier(lines)),
            // Refused instantly on loopback; the cycle absorbs the failure.
            UnlockClient::new("http://127.0.0.1:1/bl-auth".into()).unwrap(),
            store,
        )
    }

    fn complete_tokens() -> TokenSet {
        TokenSet {
            service_token: "svc".into(),
            run_token: "run".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_engine_returns_before_fetching() {
        let (_dir, store) = test_store().await;
        let lines = Arc::new(Mutex::new(Vec::new()));
        let engine = test_engine(
            Arc::new(StaticProvider(complete_tokens())),
            lines.clone(),
            store,
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        engine.run(cancel).await;

        assert!(
            lines.lock().unwrap().is_empty(),
            "a pre-cancelled engine must not reach the fetch step"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn full_cycle_fetches_probes_and_fires() {
        let (_dir, store) = test_store().await;
        let lines = Arc::new(Mutex::new(Vec::new()));
        let engine = test_engine(
            Arc::new(StaticProvider(complete_tokens())),
            lines.clone(),
            store.clone(),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(engine.run(cancel.clone()));

        // Paused time auto-advances through the multi-hour sleeps; wait for
        // the first cycle to complete, then cancel.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_secs(1800)).await;
            if lines
                .lock()
                .unwrap()
                .iter()
                .any(|l| l.contains("cycle finished"))
            {
                break;
            }
        }
        cancel.cancel();
        task.await.unwrap();

        let lines = lines.lock().unwrap();
        assert!(
            lines.iter().any(|l| l.contains("fetching fresh tokens")),
            "missing fetch step, got: {lines:?}"
        );
        assert!(
            lines
                .iter()
                .any(|l| l.contains("no candidate endpoint reachable")),
            "empty candidate list must degrade to zero offset, got: {lines:?}"
        );
        assert!(
            lines.iter().any(|l| l.contains("unlock request failed")),
            "the dead endpoint must be reported, not swallowed, got: {lines:?}"
        );
        assert!(
            lines.iter().any(|l| l.contains("cycle finished")),
            "the cycle must advance to the next day after a failed request, got: {lines:?}"
        );

        // The fetched set is recorded for inspection.
        assert_eq!(store.last_tokens("4217").await, Some(complete_tokens()));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failures_retry_and_stay_cancellable() {
        let (_dir, store) = test_store().await;
        let lines = Arc::new(Mutex::new(Vec::new()));
        let engine = test_engine(Arc::new(FailingProvider), lines.clone(), store);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(engine.run(cancel.clone()));

        // Let a few retry rounds accumulate, then cancel mid-backoff.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_secs(1800)).await;
            let failures = lines
                .lock()
                .unwrap()
                .iter()
                .filter(|l| l.contains("token fetch failed"))
                .count();
            if failures >= 3 {
                break;
            }
        }
        cancel.cancel();
        task.await.unwrap();

        let lines = lines.lock().unwrap();
        let failures = lines
            .iter()
            .filter(|l| l.contains("token fetch failed"))
            .count();
        assert!(failures >= 3, "expected repeated retries, got: {lines:?}");
        assert!(
            !lines.iter().any(|l| l.contains("unlock request")),
            "an engine stuck in fetch retries must never fire, got: {lines:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_tokens_are_retried() {
        let (_dir, store) = test_store().await;
        let lines = Arc::new(Mutex::new(Vec::new()));
        let incomplete = TokenSet {
            service_token: "svc".into(),
            run_token: provider::MISSING_TOKEN.into(),
        };
        let engine = test_engine(Arc::new(StaticProvider(incomplete)), lines.clone(), store);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(engine.run(cancel.clone()));

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_secs(1800)).await;
            if lines
                .lock()
                .unwrap()
                .iter()
                .any(|l| l.contains("incomplete"))
            {
                break;
            }
        }
        cancel.cancel();
        task.await.unwrap();

        let lines = lines.lock().unwrap();
        assert!(
            lines.iter().any(|l| l.contains("incomplete")),
            "a MISSING token must not count as fetched, got: {lines:?}"
        );
    }
}
