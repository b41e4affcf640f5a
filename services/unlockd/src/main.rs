//! unlockd — daily-boundary auto-unlock daemon
//!
//! Single-binary service that:
//! 1. Loads configuration and takes the vault key (env var or interactive)
//! 2. Opens the encrypted account store
//! 3. Resumes auto-unlock engines persisted as active before the restart
//! 4. Serves the admin API (account setup, start/stop, manual unlock)

mod admin;
mod config;
mod metrics;

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroize;

use provider::{CommandTokenProvider, LogNotifier, StatusNotifier, TokenProvider};
use unlock_engine::{Registry, UnlockClient};
use unlock_vault::{AccountStore, VaultKey};

use crate::admin::AdminState;
use crate::config::Config;

/// Env var carrying the base64 vault key for supervised (non-interactive) runs.
const VAULT_KEY_ENV: &str = "UNLOCK_VAULT_KEY";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting unlockd");

    // Install the Prometheus recorder before any metrics are emitted
    let prometheus = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        vault_path = %config.vault.path.display(),
        admin_addr = %config.admin.listen_addr,
        endpoint = %config.unlock.endpoint,
        candidates = config.probe.candidates.len(),
        utc_offset_hours = config.schedule.utc_offset_hours,
        "configuration loaded"
    );

    // The key gate: nothing is served until a valid 32-byte key is supplied.
    let key = read_vault_key()?;

    let store = Arc::new(
        AccountStore::open(config.vault.path.clone(), key)
            .await
            .context("failed to open account store")?,
    );

    let tokens: Arc<dyn TokenProvider> = Arc::new(CommandTokenProvider::new(
        config.tokens.helper.clone(),
        config.tokens.args.clone(),
        config.helper_timeout(),
    ));
    let client = UnlockClient::new(config.unlock.endpoint.clone())
        .context("failed to build unlock client")?;
    let registry = Arc::new(Registry::new(
        store.clone(),
        tokens,
        client,
        config.engine_config()?,
    ));
    let notifier: Arc<dyn StatusNotifier> = Arc::new(LogNotifier);

    let resumed = registry.resume_all(notifier.clone()).await;
    info!(resumed, "resume pass complete");

    let state = AdminState {
        registry,
        store,
        notifier,
        prometheus,
        started_at: Instant::now(),
    };
    let app = admin::build_router(state);

    let listener = TcpListener::bind(config.admin.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.admin.listen_addr))?;
    info!(addr = %config.admin.listen_addr, "admin API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("admin server failed")?;

    // Engines die with the runtime; their accounts keep the autounlock
    // marker so the next start resumes them.
    info!("shutdown complete");
    Ok(())
}

/// Obtain the vault key: UNLOCK_VAULT_KEY env var, else an interactive
/// prompt that re-asks until a valid key arrives. Stdin closing without a
/// valid key ends the process — the daemon never runs without the vault.
fn read_vault_key() -> Result<VaultKey> {
    if let Ok(mut encoded) = std::env::var(VAULT_KEY_ENV) {
        let key = VaultKey::from_base64(&encoded)
            .with_context(|| format!("{VAULT_KEY_ENV} is not a valid vault key"))?;
        encoded.zeroize();
        info!("vault key taken from environment");
        return Ok(key);
    }

    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        eprint!("vault key (base64, 32 bytes): ");
        let _ = std::io::stderr().flush();

        line.clear();
        let read = stdin
            .lock()
            .read_line(&mut line)
            .context("reading vault key from stdin")?;
        if read == 0 {
            anyhow::bail!("no vault key supplied before stdin closed");
        }

        match VaultKey::from_base64(&line) {
            Ok(key) => {
                line.zeroize();
                return Ok(key);
            }
            Err(e) => {
                line.zeroize();
                eprintln!("invalid key: {e}");
            }
        }
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
