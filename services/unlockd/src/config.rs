//! Configuration types and loading
//!
//! Config precedence: CLI `--config` > CONFIG_PATH env var > `unlockd.toml`.
//! The vault key is never part of the config file — it is entered
//! interactively at startup (or via UNLOCK_VAULT_KEY for supervised runs).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use unlock_engine::{DEFAULT_ENDPOINT, EngineConfig, default_candidates, schedule};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub vault: VaultConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub unlock: UnlockConfig,
    pub tokens: TokensConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Account store location
#[derive(Debug, Deserialize)]
pub struct VaultConfig {
    pub path: PathBuf,
}

/// Daily-cycle timing
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Boundary timezone as a whole-hour UTC offset (service home zone).
    pub utc_offset_hours: i32,
    /// Seconds before the boundary at which token fetching starts.
    pub fetch_lead_secs: u64,
    /// Seconds between failed token fetches.
    pub retry_backoff_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            utc_offset_hours: 8,
            fetch_lead_secs: 300,
            retry_backoff_secs: 30,
        }
    }
}

/// Endpoint probing
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub candidates: Vec<String>,
    pub samples: u32,
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            candidates: default_candidates(),
            samples: 3,
            timeout_ms: 2000,
        }
    }
}

/// Unlock submission endpoint
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UnlockConfig {
    pub endpoint: String,
}

impl Default for UnlockConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }
}

/// Token helper subprocess
#[derive(Debug, Deserialize)]
pub struct TokensConfig {
    /// Program that performs the browser-driven token scrape.
    pub helper: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_helper_timeout")]
    pub timeout_secs: u64,
}

fn default_helper_timeout() -> u64 {
    120
}

/// Admin API listener
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9090".parse().expect("valid default address"),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        if !config.unlock.endpoint.starts_with("http://")
            && !config.unlock.endpoint.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "unlock endpoint must start with http:// or https://, got: {}",
                config.unlock.endpoint
            )));
        }

        if config.probe.candidates.is_empty() {
            return Err(common::Error::Config(
                "probe candidate list must not be empty".into(),
            ));
        }

        if config.probe.samples == 0 {
            return Err(common::Error::Config(
                "probe samples must be greater than 0".into(),
            ));
        }

        if config.probe.timeout_ms == 0 {
            return Err(common::Error::Config(
                "probe timeout_ms must be greater than 0".into(),
            ));
        }

        if config.schedule.fetch_lead_secs == 0 {
            return Err(common::Error::Config(
                "fetch_lead_secs must be greater than 0".into(),
            ));
        }

        if schedule::boundary_zone(config.schedule.utc_offset_hours).is_none() {
            return Err(common::Error::Config(format!(
                "utc_offset_hours must be a valid UTC offset, got: {}",
                config.schedule.utc_offset_hours
            )));
        }

        if config.tokens.helper.trim().is_empty() {
            return Err(common::Error::Config(
                "tokens.helper must name the token helper program".into(),
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("unlockd.toml")
    }

    /// Engine knobs derived from the schedule/probe sections.
    pub fn engine_config(&self) -> common::Result<EngineConfig> {
        let zone = schedule::boundary_zone(self.schedule.utc_offset_hours).ok_or_else(|| {
            common::Error::Config(format!(
                "utc_offset_hours must be a valid UTC offset, got: {}",
                self.schedule.utc_offset_hours
            ))
        })?;
        Ok(EngineConfig {
            zone,
            fetch_lead: Duration::from_secs(self.schedule.fetch_lead_secs),
            retry_backoff: Duration::from_secs(self.schedule.retry_backoff_secs),
            probe_samples: self.probe.samples,
            probe_timeout: Duration::from_millis(self.probe.timeout_ms),
            candidates: self.probe.candidates.clone(),
        })
    }

    /// Token helper timeout as a Duration.
    pub fn helper_timeout(&self) -> Duration {
        Duration::from_secs(self.tokens.timeout_secs)
    }
}
