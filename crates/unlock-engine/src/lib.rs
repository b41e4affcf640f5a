//! Daily-boundary auto-unlock engine
//!
//! Drives one latency-compensated unlock request per account per day against
//! a service that only accepts requests at local midnight in its home
//! timezone.
//!
//! Account lifecycle:
//! 1. Credentials stored (encrypted) via the vault's `AccountStore`
//! 2. `Registry::start` spawns the account's `AutoUnlockEngine`
//! 3. The engine waits for the fetch window, acquires tokens, probes the
//!    candidate endpoints, and fires at boundary + half the round trip
//! 4. The cycle advances one day and repeats until `Registry::stop`
//! 5. After a restart, `Registry::resume_all` revives every account whose
//!    persisted marker is still `autounlock`

pub mod client;
pub mod device;
pub mod engine;
pub mod error;
pub mod probe;
pub mod registry;
pub mod schedule;

pub use client::{Outcome, UnlockClient};
pub use engine::{AutoUnlockEngine, DEFAULT_ENDPOINT, EngineConfig, default_candidates};
pub use error::{Error, Result};
pub use probe::ProbeOutcome;
pub use registry::{Registry, StartOutcome, StopOutcome};
