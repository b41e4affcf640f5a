//! Prometheus metrics exposition
//!
//! The engine crate emits:
//!
//! - `unlock_attempts_total` (counter): label `outcome`
//! - `token_fetch_failures_total` (counter)
//! - `engines_running` (gauge)
//!
//! This module only installs the recorder; the `/metrics` endpoint renders
//! the handle in the admin router.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return a render handle.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}
