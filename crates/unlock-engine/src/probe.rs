//! Candidate endpoint probing
//!
//! Before firing, the engine measures which service frontend answers
//! fastest. Each candidate gets a fixed number of TCP connect round-trips;
//! the average over *successful* samples only decides the winner. A
//! candidate that never connects is excluded, and a sweep where nothing
//! connects yields `None` — the caller falls back to the configured default
//! endpoint with zero assumed latency. One candidate failing never aborts
//! the sweep.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::debug;

/// Measured result for the winning candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub address: String,
    pub avg_rtt_ms: f64,
}

/// Probe every candidate and pick the lowest average round trip.
pub async fn select_best(
    candidates: &[String],
    samples: u32,
    timeout: Duration,
) -> Option<ProbeOutcome> {
    let mut measured = Vec::with_capacity(candidates.len());
    for address in candidates {
        let avg = sample_rtt(address, samples, timeout).await;
        debug!(address, avg_rtt_ms = ?avg, "probed candidate");
        measured.push((address.clone(), avg));
    }
    best_of(measured)
}

/// Average connect round trip in milliseconds, `None` if no sample connected.
async fn sample_rtt(address: &str, samples: u32, timeout: Duration) -> Option<f64> {
    let mut total_ms = 0.0;
    let mut successes = 0u32;

    for _ in 0..samples {
        let started = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => {
                total_ms += started.elapsed().as_secs_f64() * 1000.0;
                successes += 1;
            }
            // Refused, unreachable, bad address, or timed out — this sample
            // simply doesn't count.
            Ok(Err(_)) | Err(_) => {}
        }
    }

    (successes > 0).then(|| total_ms / f64::from(successes))
}

/// Pick the reachable candidate with the lowest average round trip.
fn best_of(measured: Vec<(String, Option<f64>)>) -> Option<ProbeOutcome> {
    let mut best: Option<ProbeOutcome> = None;
    for (address, avg) in measured {
        let Some(avg_rtt_ms) = avg else { continue };
        let better = match &best {
            None => true,
            Some(current) => avg_rtt_ms < current.avg_rtt_ms,
        };
        if better {
            best = Some(ProbeOutcome {
                address,
                avg_rtt_ms,
            });
        }
    }
    best
}
