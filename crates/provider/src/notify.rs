//! Status notification sink
//!
//! The engine reports progress ("tokens fetched", "unlock request accepted")
//! through this seam. Delivery mechanics (chat platform, log file) live
//! behind the trait; the engine only knows `notify` and that it cannot fail.

use std::future::Future;
use std::pin::Pin;

use tracing::info;

/// Best-effort, per-account progress message sink.
///
/// Implementations must swallow their own delivery failures — a broken chat
/// connection is a logging concern, never an engine concern.
pub trait StatusNotifier: Send + Sync {
    fn notify<'a>(
        &'a self,
        account: &'a str,
        message: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Default notifier: structured log lines via `tracing`.
pub struct LogNotifier;

impl StatusNotifier for LogNotifier {
    fn notify<'a>(
        &'a self,
        account: &'a str,
        message: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        info!(account, message, "status");
        Box::pin(async {})
    }
}
