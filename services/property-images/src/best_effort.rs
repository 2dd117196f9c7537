//! Operations whose failure is logged and counted but never propagated.
//!
//! Anything routed through [`best_effort`] must not influence the response a
//! caller receives. Work whose failure has to reach the caller uses `?` as usual.

use std::future::Future;
use tracing::warn;

/// Run `operation`, swallowing its error.
///
/// Returns `Some(value)` on success and `None` after logging a failure.
pub async fn best_effort<T, F>(operation: &'static str, fut: F) -> Option<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(operation, error = %format!("{e:#}"), "Best-effort operation failed");
            metrics::counter!("property_images.best_effort.failures", "operation" => operation)
                .increment(1);
            None
        }
    }
}
