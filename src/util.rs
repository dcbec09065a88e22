use std::{future::Future, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::time::timeout;

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors
/// into contextual `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
        .with_context(|| format!("failed while {context}"))
}
