//! Retry executor shared by every external call.
//!
//! Image downloads, embedding requests, language-model calls and vector
//! store requests all go through [`retry_with_backoff`]. Each attempt runs
//! under its own timeout; an elapsed timeout counts as a retryable
//! [`FusionError::ExternalCallTimeout`].
//!
//! Backoff follows [`RetryPolicy::delay_for_attempt`]:
//! `base × 2^(attempt−2)` before attempt 2, 3, ... capped at `max_delay`.

use std::future::Future;
use std::time::Duration;

use profile_fusion_core::retry::RetryPolicy;
use profile_fusion_core::FusionError;

/// Run `f` until it succeeds, fails fatally, or attempts run out.
///
/// `is_retryable` decides which errors are worth another attempt. The last
/// error is returned unchanged when the policy is exhausted.
pub async fn retry_with_backoff<T, F, Fut, R>(
    policy: &RetryPolicy,
    operation: &str,
    timeout: Duration,
    is_retryable: R,
    mut f: F,
) -> Result<T, FusionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FusionError>>,
    R: Fn(&FusionError) -> bool,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        let delay = policy.delay_for_attempt(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let err = match tokio::time::timeout(timeout, f()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => FusionError::ExternalCallTimeout {
                operation: operation.to_string(),
                after: timeout,
            },
        };

        if attempt >= attempts || !is_retryable(&err) {
            if attempt > 1 {
                tracing::warn!(operation, attempt, error = %err, "giving up");
            }
            return Err(err);
        }
        tracing::debug!(operation, attempt, error = %err, "retrying");
        attempt += 1;
    }
}

/// [`retry_with_backoff`] with the default classification
/// ([`FusionError::is_retryable`]).
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    timeout: Duration,
    f: F,
) -> Result<T, FusionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FusionError>>,
{
    retry_with_backoff(policy, operation, timeout, FusionError::is_retryable, f).await
}
