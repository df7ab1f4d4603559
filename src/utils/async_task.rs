use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::warn;

use crate::BackoffPolicy;
use crate::RegistryError;
use crate::Result;

/// Delay before retry number `attempt` (0 based): the base delay doubled per
/// attempt, capped at the policy maximum, minus up to 10% random jitter.
pub(crate) fn backoff_delay(
    policy: &BackoffPolicy,
    attempt: u32,
) -> Duration {
    let base = policy.base_delay_ms.max(1);
    let exp = base.saturating_mul(1u64 << attempt.min(20));
    let capped = exp.min(policy.max_delay_ms.max(base));
    let jitter = rand::thread_rng().gen_range(0..=capped / 10);
    Duration::from_millis(capped.saturating_sub(jitter))
}

/// Runs `task` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts. Every attempt is bounded by
/// `policy.timeout_ms`. `max_retries == 0` retries forever.
pub(crate) async fn retry_with_backoff<F, T, P>(
    task: F,
    policy: &BackoffPolicy,
) -> Result<P>
where
    F: Fn() -> T,
    T: Future<Output = Result<P>>,
{
    let mut attempt: u32 = 0;
    loop {
        let error = match timeout(policy.timeout(), task()).await {
            Ok(Ok(r)) => return Ok(r),
            Ok(Err(e)) if !e.is_transient() => return Err(e),
            Ok(Err(e)) => e,
            Err(_) => RegistryError::Timeout(policy.timeout()).into(),
        };

        attempt += 1;
        if policy.max_retries != 0 && attempt as usize >= policy.max_retries {
            warn!("task failed after {} attempts, last error: {:?}", attempt, error);
            return Err(RegistryError::RetryExhausted {
                attempts: attempt as usize,
            }
            .into());
        }

        warn!("attempt {} failed with error: {:?}", attempt, error);
        sleep(backoff_delay(policy, attempt - 1)).await;
    }
}

