use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::cancel::Cancellation;
use crate::error::Result;

/// Exponential backoff parameters for retried API calls.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub steps: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.1,
            steps: 5,
        }
    }
}

/// Runs `operation` until it succeeds, retrying on any error while the
/// cancellation handle has not fired. Cancellation short-circuits; the
/// final attempt's error is returned once the step budget is spent.
pub async fn retry_on_error<T, F, Fut>(
    cancel: &Cancellation,
    backoff: Backoff,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = backoff.initial;
    let mut remaining = backoff.steps.max(1);
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                remaining -= 1;
                if remaining == 0 {
                    return Err(err);
                }
                let pause = jittered(delay, backoff.jitter);
                warn!("{err}, retrying in {pause:.1?}");
                cancel.sleep(pause).await?;
                delay = delay.mul_f64(backoff.factor);
            }
        }
    }
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    delay.mul_f64(1.0 + jitter * rand::thread_rng().gen::<f64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> Backoff {
        Backoff {
            initial: Duration::from_millis(1),
            ..Backoff::default()
        }
    }

    #[tokio::test]
    async fn returns_the_first_success() {
        let calls = &AtomicU32::new(0);
        let result = retry_on_error(&Cancellation::unbounded(), quick(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(7)
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_the_operation_recovers() {
        let calls = &AtomicU32::new(0);
        let result = retry_on_error(&Cancellation::unbounded(), quick(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Validation("flaky".into()))
            } else {
                Ok(())
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_step_budget() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> =
            retry_on_error(&Cancellation::unbounded(), quick(), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Validation("still broken".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> =
            retry_on_error(&Cancellation::unbounded(), quick(), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Cancelled)
            })
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(1);
        for _ in 0..100 {
            let delay = jittered(base, 0.1);
            assert!(delay >= base);
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        assert_eq!(jittered(Duration::from_secs(2), 0.0), Duration::from_secs(2));
    }
}
