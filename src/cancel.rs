use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

/// Cooperative cancellation handle threaded through every blocking wait.
///
/// Cancellation is deadline based: the handle either never fires
/// (unbounded) or fires once a caller-chosen timeout elapses. Poll loops
/// sleep through [`Cancellation::sleep`] so a deadline interrupts the wait
/// within one poll period.
#[derive(Clone, Copy, Debug, Default)]
pub struct Cancellation {
    deadline: Option<Deadline>,
}

#[derive(Clone, Copy, Debug)]
struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Cancellation {
    pub fn unbounded() -> Self {
        Self { deadline: None }
    }

    /// A handle that fires after `timeout`. A zero timeout means no
    /// deadline at all.
    pub fn with_timeout(timeout: Duration) -> Self {
        if timeout.is_zero() {
            return Self::unbounded();
        }
        Self {
            deadline: Some(Deadline {
                at: Instant::now() + timeout,
                timeout,
            }),
        }
    }

    pub fn check(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline.at => {
                Err(Error::TimedOut(deadline.timeout))
            }
            _ => Ok(()),
        }
    }

    /// Sleeps for `duration` or until the deadline, whichever comes first.
    /// Returns the timeout error when the deadline cut the sleep short.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        match self.deadline {
            None => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline.at {
                    return Err(Error::TimedOut(deadline.timeout));
                }
                tokio::time::sleep_until(deadline.at.min(now + duration)).await;
                self.check()
            }
        }
    }

    /// Runs a future under the deadline, mapping expiry to the timeout
    /// error. Without a deadline this is a plain await.
    pub async fn guard<F: Future>(&self, future: F) -> Result<F::Output> {
        match self.deadline {
            None => Ok(future.await),
            Some(deadline) => tokio::time::timeout_at(deadline.at, future)
                .await
                .map_err(|_| Error::TimedOut(deadline.timeout)),
        }
    }
}
