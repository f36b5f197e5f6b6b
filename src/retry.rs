use crate::error::Result;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Which run of an operation is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    First,
    /// The single rerun after a transport failure; always on a fresh connection.
    Retry,
}

impl Attempt {
    pub fn is_retry(self) -> bool {
        self == Attempt::Retry
    }
}

/// Masks one transport failure by running the operation a second time.
///
/// There is never a third run: whatever the retry returns is final.
pub struct RetryStrategy {
    delay: Duration,
}

impl RetryStrategy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match operation(Attempt::First).await {
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "retrying once on a fresh connection");
                if !self.delay.is_zero() {
                    sleep(self.delay).await;
                }
                operation(Attempt::Retry).await
            }
            outcome => outcome,
        }
    }
}
