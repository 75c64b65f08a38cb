//! Cooperative cancellation signal shared between a job and its run.

use crate::error::{Result, RunError};

/// One-shot cancellation flag. Clones share the same signal.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: tokio_util::sync::CancellationToken,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolve once cancellation has been requested (immediately if it already was)
    pub async fn wait(&self) {
        self.inner.cancelled().await;
    }

    /// Fail with [`RunError::Cancelled`] if cancellation has been requested
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RunError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_is_shared_and_idempotent() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(token.ensure_active().is_ok());

        clone.cancel();
        clone.cancel();

        assert!(token.is_cancelled());
        assert!(token.ensure_active().unwrap_err().is_cancelled());
        // Already cancelled: returns without waiting
        tokio::time::timeout(Duration::from_millis(50), token.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_wakes_on_cancel() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
