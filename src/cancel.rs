//! Cooperative cancellation for the tasks that belong to one call.
//!
//! A terminal call status flips the handle once; every task of that call holds
//! a token and selects on [`CancelToken::cancelled`] around each await point.

use tokio::sync::watch;

/// Owner side: flips the signal.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

/// Task side: cheap to clone, one per task.
#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelToken(rx))
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken(self.0.subscribe())
    }
}

impl CancelToken {
    /// Resolves once the call is cancelled. A dropped handle counts as cancelled.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_every_token() {
        let (handle, token) = cancel_pair();
        let mut first = token.clone();
        let mut second = handle.token();

        let waiter = tokio::spawn(async move {
            first.cancelled().await;
            second.cancelled().await;
        });

        let mut idle = token.clone();
        assert!(tokio::time::timeout(Duration::from_millis(10), idle.cancelled())
            .await
            .is_err());
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("tokens should observe cancellation")
            .unwrap();
        // Tokens taken after the fact see it immediately
        let mut late = handle.token();
        tokio::time::timeout(Duration::from_millis(10), late.cancelled())
            .await
            .expect("late token should already be cancelled");
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_as_cancelled() {
        let (handle, mut token) = cancel_pair();
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("dropped handle should release waiters");
    }
}
