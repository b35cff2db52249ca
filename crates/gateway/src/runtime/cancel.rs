//! Per-run cancellation tokens.
//!
//! Each run gets a token at submission. Cancelling sets a flag checked at
//! every suspension point of the dialog loop and wakes any waiter, so a run
//! blocked on the session lock or a provider call is unblocked promptly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled_wait(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            // Register interest before re-checking the flag, otherwise a
            // cancel between the check and the await is lost.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Tracks the active cancellation token per run id.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(run_id.to_owned(), token.clone());
        token
    }

    /// Cancel a run's token. Returns true when a token was found.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.tokens.lock().get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, run_id: &str) {
        self.tokens.lock().remove(run_id);
    }

    pub fn get(&self, run_id: &str) -> Option<CancelToken> {
        self.tokens.lock().get(run_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clone_shares_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_wait_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled_wait().await;
                42
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        token.cancel();
        assert_eq!(waiter.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn cancelled_wait_returns_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(50), token.cancelled_wait())
            .await
            .expect("should not block");
    }

    #[test]
    fn map_register_cancel_remove() {
        let map = CancelMap::new();
        let token = map.register("r1");
        assert!(map.cancel("r1"));
        assert!(token.is_cancelled());
        map.remove("r1");
        assert!(!map.cancel("r1"));
        assert!(map.get("r1").is_none());
    }
}
