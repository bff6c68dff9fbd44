//! Cooperative cancellation.

use futures::future::select_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// A cloneable cancellation signal.
///
/// Clones share the same signal. A [`child`](Self::child) token is
/// cancelled with its parent but can also be cancelled on its own.
#[derive(Debug, Clone)]
pub struct CancelToken {
    /// This token's flag followed by its ancestors' flags.
    chain: Vec<Arc<watch::Sender<bool>>>,
}

impl CancelToken {
    /// Creates a fresh, uncancelled token.
    pub fn new() -> Self {
        Self {
            chain: vec![Arc::new(watch::channel(false).0)],
        }
    }

    /// Creates a token cancelled whenever this one is.
    pub fn child(&self) -> Self {
        let mut chain = Vec::with_capacity(self.chain.len() + 1);
        chain.push(Arc::new(watch::channel(false).0));
        chain.extend(self.chain.iter().cloned());
        Self { chain }
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        if let Some(own) = self.chain.first() {
            own.send_replace(true);
        }
    }

    /// Returns true once cancellation was requested here or on an ancestor.
    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|flag| *flag.borrow())
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        let waits = self.chain.iter().map(|flag| {
            let mut rx = flag.subscribe();
            Box::pin(async move {
                // The sender lives in the chain, so the wait only ends on cancel.
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            })
        });
        select_all(waits).await;
    }

    /// Runs `fut` unless cancelled first, returning `None` on cancellation.
    pub async fn run<F: Future>(&self, fut: F) -> Option<F::Output> {
        if self.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            out = fut => Some(out),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn run_completes_without_cancel() {
        let token = CancelToken::new();
        assert_eq!(token.run(async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn cancel_interrupts_pending_work() {
        let token = CancelToken::new();
        let worker = token.clone();
        let task = tokio::spawn(async move {
            worker
                .run(tokio::time::sleep(Duration::from_secs(3600)))
                .await
        });
        token.cancel();
        assert_eq!(task.await.unwrap(), None);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn child_follows_parent_but_not_the_reverse() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
        other.cancelled().await;
    }
}
