//! One-shot, edge-triggered cancellation tokens.
//!
//! A token fires at most once. Derived tokens observe their parent:
//! cancelling a context cancels everything below it, never above it.
//! Observers may outlive the call that created the token.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

struct Inner {
    fired: AtomicBool,
    notify: Notify,
    parent: Option<Arc<Inner>>,
}

/// A cancellation signal shared between a call and its observers.
///
/// Cloning shares the same signal; [`CancelToken::child`] derives a new
/// signal that also observes this one.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// A fresh, unfired token with no parent.
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                fired: AtomicBool::new(false),
                notify: Notify::new(),
                parent: None,
            }),
        }
    }

    /// Derive a child token. Cancelling the child does not affect the
    /// parent; cancelling the parent is observed by the child.
    pub fn child(&self) -> CancelToken {
        CancelToken {
            inner: Arc::new(Inner {
                fired: AtomicBool::new(false),
                notify: Notify::new(),
                parent: Some(self.inner.clone()),
            }),
        }
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.fired.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether this token or any ancestor has fired.
    pub fn is_cancelled(&self) -> bool {
        let mut node = Some(&self.inner);
        while let Some(inner) = node {
            if inner.fired.load(Ordering::Acquire) {
                return true;
            }
            node = inner.parent.as_ref();
        }
        false
    }

    /// Resolve once this token or any ancestor fires.
    ///
    /// Edge-triggered: resolves immediately if the signal already fired.
    pub async fn cancelled(&self) {
        let mut chain = Vec::new();
        let mut node = Some(self.inner.clone());
        while let Some(inner) = node {
            node = inner.parent.clone();
            chain.push(inner);
        }

        loop {
            // Register waiters before checking the flags so a concurrent
            // cancel between check and await cannot be missed.
            let mut waits: Vec<_> = chain
                .iter()
                .map(|inner| Box::pin(inner.notify.notified()))
                .collect();
            for wait in &mut waits {
                wait.as_mut().enable();
            }
            if chain
                .iter()
                .any(|inner| inner.fired.load(Ordering::Acquire))
            {
                return;
            }
            futures::future::select_all(waits).await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_unfired() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_is_sticky_and_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_share_the_signal() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn parent_cancel_reaches_children() {
        let parent = CancelToken::new();
        let child = parent.child();
        let grandchild = child.child();
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_when_fired() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancelled() did not resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_after_the_fact() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already-fired token should resolve at once");
    }

    #[tokio::test]
    async fn child_observes_parent_fire_while_waiting() {
        let parent = CancelToken::new();
        let child = parent.child();
        let handle = tokio::spawn(async move { child.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("child did not observe parent cancellation")
            .unwrap();
    }
}
