//! One-shot completion holder
//!
//! A `Deferred<T>` transitions exactly once from pending to resolved; any
//! number of waiters observe the same value. All state-machine edges in the
//! executor and service lifecycle rendezvous on these instead of raw channels,
//! and no lock is ever held across an await of one.

use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;

struct Inner<T> {
    cell: OnceLock<T>,
    notify: Notify,
}

/// A value holder that resolves at most once.
///
/// Cloning is shallow: clones share the same underlying slot.
pub struct Deferred<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deferred<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cell: OnceLock::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Resolve the holder. The first call wins; later calls are no-ops and
    /// return false.
    pub fn resolve(&self, value: T) -> bool {
        if self.inner.cell.set(value).is_ok() {
            self.inner.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    /// The resolved value, if any.
    pub fn peek(&self) -> Option<&T> {
        self.inner.cell.get()
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.cell.get().is_some()
    }
}

impl<T: Clone> Deferred<T> {
    /// Wait until resolved and return a clone of the value.
    pub async fn wait(&self) -> T {
        loop {
            // Register interest before checking, so a resolve between the
            // check and the await still wakes us.
            let notified = self.inner.notify.notified();
            if let Some(value) = self.inner.cell.get() {
                return value.clone();
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn resolve_wakes_waiters_and_first_resolve_wins() {
        let deferred: Deferred<u32> = Deferred::new();

        let waiter = {
            let deferred = deferred.clone();
            tokio::spawn(async move { deferred.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(deferred.resolve(7));
        assert!(!deferred.resolve(8));

        assert_eq!(waiter.await.unwrap(), 7);
        assert_eq!(deferred.peek(), Some(&7));
    }

    #[tokio::test]
    async fn wait_after_resolve_returns_immediately() {
        let deferred: Deferred<&'static str> = Deferred::new();
        deferred.resolve("done");
        assert_eq!(deferred.wait().await, "done");
    }
}
