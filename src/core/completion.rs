//! One-shot, multi-waiter completion cell.
//!
//! Backs the two independent result channels of a handle (process outcome
//! and cleanup). Resolved at most once; any number of tasks may await it,
//! before or after resolution.

use tokio::sync::watch;

#[derive(Debug)]
pub struct Completion<T: Clone> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Store `value` unless already resolved. Returns whether this call won.
    pub fn resolve(&self, value: T) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = value.take();
                true
            } else {
                false
            }
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Current value without waiting.
    pub fn peek(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().as_ref() {
                return value.clone();
            }
            // The sender lives in `self`, so the channel cannot close here.
            if rx.changed().await.is_err() {
                tokio::task::yield_now().await;
            }
        }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}
