//! Single-writer observable state
//!
//! A [`StatePublisher`] is owned by exactly one task (the connection manager
//! or the acquisition session). Everyone else holds a [`StateView`], which
//! only ever hands out clones of the latest value.

use std::time::Duration;

use tokio::sync::watch;

/// Write half. Not `Clone`: there is one writer per state surface.
#[derive(Debug)]
pub struct StatePublisher<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + PartialEq> StatePublisher<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Replace the value, notifying views only if it changed
    pub fn publish(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    /// Mutate in place, notifying views only if the value changed
    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool {
        self.tx.send_if_modified(|current| {
            let before = current.clone();
            f(current);
            *current != before
        })
    }

    pub fn current(&self) -> T {
        self.tx.borrow().clone()
    }

    pub fn view(&self) -> StateView<T> {
        StateView {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read half with replay of the last value
#[derive(Debug, Clone)]
pub struct StateView<T> {
    rx: watch::Receiver<T>,
}

impl<T: Clone> StateView<T> {
    /// Snapshot of the latest value
    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Wait for the next change and return the new value
    ///
    /// Returns `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until `pred` holds, or `timeout` elapses
    pub async fn wait_for(
        &mut self,
        timeout: Duration,
        mut pred: impl FnMut(&T) -> bool,
    ) -> Option<T> {
        let fut = self.rx.wait_for(|v| pred(v));
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }
}
