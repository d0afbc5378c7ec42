//! One-shot completion source shared between the orchestration routine and
//! its observers.
//!
//! At most one producer succeeds in setting the value; later attempts are
//! no-ops. Any number of tasks can await the value concurrently, and every
//! observer that sees "resolved" reads the same value.

use std::sync::Mutex;

use tokio::sync::Notify;

/// A value that is set at most once and awaited by any number of tasks.
#[derive(Debug)]
pub struct CompletionSource<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T: Clone> CompletionSource<T> {
    /// Creates an unresolved completion source.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Attempts to resolve with `value`.
    ///
    /// Returns `true` if this call set the value, `false` if it was already
    /// resolved. Exactly one caller ever observes `true`.
    pub fn try_set(&self, value: T) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        drop(slot);
        self.notify.notify_waiters();
        true
    }

    /// Returns the resolved value, or `None` if unresolved.
    pub fn get(&self) -> Option<T> {
        self.slot.lock().unwrap().clone()
    }

    /// Returns `true` if the value has been set.
    pub fn is_set(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Waits until the value is set and returns a clone of it.
    pub async fn wait(&self) -> T {
        loop {
            // Register interest before re-checking so a concurrent try_set
            // between the check and the await cannot be missed.
            let notified = self.notify.notified();
            if let Some(value) = self.get() {
                return value;
            }
            notified.await;
        }
    }
}

impl<T: Clone> Default for CompletionSource<T> {
    fn default() -> Self {
        Self::new()
    }
}
