//! Single-slot FIFO lock serializing the playback pipeline's drain step.
//!
//! `tokio::sync::Mutex` already wakes waiters in acquisition order, which is
//! exactly the guarantee this component needs; this type exists as its own
//! small, named concern the way the teacher keeps `sync_types::backoff`
//! standalone rather than inlining it into the worker loop.

use std::future::Future;

use tokio::sync::Mutex;

pub struct OrderedMutex<S> {
    state: Mutex<S>,
}

impl<S> OrderedMutex<S> {
    pub fn new(state: S) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Runs `f` with exclusive access to the guarded state. Concurrent
    /// callers run in the order their `with_lock` calls were initiated; a
    /// panic inside `f` still releases the lock via guard drop.
    pub async fn with_lock<F, Fut, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut S) -> Fut,
        Fut: Future<Output = R>,
    {
        let mut guard = self.state.lock().await;
        f(&mut guard).await
    }
}
