//! A single-shot promise with external resolve/reject, used for the
//! pending-connect handshake and the ping/pong rendezvous.
//!
//! Built on `tokio::sync::oneshot`, the same primitive the teacher's
//! `client/worker.rs` uses for its own one-shot request/response channels
//! (`oneshot::Sender<oneshot::Receiver<FunctionResult>>`). The extra layer
//! here buys idempotent resolve/reject, which a bare oneshot doesn't offer.

use std::sync::Arc;

use tokio::sync::{
    oneshot,
    Mutex,
};

/// The receiving half. Cloning shares the same underlying oneshot receiver
/// via a broadcast-once future; awaiting it more than once after it has
/// already resolved returns the cached result.
#[derive(Clone)]
pub struct Deferred<T: Clone> {
    inner: Arc<Mutex<DeferredState<T>>>,
}

enum DeferredState<T> {
    Pending(oneshot::Receiver<T>),
    Resolved(T),
    Dropped,
}

struct DeferredHandle<T> {
    sender: Option<oneshot::Sender<T>>,
}

/// The resolving half, returned alongside the `Deferred` by [`deferred`].
pub struct Resolver<T> {
    handle: Arc<std::sync::Mutex<DeferredHandle<T>>>,
}

impl<T> Resolver<T> {
    /// Idempotent: only the first call has any effect.
    pub fn resolve(&self, value: T) {
        let mut handle = self.handle.lock().expect("deferred resolver poisoned");
        if let Some(sender) = handle.sender.take() {
            let _ = sender.send(value);
        }
    }
}

pub fn deferred<T: Clone + Send + 'static>() -> (Deferred<T>, Resolver<T>) {
    let (tx, rx) = oneshot::channel();
    let handle = Arc::new(std::sync::Mutex::new(DeferredHandle { sender: Some(tx) }));
    (
        Deferred {
            inner: Arc::new(Mutex::new(DeferredState::Pending(rx))),
        },
        Resolver { handle },
    )
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// Awaits resolution. Returns `None` if the resolver was dropped without
    /// ever resolving (e.g. the connection was torn down mid-handshake).
    pub async fn wait(&self) -> Option<T> {
        let mut guard = self.inner.lock().await;
        match &mut *guard {
            DeferredState::Resolved(value) => Some(value.clone()),
            DeferredState::Dropped => None,
            DeferredState::Pending(rx) => match rx.await {
                Ok(value) => {
                    *guard = DeferredState::Resolved(value.clone());
                    Some(value)
                },
                Err(_) => {
                    *guard = DeferredState::Dropped;
                    None
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_once() {
        let (d, r) = deferred::<u32>();
        r.resolve(7);
        r.resolve(9); // no-op, idempotent
        assert_eq!(d.wait().await, Some(7));
        assert_eq!(d.wait().await, Some(7));
    }

    #[tokio::test]
    async fn dropped_resolver_yields_none() {
        let (d, r) = deferred::<u32>();
        drop(r);
        assert_eq!(d.wait().await, None);
    }

    #[tokio::test]
    async fn multiple_waiters_observe_same_value() {
        let (d, r) = deferred::<u32>();
        let d2 = d.clone();
        let task = tokio::spawn(async move { d2.wait().await });
        tokio::task::yield_now().await;
        r.resolve(42);
        assert_eq!(d.wait().await, Some(42));
        assert_eq!(task.await.unwrap(), Some(42));
    }
}
