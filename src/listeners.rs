//! Ordered event fanout with mixed sync/async subscribers.
//!
//! Every event surface in the crate (`Browser`, `Page`, the frame and network
//! managers) hands callers a [`Listeners`] to subscribe on. Dispatch is
//! strictly sequential: subscribers run in registration order, and an async
//! subscriber is awaited before the next one starts.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

type SyncFn<E> = Arc<dyn Fn(&E) + Send + Sync>;
type AsyncFn<E> = Arc<dyn Fn(E) -> BoxFuture<'static, ()> + Send + Sync>;

/// A single subscriber, either fire-and-forget or awaitable.
pub enum Listener<E> {
    Sync(SyncFn<E>),
    Async(AsyncFn<E>),
}

impl<E> Listener<E> {
    /// Wrap a synchronous callback.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        Listener::Sync(Arc::new(f))
    }

    /// Wrap a callback returning a future that dispatch awaits.
    pub fn async_fn<F>(f: F) -> Self
    where
        F: Fn(E) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Listener::Async(Arc::new(f))
    }

    /// Identity comparison. Two listeners are the same subscriber iff they
    /// share the underlying callable, captured state included.
    fn same(&self, other: &Listener<E>) -> bool {
        match (self, other) {
            (Listener::Sync(a), Listener::Sync(b)) => Arc::ptr_eq(a, b),
            (Listener::Async(a), Listener::Async(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        match self {
            Listener::Sync(f) => Listener::Sync(f.clone()),
            Listener::Async(f) => Listener::Async(f.clone()),
        }
    }
}

/// An ordered, mutation-safe invocation list.
///
/// Dispatch iterates over a snapshot taken at invoke entry, so a subscriber
/// may add or remove listeners (itself included) without disturbing the
/// in-flight dispatch. A subscriber that removes itself still finishes the
/// current dispatch but is never invoked again.
pub struct Listeners<E> {
    inner: Mutex<Vec<Listener<E>>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Append a subscriber. Returns a clone usable as a removal handle.
    pub fn add(&self, listener: Listener<E>) -> Listener<E> {
        let handle = listener.clone();
        self.inner.lock().push(listener);
        handle
    }

    /// Convenience: register a synchronous callback.
    pub fn on<F>(&self, f: F) -> Listener<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.add(Listener::sync(f))
    }

    /// Convenience: register an awaited callback.
    pub fn on_async<F>(&self, f: F) -> Listener<E>
    where
        F: Fn(E) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.add(Listener::async_fn(f))
    }

    /// Remove the first occurrence matching `listener` by identity.
    /// Returns whether anything was removed.
    pub fn remove(&self, listener: &Listener<E>) -> bool {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.iter().position(|l| l.same(listener)) {
            inner.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Copy of the current subscriber list.
    pub fn snapshot(&self) -> Vec<Listener<E>> {
        self.inner.lock().clone()
    }
}

impl<E: Clone> Listeners<E> {
    /// Invoke every subscriber in registration order, awaiting async ones
    /// sequentially. The list is snapshotted on entry; concurrent mutation
    /// affects future dispatches only.
    pub async fn invoke(&self, event: &E) {
        for listener in self.snapshot() {
            match listener {
                Listener::Sync(f) => f(event),
                Listener::Async(f) => f(event.clone()).await,
            }
        }
    }

    /// Invoke every subscriber, blocking the current thread on async ones.
    ///
    /// This can deadlock if an async subscriber needs the current executor
    /// thread to make progress. Only shutdown paths, where the event loop has
    /// already stopped, should use it.
    pub fn invoke_blocking(&self, event: &E) {
        for listener in self.snapshot() {
            match listener {
                Listener::Sync(f) => f(event),
                Listener::Async(f) => futures::executor::block_on(f(event.clone())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use std::time::Duration;

    #[tokio::test]
    async fn invokes_in_registration_order_despite_delays() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let listeners = Listeners::<u32>::new();

        let o1 = order.clone();
        listeners.on_async(move |_| {
            let o1 = o1.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                o1.lock().push(1);
            })
        });
        let o2 = order.clone();
        listeners.on_async(move |_| {
            let o2 = o2.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                o2.lock().push(2);
            })
        });
        let o3 = order.clone();
        listeners.on(move |_| o3.lock().push(3));

        listeners.invoke(&0).await;
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn self_removal_shares_identity_across_copies() {
        let listeners = Arc::new(Listeners::<u32>::new());
        let calls = Arc::new(Mutex::new(0usize));

        let handle: Arc<OnceLock<Listener<u32>>> = Arc::new(OnceLock::new());
        let listener = {
            let listeners = listeners.clone();
            let handle = handle.clone();
            let calls = calls.clone();
            Listener::sync(move |_| {
                *calls.lock() += 1;
                listeners.remove(handle.get().expect("handle set"));
            })
        };
        let _ = handle.set(listener.clone());

        // Registered twice; both entries share the same underlying callable.
        listeners.add(listener.clone());
        listeners.add(listener);
        assert_eq!(listeners.len(), 2);

        listeners.invoke(&0).await;

        // The snapshot ran both copies; each run removed one occurrence.
        assert_eq!(*calls.lock(), 2);
        assert!(listeners.is_empty());

        listeners.invoke(&0).await;
        assert_eq!(*calls.lock(), 2);
    }

    #[tokio::test]
    async fn removal_during_dispatch_does_not_skip_later_subscribers() {
        let listeners = Arc::new(Listeners::<u32>::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle: Arc<OnceLock<Listener<u32>>> = Arc::new(OnceLock::new());
        let first = {
            let listeners = listeners.clone();
            let handle = handle.clone();
            let seen = seen.clone();
            Listener::sync(move |_| {
                seen.lock().push("first");
                listeners.remove(handle.get().expect("handle set"));
            })
        };
        let _ = handle.set(first.clone());
        listeners.add(first);

        let seen2 = seen.clone();
        listeners.on(move |_| seen2.lock().push("second"));

        listeners.invoke(&0).await;
        assert_eq!(*seen.lock(), vec!["first", "second"]);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn remove_takes_one_occurrence_and_matches_by_identity() {
        let listeners = Listeners::<u32>::new();
        let a = listeners.on(|_| {});
        let b = listeners.on(|_| {});
        assert_eq!(listeners.len(), 2);

        // A structurally identical but distinct closure does not match.
        let stranger = Listener::<u32>::sync(|_| {});
        assert!(!listeners.remove(&stranger));

        assert!(listeners.remove(&a));
        assert!(!listeners.remove(&a));
        assert!(listeners.remove(&b));
        assert!(listeners.is_empty());
    }

    #[test]
    fn invoke_blocking_runs_async_subscribers() {
        let hits = Arc::new(Mutex::new(0));
        let listeners = Listeners::<()>::new();
        let h = hits.clone();
        listeners.on_async(move |_| {
            let h = h.clone();
            Box::pin(async move {
                *h.lock() += 1;
            })
        });
        listeners.invoke_blocking(&());
        assert_eq!(*hits.lock(), 1);
    }
}
