//! Generic event fan-out, used for the dispatcher's node-changed
//! notifications (see [`crate::host`] in `bidib-host`).
//!
//! Handlers are stored in an insertion-ordered map keyed by a unique id so a
//! handler can unsubscribe mid-invocation without disturbing iteration.
//! `invoke` snapshots the handler set under a read lock and runs each
//! handler on its own spawned task, so a slow or panicking handler can never
//! block the caller (matching the "event fan-out executes handlers on
//! spawned tasks; handlers must not assume the scheduler task" rule this
//! mirrors from the dispatcher's own concurrency model).

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::RwLock;

/// A handle returned by [`Event::register`]. Dropping it does nothing; call
/// [`CancelHandle::cancel`] explicitly to unsubscribe.
#[derive(Debug, Clone)]
pub struct CancelHandle<T> {
    id: u64,
    handlers: Arc<RwLock<BTreeMap<u64, Handler<T>>>>,
}

impl<T: Send + Sync + 'static> CancelHandle<T> {
    /// Removes the associated handler. Safe to call more than once; safe to
    /// call from inside the handler itself.
    pub async fn cancel(&self) {
        self.handlers.write().await.remove(&self.id);
    }
}

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// A fan-out point for values of type `T`.
pub struct Event<T> {
    handlers: Arc<RwLock<BTreeMap<u64, Handler<T>>>>,
    next_id: AtomicU64,
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self { handlers: Arc::new(RwLock::new(BTreeMap::new())), next_id: AtomicU64::new(1) }
    }
}

impl<T: Clone + Send + Sync + 'static> Event<T> {
    /// Creates an event with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, returning a handle that can later remove it.
    pub async fn register<F>(&self, handler: F) -> CancelHandle<T>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().await.insert(id, Arc::new(handler));
        CancelHandle { id, handlers: Arc::clone(&self.handlers) }
    }

    /// Invokes every currently registered handler with a clone of `value`,
    /// each on its own spawned task.
    pub async fn invoke(&self, value: T) {
        let snapshot: Vec<Handler<T>> = self.handlers.read().await.values().cloned().collect();
        for handler in snapshot {
            let value = value.clone();
            tokio::spawn(async move {
                handler(value);
            });
        }
    }

    /// Number of currently registered handlers.
    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// `true` if no handlers are registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[tokio::test]
    async fn invoke_calls_every_registered_handler() {
        let event: Event<u32> = Event::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen1 = Arc::clone(&seen);
        event.register(move |v| seen1.lock().unwrap().push(v)).await;
        let seen2 = Arc::clone(&seen);
        event.register(move |v| seen2.lock().unwrap().push(v)).await;

        event.invoke(42).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let mut result = seen.lock().unwrap().clone();
        result.sort_unstable();
        assert_eq!(result, vec![42, 42]);
    }

    #[tokio::test]
    async fn cancel_prevents_future_invocations() {
        let event: Event<u32> = Event::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen1 = Arc::clone(&seen);
        let handle = event.register(move |v| seen1.lock().unwrap().push(v)).await;

        handle.cancel().await;
        assert!(event.is_empty().await);

        event.invoke(1).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_can_cancel_itself_mid_invocation() {
        let event: Event<u32> = Event::new();
        let handle_slot: Arc<Mutex<Option<CancelHandle<u32>>>> = Arc::new(Mutex::new(None));
        let handle_slot_captured = Arc::clone(&handle_slot);
        let calls = Arc::new(Mutex::new(0));
        let calls1 = Arc::clone(&calls);

        let handle = event
            .register(move |_| {
                *calls1.lock().unwrap() += 1;
                let slot = Arc::clone(&handle_slot_captured);
                tokio::spawn(async move {
                    if let Some(h) = slot.lock().unwrap().clone() {
                        h.cancel().await;
                    }
                });
            })
            .await;
        *handle_slot.lock().unwrap() = Some(handle);

        event.invoke(1).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        event.invoke(2).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(*calls.lock().unwrap() <= 2);
    }
}
