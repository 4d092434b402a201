//! Subscriber registry and fan-out

use crate::error::EventBusError;
use crate::handlers::{EventHandler, InfallibleHandler};
use parking_lot::RwLock;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Identifier handed out for every subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscriber<E> {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler<E>>,
}

struct BusInner<E> {
    subscribers: RwLock<Vec<Subscriber<E>>>,
    next_id: AtomicU64,
}

impl<E> BusInner<E> {
    fn remove(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }
}

/// Synchronous publish/subscribe channel.
///
/// Cloning the bus yields another handle to the same subscriber set.
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a handler. It stays registered until
    /// [`Subscription::unsubscribe`] is called.
    pub fn subscribe<H>(&self, handler: H) -> Subscription<E>
    where
        H: EventHandler<E> + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.write().push(Subscriber {
            id,
            handler: Arc::new(handler),
        });

        tracing::debug!(subscription = id.0, "Event subscriber registered");

        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Register a closure that cannot fail
    pub fn subscribe_fn<F>(&self, handler: F) -> Subscription<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe(InfallibleHandler(handler))
    }

    /// Deliver `event` to every subscriber registered at the time of the call.
    ///
    /// The subscriber list is snapshotted first, so handlers may subscribe or
    /// unsubscribe (themselves included) while the event is being delivered.
    /// Returns the number of handlers that completed without error.
    pub fn publish(&self, event: &E) -> usize {
        let snapshot: Vec<(SubscriptionId, Arc<dyn EventHandler<E>>)> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect();

        let mut delivered = 0;
        for (id, handler) in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle_event(event)))
                .unwrap_or(Err(EventBusError::HandlerPanicked));

            match outcome {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(subscription = id.0, error = %e, "Event handler failed");
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

/// Handle returned by [`EventBus::subscribe`]
pub struct Subscription<E> {
    id: SubscriptionId,
    bus: Weak<BusInner<E>>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the handler from the bus. Returns `false` if it was already
    /// removed or the bus no longer exists.
    pub fn unsubscribe(&self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => inner.remove(self.id),
            None => false,
        }
    }
}

impl<E> fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
