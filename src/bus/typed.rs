//! Typed broadcast channel with weakly-held subscribers.
//!
//! The bus never owns a subscriber: registration keeps a `Weak` and upgrades
//! it per delivery. Subscribers dropped without unregistering are pruned on
//! the next send that reaches them.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Instant;

use tracing::{debug, error};

use super::metrics::RelayMetrics;
use super::SubscriptionId;

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    SubscriberDropped,
}

type Deliver = Box<dyn Fn(&(dyn Any + Send + Sync)) -> Delivery + Send + Sync>;
type Alive = Box<dyn Fn() -> bool + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    /// Address of the subscriber allocation, used as its identity.
    subscriber: usize,
    subscriber_kind: &'static str,
    message_kind: &'static str,
    deliver: Deliver,
    alive: Alive,
}

/// Identity of a subscriber: the address of its `Arc` allocation.
fn identity_of<S>(subscriber: &Arc<S>) -> usize {
    Arc::as_ptr(subscriber) as *const () as usize
}

/// Short type name for metrics: the last path segment.
fn short_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[derive(Default)]
pub(super) struct TypedChannel {
    next_id: AtomicU64,
    subscriptions: RwLock<HashMap<TypeId, Vec<Arc<Subscription>>>>,
}

impl TypedChannel {
    pub(super) fn register<S, M, F>(&self, subscriber: &Arc<S>, handler: F) -> SubscriptionId
    where
        S: Send + Sync + 'static,
        M: Send + Sync + 'static,
        F: Fn(&S, &M) + Send + Sync + 'static,
    {
        let weak: Weak<S> = Arc::downgrade(subscriber);
        let watched = weak.clone();
        let alive: Alive = Box::new(move || watched.strong_count() > 0);
        let deliver: Deliver = Box::new(move |message| {
            let Some(subscriber) = weak.upgrade() else {
                return Delivery::SubscriberDropped;
            };
            if let Some(message) = message.downcast_ref::<M>() {
                handler(&subscriber, message);
            }
            Delivery::Delivered
        });

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Arc::new(Subscription {
            id,
            subscriber: identity_of(subscriber),
            subscriber_kind: short_name::<S>(),
            message_kind: short_name::<M>(),
            deliver,
            alive,
        });

        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let list = subscriptions.entry(TypeId::of::<M>()).or_default();
        // Dead entries go first so a reused allocation address never aliases them.
        list.retain(|s| (s.alive)());
        list.push(subscription);

        debug!(
            subscriber = short_name::<S>(),
            message = short_name::<M>(),
            "Subscriber registered on relay bus"
        );

        id
    }

    /// Remove every registration held for `subscriber`, pruning dead ones as well.
    ///
    /// Returns how many live registrations of `subscriber` were removed.
    pub(super) fn unregister<S>(&self, subscriber: &Arc<S>) -> usize {
        let identity = identity_of(subscriber);
        let mut removed = 0;
        self.retain(|s| {
            if !(s.alive)() {
                return false;
            }
            if s.subscriber == identity {
                removed += 1;
                return false;
            }
            true
        });
        removed
    }

    pub(super) fn unregister_id(&self, id: SubscriptionId) -> bool {
        self.retain(|s| s.id != id) > 0
    }

    fn retain(&self, mut keep: impl FnMut(&Subscription) -> bool) -> usize {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for list in subscriptions.values_mut() {
            let before = list.len();
            list.retain(|s| keep(s));
            removed += before - list.len();
        }
        subscriptions.retain(|_, list| !list.is_empty());
        removed
    }

    pub(super) fn subscriber_count<M: 'static>(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<M>())
            .map_or(0, Vec::len)
    }

    /// Deliver `message` to every live subscriber of its type.
    ///
    /// Handlers run outside the registry lock, so a handler may register or
    /// unregister without deadlocking. Returns the number of deliveries.
    pub(super) fn send<M>(&self, message: &M, metrics: Option<&RelayMetrics>) -> usize
    where
        M: Send + Sync + 'static,
    {
        let targets: Vec<Arc<Subscription>> = match self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<M>())
        {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut dropped = Vec::new();

        for subscription in &targets {
            let started = metrics.map(|_| Instant::now());
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                (subscription.deliver)(message as &(dyn Any + Send + Sync))
            }));

            match outcome {
                Ok(Delivery::Delivered) => {
                    delivered += 1;
                    if let (Some(metrics), Some(started)) = (metrics, started) {
                        metrics.record(
                            subscription.message_kind,
                            subscription.subscriber_kind,
                            started.elapsed(),
                        );
                    }
                }
                Ok(Delivery::SubscriberDropped) => dropped.push(subscription.id),
                Err(_) => {
                    error!(
                        subscriber = subscription.subscriber_kind,
                        message = subscription.message_kind,
                        "Subscriber panicked while handling message"
                    );
                }
            }
        }

        if !dropped.is_empty() {
            let pruned = self.retain(|s| !dropped.contains(&s.id));
            debug!(pruned, "Pruned dropped subscribers from relay bus");
        }

        delivered
    }
}
