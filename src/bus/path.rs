//! Path-keyed broadcast for configuration changes.
//!
//! A handler fires when its registered path is a string prefix of the
//! outgoing value's path, so both exact-path and subtree subscriptions work.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error};

use super::SubscriptionId;
use crate::settings::SettingValue;

type PathHandler = Box<dyn Fn(&SettingValue) + Send + Sync>;

struct PathSubscription {
    id: SubscriptionId,
    prefix: String,
    handler: PathHandler,
}

/// Prefix rule shared by registration and delivery.
pub(super) fn path_matches(registered: &str, path: &str) -> bool {
    path.starts_with(registered)
}

#[derive(Default)]
pub(super) struct PathChannel {
    next_id: AtomicU64,
    subscriptions: RwLock<Vec<Arc<PathSubscription>>>,
}

impl PathChannel {
    pub(super) fn register<F>(&self, prefix: String, handler: F) -> SubscriptionId
    where
        F: Fn(&SettingValue) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(prefix = %prefix, "Path subscription registered");

        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(PathSubscription {
                id,
                prefix,
                handler: Box::new(handler),
            }));
        id
    }

    pub(super) fn unregister(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    pub(super) fn send(&self, value: &SettingValue) -> usize {
        let targets: Vec<Arc<PathSubscription>> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| path_matches(&s.prefix, &value.path))
            .cloned()
            .collect();

        let mut fired = 0;
        for subscription in &targets {
            match catch_unwind(AssertUnwindSafe(|| (subscription.handler)(value))) {
                Ok(()) => fired += 1,
                Err(_) => error!(
                    prefix = %subscription.prefix,
                    path = %value.path,
                    "Path handler panicked"
                ),
            }
        }
        fired
    }
}
