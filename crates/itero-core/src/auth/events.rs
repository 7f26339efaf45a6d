//! Session change notifications.
//!
//! An in-process observer list. `emit` calls every subscriber, in
//! subscription order, before returning. There is no replay: a subscriber
//! that needs the current state reads it from `SessionManager`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Observable session facts, emitted on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionInfo {
    pub registered: bool,
    pub user: String,
}

impl SessionInfo {
    pub fn registered(user: impl Into<String>) -> Self {
        Self {
            registered: true,
            user: user.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            registered: false,
            user: String::new(),
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&SessionInfo) + Send + Sync>;

#[derive(Default)]
pub struct SessionEvents {
    subscribers: Mutex<Vec<(SubscriptionId, Callback)>>,
    next_id: AtomicU64,
}

impl SessionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Callback)>> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SessionInfo) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(callback)));
        id
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver `info` to every current subscriber.
    ///
    /// The list is snapshotted first, so callbacks may subscribe or
    /// unsubscribe; such changes apply from the next emission.
    pub fn emit(&self, info: &SessionInfo) {
        let snapshot: Vec<Callback> = self.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for callback in snapshot {
            callback(info);
        }
    }
}
