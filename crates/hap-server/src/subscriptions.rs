//! Per-connection event subscription registry.

use hap_accessory::ConnectionId;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Which connections want change events for which (aid, iid).
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<HashMap<(u64, u64), BTreeSet<ConnectionId>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. Returns whether the state actually changed.
    pub fn subscribe(&self, connection: ConnectionId, key: (u64, u64)) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let added = inner.entry(key).or_default().insert(connection);
        if added {
            debug!(%connection, aid = key.0, iid = key.1, "subscribed to events");
        }
        added
    }

    /// Remove a subscription. Returns whether the state actually changed.
    pub fn unsubscribe(&self, connection: ConnectionId, key: (u64, u64)) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = inner
            .get_mut(&key)
            .map(|subs| subs.remove(&connection))
            .unwrap_or(false);
        if removed {
            debug!(%connection, aid = key.0, iid = key.1, "unsubscribed from events");
        }
        removed
    }

    pub fn is_subscribed(&self, connection: ConnectionId, key: (u64, u64)) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .get(&key)
            .map(|subs| subs.contains(&connection))
            .unwrap_or(false)
    }

    /// All connections subscribed to an address.
    pub fn subscribers(&self, key: (u64, u64)) -> Vec<ConnectionId> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .get(&key)
            .map(|subs| subs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop every subscription a closing connection had registered.
    /// Returns how many were removed.
    pub fn remove_connection(&self, connection: ConnectionId) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for subs in inner.values_mut() {
            if subs.remove(&connection) {
                removed += 1;
            }
        }
        inner.retain(|_, subs| !subs.is_empty());
        if removed > 0 {
            debug!(%connection, removed, "cleared subscriptions for closed connection");
        }
        removed
    }
}
