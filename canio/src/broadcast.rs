//! Synchronous single-writer fan-out.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Registry<T> {
    next_id: u64,
    channels: BTreeMap<SubscriberId, mpsc::Sender<T>>,
}

/// Delivers every item to every subscriber, in registration order, one item
/// at a time.
///
/// Each subscriber gets a capacity-1 channel. [`send_blocking`] waits for
/// room in each of them, so the slowest subscriber sets the pace for all.
///
/// [`send_blocking`]: Broadcast::send_blocking
pub struct Broadcast<T> {
    registry: Mutex<Registry<T>>,
}

impl<T> Default for Broadcast<T> {
    fn default() -> Self {
        Broadcast {
            registry: Mutex::new(Registry {
                next_id: 0,
                channels: BTreeMap::new(),
            }),
        }
    }
}

impl<T: Clone> Broadcast<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry<T>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(1);
        let mut registry = self.registry();
        let id = SubscriberId(registry.next_id);
        registry.next_id += 1;
        registry.channels.insert(id, tx);
        (id, rx)
    }

    /// Returns whether `id` was registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.registry().channels.remove(&id).is_some()
    }

    fn is_subscribed(&self, id: SubscriberId) -> bool {
        self.registry().channels.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.registry().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscriber. Returns how many there were.
    pub fn clear(&self) -> usize {
        let mut registry = self.registry();
        let count = registry.channels.len();
        registry.channels.clear();
        count
    }

    /// Hand `item` to every subscriber. Must not be called from async context.
    ///
    /// Works from a snapshot of the senders so (un)subscribing never waits for
    /// a slow consumer. A subscriber removed mid-delivery is skipped, unless
    /// its send was already blocked. Subscribers whose receiver is gone are
    /// pruned and reported in the returned list.
    pub fn send_blocking(&self, item: &T) -> Vec<SubscriberId> {
        let targets: Vec<_> = self
            .registry()
            .channels
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut gone = Vec::new();
        for (id, tx) in targets {
            if !self.is_subscribed(id) {
                continue;
            }
            if tx.blocking_send(item.clone()).is_err() {
                gone.push(id);
            }
        }

        if !gone.is_empty() {
            let mut registry = self.registry();
            gone.retain(|id| registry.channels.remove(id).is_some());
        }
        gone
    }
}
