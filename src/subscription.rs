//! Interest tracking per key.
//!
//! Every binding holds one subscription. The manager reference-counts them per
//! key and derives the key's effective poll interval: the minimum interval
//! across its live subscriptions. Each mutation reports how the key's interest
//! changed so the scheduler and cache can follow.

use crate::registry::Key;
use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

/// Identifies a consumer (one presentation unit) across its subscriptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Returned by `subscribe`; pass back to `unsubscribe`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    key: Key,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> &Key {
        &self.key
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Subscription {
    pub key: Key,
    pub interval: Duration,
    pub consumer: ConsumerId,
}

/// How a key's interest changed after a subscribe or unsubscribe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InterestChange {
    /// First subscription for the key.
    Added { key: Key, interval: Duration },
    /// The effective interval moved.
    Retimed {
        key: Key,
        from: Duration,
        to: Duration,
    },
    /// Subscriber count changed, effective interval did not.
    Unchanged { key: Key, interval: Duration },
    /// Last subscription for the key is gone.
    Removed { key: Key },
}

#[derive(Default)]
pub struct SubscriptionManager {
    next_id: u64,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    per_key: HashMap<Key, BTreeMap<SubscriptionId, Duration>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        key: Key,
        interval: Duration,
        consumer: ConsumerId,
    ) -> (SubscriptionHandle, InterestChange) {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);

        let before = self.effective_interval(&key);
        self.per_key
            .entry(key.clone())
            .or_default()
            .insert(id, interval);
        self.subscriptions.insert(
            id,
            Subscription {
                key: key.clone(),
                interval,
                consumer,
            },
        );
        let after = self.effective_interval(&key).unwrap_or(interval);

        debug!(
            "[Subs] {} subscribed {} to {} every {:?} ({} subscriber(s))",
            consumer,
            id,
            key,
            interval,
            self.subscriber_count(&key)
        );

        let change = match before {
            None => InterestChange::Added {
                key: key.clone(),
                interval: after,
            },
            Some(from) if from != after => InterestChange::Retimed {
                key: key.clone(),
                from,
                to: after,
            },
            Some(_) => InterestChange::Unchanged {
                key: key.clone(),
                interval: after,
            },
        };
        (SubscriptionHandle { id, key }, change)
    }

    /// Remove a subscription. Returns `None` when the handle is no longer
    /// tracked; calling this twice is harmless.
    pub fn unsubscribe(&mut self, handle: &SubscriptionHandle) -> Option<InterestChange> {
        let subscription = self.subscriptions.remove(&handle.id)?;
        let key = subscription.key;

        let before = self.effective_interval(&key);
        let remaining = match self.per_key.get_mut(&key) {
            Some(subs) => {
                subs.remove(&handle.id);
                subs.len()
            }
            None => 0,
        };
        if remaining == 0 {
            self.per_key.remove(&key);
        }

        debug!(
            "[Subs] {} unsubscribed {} from {} ({} subscriber(s) left)",
            subscription.consumer, handle.id, key, remaining
        );

        let after = self.effective_interval(&key);
        Some(match (before, after) {
            (_, None) => InterestChange::Removed { key },
            (Some(from), Some(to)) if from != to => InterestChange::Retimed { key, from, to },
            (_, Some(interval)) => InterestChange::Unchanged { key, interval },
        })
    }

    /// Minimum interval across the live subscriptions of `key`.
    pub fn effective_interval(&self, key: &Key) -> Option<Duration> {
        self.per_key
            .get(key)
            .and_then(|subs| subs.values().min().copied())
    }

    pub fn subscriber_count(&self, key: &Key) -> usize {
        self.per_key.get(key).map_or(0, |subs| subs.len())
    }

    pub fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(&id)
    }

    pub fn is_subscribed(&self, key: &Key) -> bool {
        self.per_key.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.per_key.keys()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::canonicalize;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn bat() -> Key {
        canonicalize("L:A32NX_ELEC_BAT_1_POTENTIAL", "Volts").unwrap()
    }

    #[test]
    fn test_first_subscription_adds_key() {
        let mut subs = SubscriptionManager::new();
        let (handle, change) = subs.subscribe(bat(), ms(200), ConsumerId(1));
        assert_eq!(
            change,
            InterestChange::Added {
                key: bat(),
                interval: ms(200)
            }
        );
        assert_eq!(handle.key(), &bat());
        assert_eq!(subs.subscriber_count(&bat()), 1);
    }

    #[test]
    fn test_effective_interval_is_minimum() {
        let mut subs = SubscriptionManager::new();
        let (slow, _) = subs.subscribe(bat(), ms(500), ConsumerId(1));
        let (fast, change) = subs.subscribe(bat(), ms(200), ConsumerId(2));
        assert_eq!(
            change,
            InterestChange::Retimed {
                key: bat(),
                from: ms(500),
                to: ms(200)
            }
        );

        let (_, change) = subs.subscribe(bat(), ms(1000), ConsumerId(3));
        assert_eq!(
            change,
            InterestChange::Unchanged {
                key: bat(),
                interval: ms(200)
            }
        );

        assert_eq!(
            subs.unsubscribe(&fast),
            Some(InterestChange::Retimed {
                key: bat(),
                from: ms(200),
                to: ms(500)
            })
        );
        assert_eq!(
            subs.unsubscribe(&slow),
            Some(InterestChange::Retimed {
                key: bat(),
                from: ms(500),
                to: ms(1000)
            })
        );
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let mut subs = SubscriptionManager::new();
        let (handle, _) = subs.subscribe(bat(), ms(200), ConsumerId(1));

        assert_eq!(
            subs.unsubscribe(&handle),
            Some(InterestChange::Removed { key: bat() })
        );
        assert_eq!(subs.unsubscribe(&handle), None);
        assert!(subs.is_empty());
        assert!(!subs.is_subscribed(&bat()));
        assert_eq!(subs.effective_interval(&bat()), None);
    }

    #[test]
    fn test_minimum_holds_for_any_removal_order() {
        let intervals = [300, 100, 700, 100, 250];
        // Try removing in each rotation of the subscription order.
        for rotation in 0..intervals.len() {
            let mut subs = SubscriptionManager::new();
            let mut handles: Vec<(SubscriptionHandle, u64)> = intervals
                .iter()
                .enumerate()
                .map(|(i, &n)| (subs.subscribe(bat(), ms(n), ConsumerId(i as u64)).0, n))
                .collect();
            handles.rotate_left(rotation);

            while let Some((handle, _)) = handles.pop() {
                subs.unsubscribe(&handle);
                let expected = handles.iter().map(|(_, n)| *n).min().map(ms);
                assert_eq!(subs.effective_interval(&bat()), expected);
            }
        }
    }
}
