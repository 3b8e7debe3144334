//! Per-consumer change detection.
//!
//! After each cache update the notifier compares the new value against what it
//! last delivered to every binding on that key, and produces a [`Dispatch`]
//! only for bindings that need one. Dispatches are delivered by the caller
//! after the engine state lock is released, so callbacks may read accessors.

use crate::registry::Key;
use crate::source::Value;
use crate::subscription::{ConsumerId, SubscriptionId};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use parking_lot::ReentrantMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Callback invoked when a binding's value should be re-rendered.
pub type NotifyFn = Arc<dyn Fn(&Notification) + Send + Sync>;

/// When a binding is notified.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Only when the value differs from the last delivered one.
    #[default]
    OnChange,
    /// Also when the last delivery is more than `max_version_lag` polls old.
    /// `max_version_lag: 0` notifies on every poll.
    Forced { max_version_lag: u64 },
}

impl RefreshPolicy {
    /// Notify on every poll, changed or not.
    pub fn every_poll() -> Self {
        RefreshPolicy::Forced { max_version_lag: 0 }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub subscription: SubscriptionId,
    pub consumer: ConsumerId,
    pub key: Key,
    pub value: Value,
    pub version: u64,
    /// Delivered because of a forced refresh, not a value change.
    pub forced: bool,
}

/// Open/closed latch shared by a binding and its pending dispatches.
///
/// Every delivery from one notifier runs under a shared re-entrant lock, and
/// closing takes the same lock, so once [`DeliveryGate::close`] returns no
/// callback of that binding is running or will run again. A callback may
/// close gates, its own included.
#[derive(Clone)]
pub struct DeliveryGate {
    delivery: Arc<ReentrantMutex<()>>,
    open: Arc<AtomicBool>,
}

impl DeliveryGate {
    fn new(delivery: &Arc<ReentrantMutex<()>>) -> Self {
        Self {
            delivery: Arc::clone(delivery),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        let _delivering = self.delivery.lock();
        self.open.store(false, Ordering::SeqCst);
    }

    fn run(&self, f: impl FnOnce()) -> bool {
        let _delivering = self.delivery.lock();
        if !self.is_open() {
            return false;
        }
        f();
        true
    }
}

/// What the notifier remembers about one consumer's view of a key.
pub struct ConsumerBinding {
    subscription: SubscriptionId,
    consumer: ConsumerId,
    last_value: Option<Value>,
    last_seen_version: u64,
    policy: RefreshPolicy,
    callback: NotifyFn,
    gate: DeliveryGate,
}

impl ConsumerBinding {
    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    pub fn last_seen_version(&self) -> u64 {
        self.last_seen_version
    }

    /// Decide whether `(value, version)` should be delivered, recording it as
    /// seen if so.
    fn observe(&mut self, value: Value, version: u64) -> Option<bool> {
        let changed = self.last_value != Some(value);
        let forced = match self.policy {
            RefreshPolicy::OnChange => false,
            RefreshPolicy::Forced { max_version_lag } => {
                version.saturating_sub(self.last_seen_version) > max_version_lag
            }
        };
        if !changed && !forced {
            return None;
        }
        self.last_value = Some(value);
        self.last_seen_version = version;
        Some(!changed)
    }
}

/// A pending callback invocation.
pub struct Dispatch {
    notification: Notification,
    callback: NotifyFn,
    gate: DeliveryGate,
}

impl Dispatch {
    pub fn notification(&self) -> &Notification {
        &self.notification
    }

    /// Invoke the callback unless the binding was removed since this dispatch
    /// was produced. Returns whether the callback ran.
    pub fn deliver(self) -> bool {
        let ran = self.gate.run(|| (self.callback)(&self.notification));
        if !ran {
            trace!(
                "[Notify] Dropping dispatch for removed {}",
                self.notification.subscription
            );
        }
        ran
    }
}

#[derive(Default)]
pub struct ChangeNotifier {
    bindings: HashMap<Key, Vec<ConsumerBinding>>,
    index: HashMap<SubscriptionId, Key>,
    delivery: Arc<ReentrantMutex<()>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding. `current` is the value and version the consumer
    /// already sees at mount time, if the key has been polled before.
    pub fn register(
        &mut self,
        subscription: SubscriptionId,
        consumer: ConsumerId,
        key: Key,
        policy: RefreshPolicy,
        callback: NotifyFn,
        current: Option<(Value, u64)>,
    ) {
        let (last_value, last_seen_version) = match current {
            Some((value, version)) => (Some(value), version),
            None => (None, 0),
        };
        self.index.insert(subscription, key.clone());
        self.bindings.entry(key).or_default().push(ConsumerBinding {
            subscription,
            consumer,
            last_value,
            last_seen_version,
            policy,
            callback,
            gate: DeliveryGate::new(&self.delivery),
        });
    }

    /// Remove a binding so no new dispatches are produced for it.
    ///
    /// Returns its gate; closing it makes already produced dispatches inert.
    /// The caller closes it once no engine lock is held, since closing waits
    /// for a delivery in progress.
    pub fn deregister(&mut self, subscription: SubscriptionId) -> Option<DeliveryGate> {
        let key = self.index.remove(&subscription)?;
        let bindings = self.bindings.get_mut(&key)?;
        let gate = bindings
            .iter()
            .position(|b| b.subscription == subscription)
            .map(|pos| bindings.swap_remove(pos).gate);
        if bindings.is_empty() {
            self.bindings.remove(&key);
        }
        gate
    }

    /// Diff a fresh cache update against every binding on `key`.
    pub fn on_update(&mut self, key: &Key, value: Value, version: u64) -> Vec<Dispatch> {
        let Some(bindings) = self.bindings.get_mut(key) else {
            return Vec::new();
        };

        let mut dispatches = Vec::new();
        for binding in bindings.iter_mut() {
            let Some(forced) = binding.observe(value, version) else {
                continue;
            };
            dispatches.push(Dispatch {
                notification: Notification {
                    subscription: binding.subscription,
                    consumer: binding.consumer,
                    key: key.clone(),
                    value,
                    version,
                    forced,
                },
                callback: Arc::clone(&binding.callback),
                gate: binding.gate.clone(),
            });
        }

        if !dispatches.is_empty() {
            debug!(
                "[Notify] {} v{} = {} -> {} binding(s)",
                key,
                version,
                value,
                dispatches.len()
            );
        }
        dispatches
    }

    pub fn binding_count(&self, key: &Key) -> usize {
        self.bindings.get(key).map_or(0, |b| b.len())
    }

    pub fn is_registered(&self, subscription: SubscriptionId) -> bool {
        self.index.contains_key(&subscription)
    }
}
