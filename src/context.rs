//! The synchronization engine.
//!
//! [`SyncContext`] owns the cache, subscription table, scheduler and notifier
//! for one host connection. It is constructed once and handed to every
//! binding site; clones share the same engine.
//!
//! A tick runs in three phases:
//! 1. Under the state lock, take the keys that are due and mark them in
//!    flight. A key whose previous read is still pending is skipped.
//! 2. Without any lock, read them from the host concurrently, each bounded by
//!    the read timeout.
//! 3. As each read finishes, write its result into the cache under the state
//!    lock and collect notifications; then release the lock and deliver them.
//!
//! A key has at most one read outstanding, so for any key the polls and their
//! notifications are strictly ordered, while a slow key never holds up the
//! others. Callbacks run without the state lock held and may freely read
//! accessors or unsubscribe.

use crate::cache::CacheEntry;
use crate::cache::ValueCache;
use crate::config::PollConfig;
use crate::error::{Result, SyncError};
use crate::notifier::{ChangeNotifier, Dispatch, NotifyFn, RefreshPolicy};
use crate::registry::{self, Key};
use crate::scheduler::PollScheduler;
use crate::source::{ExternalStateSource, Value};
use crate::subscription::{ConsumerId, InterestChange, SubscriptionHandle, SubscriptionManager};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Running totals since the engine was created.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EngineStats {
    pub ticks: u64,
    pub reads: u64,
    pub failed_reads: u64,
    pub notifications: u64,
}

/// Outcome of a single tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Keys read from the host.
    pub polled: usize,
    /// Reads that landed in the cache.
    pub updated: usize,
    /// Reads that failed or timed out.
    pub failed: usize,
    /// Successful reads discarded because the key lost interest mid-tick.
    pub discarded: usize,
    /// Due keys left out because their previous read is still pending.
    pub skipped: usize,
    /// Callbacks actually invoked.
    pub notified: usize,
}

#[derive(Default)]
struct EngineState {
    cache: ValueCache,
    subscriptions: SubscriptionManager,
    scheduler: PollScheduler,
    notifier: ChangeNotifier,
    /// Consecutive failed reads per subscribed key.
    failures: HashMap<Key, u32>,
    /// Keys with a read outstanding.
    in_flight: HashSet<Key>,
    stats: EngineStats,
}

/// Keys taken for one tick.
pub(crate) struct Claim {
    slots: Vec<InFlight>,
    skipped: usize,
}

impl Claim {
    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Marks a key as being read; the mark is cleared on drop.
struct InFlight {
    inner: Arc<Inner>,
    key: Key,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner.state.lock().in_flight.remove(&self.key);
    }
}

enum PollOutcome {
    Updated { notified: usize },
    Discarded,
    Failed,
}

impl EngineState {
    /// Keep cache and scheduler in step with a change in interest.
    fn follow(&mut self, change: &InterestChange, now: Instant) -> bool {
        match change {
            InterestChange::Added { key, .. } => {
                self.cache.insert(key.clone());
                self.failures.insert(key.clone(), 0);
            }
            InterestChange::Removed { key } => {
                self.cache.remove(key);
                self.failures.remove(key);
                debug!("[Cache] Dropped {} (no subscribers left)", key);
            }
            InterestChange::Retimed { key, from, to } => {
                debug!("[Poll] Moving {} from {:?} to {:?} bucket", key, from, to);
            }
            InterestChange::Unchanged { .. } => {}
        }
        self.scheduler.apply(change, now)
    }

    /// Mark `keys` in flight, leaving out those already being read.
    fn claim(&mut self, inner: &Arc<Inner>, keys: Vec<Key>) -> Claim {
        let mut slots = Vec::with_capacity(keys.len());
        let mut skipped = 0;
        for key in keys {
            if self.in_flight.insert(key.clone()) {
                slots.push(InFlight {
                    inner: Arc::clone(inner),
                    key,
                });
            } else {
                debug!("[Poll] Skipping {}, previous read still pending", key);
                skipped += 1;
            }
        }
        if !slots.is_empty() {
            self.stats.ticks += 1;
            self.stats.reads += slots.len() as u64;
        }
        Claim { slots, skipped }
    }

    fn record_failure(&mut self, key: &Key, error: &SyncError, log_every: u32) {
        self.stats.failed_reads += 1;
        let Some(count) = self.failures.get_mut(key) else {
            return;
        };
        *count += 1;
        if *count == 1 || *count % log_every.max(1) == 0 {
            warn!(
                "[Poll] {} (failure #{}, keeping last value)",
                error, *count
            );
        }
    }

    fn record_success(&mut self, key: &Key) {
        if let Some(count) = self.failures.get_mut(key)
            && *count > 0
        {
            info!("[Poll] {} recovered after {} failed read(s)", key, *count);
            *count = 0;
        }
    }
}

struct Inner {
    source: Arc<dyn ExternalStateSource>,
    config: PollConfig,
    state: Mutex<EngineState>,
    schedule_changed: Notify,
    next_consumer: AtomicU64,
}

/// Shared handle to the synchronization engine.
#[derive(Clone)]
pub struct SyncContext {
    inner: Arc<Inner>,
}

impl SyncContext {
    pub fn new(source: Arc<dyn ExternalStateSource>, config: PollConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                state: Mutex::new(EngineState::default()),
                schedule_changed: Notify::new(),
                next_consumer: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.inner.config
    }

    /// Allocate an id for a new consumer.
    pub fn next_consumer_id(&self) -> ConsumerId {
        ConsumerId(self.inner.next_consumer.fetch_add(1, Ordering::Relaxed))
    }

    /// Canonicalize `(name, unit)` and subscribe to it.
    ///
    /// Malformed names and units fail here, synchronously.
    pub fn subscribe(
        &self,
        name: &str,
        unit: &str,
        interval: Duration,
        consumer: ConsumerId,
        policy: RefreshPolicy,
        callback: NotifyFn,
    ) -> Result<SubscriptionHandle> {
        let key = registry::canonicalize(name, unit)?;
        Ok(self.subscribe_key(key, interval, consumer, policy, callback))
    }

    /// Subscribe to an already canonical key.
    pub fn subscribe_key(
        &self,
        key: Key,
        interval: Duration,
        consumer: ConsumerId,
        policy: RefreshPolicy,
        callback: NotifyFn,
    ) -> SubscriptionHandle {
        let interval = self.inner.config.clamp_interval(interval);
        let now = Instant::now();

        let (handle, wake) = {
            let mut state = self.inner.state.lock();
            let (handle, change) = state.subscriptions.subscribe(key.clone(), interval, consumer);
            let wake = state.follow(&change, now);
            let current = state
                .cache
                .get(&key)
                .and_then(|entry| entry.value.map(|v| (v, entry.version)));
            state
                .notifier
                .register(handle.id(), consumer, key, policy, callback, current);
            (handle, wake)
        };

        if wake {
            self.inner.schedule_changed.notify_one();
        }
        handle
    }

    /// Drop a subscription. Unknown or already removed handles are ignored.
    ///
    /// Once this returns, the subscription's callback is never invoked again.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let gate = {
            let mut state = self.inner.state.lock();
            let gate = state.notifier.deregister(handle.id());
            match state.subscriptions.unsubscribe(handle) {
                Some(change) => {
                    state.follow(&change, Instant::now());
                }
                None => {
                    debug!(
                        "[Subs] Ignoring unsubscribe: {}",
                        SyncError::UnknownKeyOnUnsubscribe(handle.id().0)
                    );
                }
            }
            gate
        };
        // Waits out a delivery running on another thread.
        if let Some(gate) = gate {
            gate.close();
        }
    }

    /// Latest cached value of `key`.
    pub fn value(&self, key: &Key) -> Option<Value> {
        self.inner.state.lock().cache.value(key)
    }

    pub fn entry(&self, key: &Key) -> Option<CacheEntry> {
        self.inner.state.lock().cache.get(key).cloned()
    }

    pub fn is_cached(&self, key: &Key) -> bool {
        self.inner.state.lock().cache.contains(key)
    }

    pub fn effective_interval(&self, key: &Key) -> Option<Duration> {
        self.inner.state.lock().subscriptions.effective_interval(key)
    }

    /// Interval of the bucket currently polling `key`.
    pub fn bucket_of(&self, key: &Key) -> Option<Duration> {
        self.inner.state.lock().scheduler.bucket_of(key)
    }

    pub fn bucket_count(&self) -> usize {
        self.inner.state.lock().scheduler.bucket_count()
    }

    pub fn subscriber_count(&self, key: &Key) -> usize {
        self.inner.state.lock().subscriptions.subscriber_count(key)
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.state.lock().stats.clone()
    }

    /// Earliest bucket deadline, if anything is subscribed.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.state.lock().scheduler.next_deadline()
    }

    pub(crate) fn schedule_changed(&self) -> &Notify {
        &self.inner.schedule_changed
    }

    /// Run one tick: poll every bucket due at `now` and wait for the reads.
    pub async fn poll_due(&self, now: Instant) -> TickReport {
        let claimed = self.claim_due(now);
        self.poll_claimed(claimed).await
    }

    /// Poll every subscribed key once, ignoring bucket deadlines.
    pub async fn poll_now(&self) -> TickReport {
        let claimed = {
            let mut state = self.inner.state.lock();
            let keys = state.scheduler.all_keys();
            state.claim(&self.inner, keys)
        };
        self.poll_claimed(claimed).await
    }

    /// Take the keys due at `now`, skipping any whose previous read is still
    /// pending. The returned claim holds them in flight until it is polled or
    /// dropped.
    pub(crate) fn claim_due(&self, now: Instant) -> Claim {
        let mut state = self.inner.state.lock();
        let keys = state.scheduler.take_due(now);
        state.claim(&self.inner, keys)
    }

    /// Read every claimed key concurrently. Each result is applied and its
    /// notifications delivered as soon as that read finishes.
    pub(crate) async fn poll_claimed(&self, claim: Claim) -> TickReport {
        let mut report = TickReport {
            polled: claim.slots.len(),
            skipped: claim.skipped,
            ..TickReport::default()
        };
        let outcomes = join_all(claim.slots.into_iter().map(|slot| self.poll_one(slot))).await;
        for outcome in outcomes {
            match outcome {
                PollOutcome::Updated { notified } => {
                    report.updated += 1;
                    report.notified += notified;
                }
                PollOutcome::Discarded => report.discarded += 1,
                PollOutcome::Failed => report.failed += 1,
            }
        }
        report
    }

    async fn poll_one(&self, slot: InFlight) -> PollOutcome {
        let key = &slot.key;
        let timeout = self.inner.config.read_timeout();
        let result = match tokio::time::timeout(timeout, self.inner.source.read(key)).await {
            Ok(Ok(value)) => Ok(key.unit().coerce(value)),
            Ok(Err(source)) => Err(SyncError::ReadFailed {
                key: key.clone(),
                source,
            }),
            Err(_) => Err(SyncError::ReadTimedOut {
                key: key.clone(),
                timeout_ms: self.inner.config.read_timeout_ms,
            }),
        };

        let dispatches = {
            let mut state = self.inner.state.lock();
            match result {
                Ok(value) => match state.cache.update(key, value) {
                    Some(version) => {
                        state.record_success(key);
                        state.notifier.on_update(key, value, version)
                    }
                    None => return PollOutcome::Discarded,
                },
                Err(e) => {
                    state.record_failure(key, &e, self.inner.config.failure_log_every);
                    return PollOutcome::Failed;
                }
            }
        };

        // The key stays in flight until delivery finishes, so notifications
        // for one key never overtake each other.
        let notified = dispatches
            .into_iter()
            .map(Dispatch::deliver)
            .filter(|ran| *ran)
            .count();
        if notified > 0 {
            self.inner.state.lock().stats.notifications += notified as u64;
        }
        drop(slot);
        PollOutcome::Updated { notified }
    }

    /// Forward a write to the host. The cache is left alone; the next poll
    /// picks up whatever the host made of it.
    pub async fn write(&self, name: &str, unit: &str, value: impl Into<Value>) -> Result<()> {
        let key = registry::canonicalize(name, unit)?;
        let value = key.unit().coerce(value.into());
        debug!("[Poll] Writing {} = {}", key, value);
        self.inner
            .source
            .write(&key, value)
            .await
            .map_err(|source| SyncError::WriteFailed { key, source })
    }

    /// Point-in-time view of the engine for diagnostics.
    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.inner.state.lock();

        let buckets = state
            .scheduler
            .buckets()
            .map(|(interval, keys)| BucketSnapshot {
                interval_ms: interval.as_millis() as u64,
                keys,
            })
            .collect();

        let mut keys: Vec<KeySnapshot> = state
            .cache
            .entries()
            .map(|entry| KeySnapshot {
                key: entry.key.clone(),
                value: entry.value,
                version: entry.version,
                last_polled_at: entry.last_polled_at,
                subscribers: state.subscriptions.subscriber_count(&entry.key),
                interval_ms: state
                    .subscriptions
                    .effective_interval(&entry.key)
                    .map(|i| i.as_millis() as u64),
                consecutive_failures: state.failures.get(&entry.key).copied().unwrap_or(0),
            })
            .collect();
        keys.sort_by(|a, b| a.key.cmp(&b.key));

        EngineSnapshot {
            taken_at: Utc::now(),
            buckets,
            keys,
            stats: state.stats.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub interval_ms: u64,
    pub keys: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    pub key: Key,
    pub value: Option<Value>,
    pub version: u64,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub subscribers: usize,
    pub interval_ms: Option<u64>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub taken_at: DateTime<Utc>,
    pub buckets: Vec<BucketSnapshot>,
    pub keys: Vec<KeySnapshot>,
    pub stats: EngineStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::Notification;
    use crate::source::{MemorySource, ReadError};

    const BAT_1: &str = "L:A32NX_ELEC_BAT_1_POTENTIAL";

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn bat_key() -> Key {
        registry::canonicalize(BAT_1, "Volts").unwrap()
    }

    fn engine() -> (SyncContext, Arc<MemorySource>) {
        let source = Arc::new(MemorySource::new());
        let ctx = SyncContext::new(source.clone(), PollConfig::default());
        (ctx, source)
    }

    /// Callback that records the notification and the accessor-visible value
    /// at delivery time.
    fn recorder(ctx: &SyncContext) -> (NotifyFn, Arc<Mutex<Vec<(Notification, Option<Value>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let ctx = ctx.clone();
        let callback: NotifyFn = Arc::new(move |n: &Notification| {
            let current = ctx.value(&n.key);
            sink.lock().push((n.clone(), current));
        });
        (callback, seen)
    }

    #[tokio::test]
    async fn test_battery_scenario_two_notifications() {
        let (ctx, source) = engine();
        source.script_values(&bat_key(), [24.1, 24.1, 23.9]);
        let (callback, seen) = recorder(&ctx);
        let consumer = ctx.next_consumer_id();
        ctx.subscribe(BAT_1, "Volts", ms(200), consumer, RefreshPolicy::OnChange, callback)
            .unwrap();

        let t0 = Instant::now();
        for tick in 0..3 {
            let report = ctx.poll_due(t0 + ms(200 * tick)).await;
            assert_eq!(report.polled, 1, "tick {tick}");
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0.version, 1);
        assert_eq!(seen[0].1, Some(Value::Number(24.1)));
        assert_eq!(seen[1].0.version, 3);
        assert_eq!(seen[1].1, Some(Value::Number(23.9)));
        assert_eq!(ctx.entry(&bat_key()).unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_shared_key_polled_at_minimum_interval() {
        let (ctx, source) = engine();
        source.script_values(&bat_key(), [24.1, 24.0, 23.9]);
        let (fast_cb, fast_seen) = recorder(&ctx);
        let (slow_cb, slow_seen) = recorder(&ctx);
        let a = ctx.next_consumer_id();
        let b = ctx.next_consumer_id();
        ctx.subscribe(BAT_1, "Volts", ms(200), a, RefreshPolicy::OnChange, fast_cb)
            .unwrap();
        ctx.subscribe(BAT_1, "volt", ms(500), b, RefreshPolicy::OnChange, slow_cb)
            .unwrap();

        assert_eq!(ctx.effective_interval(&bat_key()), Some(ms(200)));
        assert_eq!(ctx.bucket_of(&bat_key()), Some(ms(200)));
        assert_eq!(ctx.bucket_count(), 1);

        let t0 = Instant::now();
        ctx.poll_due(t0).await;
        ctx.poll_due(t0 + ms(200)).await;
        ctx.poll_due(t0 + ms(400)).await;

        assert_eq!(source.read_count(&bat_key()), 3);
        assert_eq!(fast_seen.lock().len(), 3);
        assert_eq!(slow_seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_polling_and_drops_entry() {
        let (ctx, source) = engine();
        source.set(&bat_key(), 24.1);
        let (callback, seen) = recorder(&ctx);
        let consumer = ctx.next_consumer_id();
        let handle = ctx
            .subscribe(BAT_1, "Volts", ms(200), consumer, RefreshPolicy::OnChange, callback)
            .unwrap();

        let t0 = Instant::now();
        ctx.poll_due(t0).await;
        assert_eq!(source.read_count(&bat_key()), 1);

        ctx.unsubscribe(&handle);
        assert!(!ctx.is_cached(&bat_key()));

        let report = ctx.poll_due(t0 + ms(200)).await;
        assert_eq!(report.polled, 0);
        assert_eq!(source.read_count(&bat_key()), 1);
        assert_eq!(ctx.bucket_count(), 0);
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_double_unsubscribe_same_state() {
        let (ctx, _source) = engine();
        let consumer = ctx.next_consumer_id();
        let (cb, _) = recorder(&ctx);
        let keep = ctx
            .subscribe(BAT_1, "Volts", ms(500), consumer, RefreshPolicy::OnChange, cb.clone())
            .unwrap();
        let drop_me = ctx
            .subscribe(BAT_1, "Volts", ms(200), consumer, RefreshPolicy::OnChange, cb)
            .unwrap();

        ctx.unsubscribe(&drop_me);
        let after_once = (ctx.subscriber_count(&bat_key()), ctx.effective_interval(&bat_key()));
        ctx.unsubscribe(&drop_me);
        let after_twice = (ctx.subscriber_count(&bat_key()), ctx.effective_interval(&bat_key()));
        assert_eq!(after_once, after_twice);
        assert_eq!(after_once, (1, Some(ms(500))));

        ctx.unsubscribe(&keep);
        ctx.unsubscribe(&keep);
        assert!(!ctx.is_cached(&bat_key()));
    }

    #[tokio::test]
    async fn test_failed_read_keeps_last_value() {
        let (ctx, source) = engine();
        source.script(
            &bat_key(),
            [
                Ok(Value::Number(24.1)),
                Err(ReadError::Busy("sim paused".into())),
                Ok(Value::Number(23.9)),
            ],
        );
        let (callback, seen) = recorder(&ctx);
        let consumer = ctx.next_consumer_id();
        ctx.subscribe(BAT_1, "Volts", ms(200), consumer, RefreshPolicy::every_poll(), callback)
            .unwrap();

        let t0 = Instant::now();
        ctx.poll_due(t0).await;
        let report = ctx.poll_due(t0 + ms(200)).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.notified, 0);

        let entry = ctx.entry(&bat_key()).unwrap();
        assert_eq!(entry.value, Some(Value::Number(24.1)));
        assert_eq!(entry.version, 1);
        assert_eq!(ctx.snapshot().keys[0].consecutive_failures, 1);

        ctx.poll_due(t0 + ms(400)).await;
        assert_eq!(ctx.entry(&bat_key()).unwrap().version, 2);
        assert_eq!(ctx.snapshot().keys[0].consecutive_failures, 0);
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(ctx.stats().failed_reads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_read_times_out_without_stalling_others() {
        let source = Arc::new(MemorySource::new());
        let config = PollConfig {
            read_timeout_ms: 50,
            ..PollConfig::default()
        };
        let ctx = SyncContext::new(source.clone(), config);

        let slow = registry::canonicalize("L:SLOW", "Number").unwrap();
        source.set(&slow, 1.0);
        source.set_latency(&slow, ms(500));
        source.set(&bat_key(), 24.1);

        let consumer = ctx.next_consumer_id();
        let (cb, _) = recorder(&ctx);
        ctx.subscribe_key(slow.clone(), ms(200), consumer, RefreshPolicy::OnChange, cb.clone());
        ctx.subscribe_key(bat_key(), ms(200), consumer, RefreshPolicy::OnChange, cb);

        let report = ctx.poll_due(Instant::now()).await;
        assert_eq!(report.polled, 2);
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(ctx.value(&bat_key()), Some(Value::Number(24.1)));
        assert_eq!(ctx.value(&slow), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_read_is_not_issued_twice() {
        let (ctx, source) = engine();
        let slow = registry::canonicalize("L:SLOW", "Number").unwrap();
        source.set(&slow, 1.0);
        source.set_latency(&slow, ms(500));
        source.set(&bat_key(), 24.1);

        let consumer = ctx.next_consumer_id();
        let (cb, _) = recorder(&ctx);
        ctx.subscribe_key(slow.clone(), ms(200), consumer, RefreshPolicy::OnChange, cb.clone());
        ctx.subscribe_key(bat_key(), ms(200), consumer, RefreshPolicy::OnChange, cb);

        let first_ctx = ctx.clone();
        let first = tokio::spawn(async move { first_ctx.poll_now().await });
        tokio::time::sleep(ms(10)).await;

        // The slow read is still outstanding; only the other key is read.
        let second = ctx.poll_now().await;
        assert_eq!(second.polled, 1);
        assert_eq!(second.skipped, 1);
        assert_eq!(source.read_count(&slow), 1);
        assert_eq!(source.read_count(&bat_key()), 2);

        let first = first.await.unwrap();
        assert_eq!(first.updated, 2);
        assert_eq!(ctx.value(&slow), Some(Value::Number(1.0)));

        // Once it lands the key is eligible again.
        let third = ctx.poll_now().await;
        assert_eq!(third.skipped, 0);
        assert_eq!(source.read_count(&slow), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unsubscribe_waits_for_running_callback() {
        let (ctx, source) = engine();
        source.set(&bat_key(), 24.1);

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let started_tx = Mutex::new(started_tx);
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let done = Arc::clone(&finished);
        let callback: NotifyFn = Arc::new(move |_n: &Notification| {
            let _ = started_tx.lock().send(());
            std::thread::sleep(std::time::Duration::from_millis(50));
            done.store(true, Ordering::SeqCst);
        });
        let consumer = ctx.next_consumer_id();
        let handle = ctx
            .subscribe(BAT_1, "Volts", ms(200), consumer, RefreshPolicy::OnChange, callback)
            .unwrap();

        let tick_ctx = ctx.clone();
        let tick = tokio::spawn(async move { tick_ctx.poll_now().await });
        tokio::task::spawn_blocking(move || started_rx.recv())
            .await
            .unwrap()
            .unwrap();

        ctx.unsubscribe(&handle);
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(tick.await.unwrap().notified, 1);
    }

    #[tokio::test]
    async fn test_no_notification_after_unsubscribe_mid_dispatch() {
        let (ctx, source) = engine();
        source.set(&bat_key(), 24.1);

        // First consumer unsubscribes the second from inside its callback.
        let victim: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
        let killer_ctx = ctx.clone();
        let victim_slot = Arc::clone(&victim);
        let killer: NotifyFn = Arc::new(move |_n: &Notification| {
            if let Some(handle) = victim_slot.lock().take() {
                killer_ctx.unsubscribe(&handle);
            }
        });
        let (victim_cb, victim_seen) = recorder(&ctx);

        let a = ctx.next_consumer_id();
        let b = ctx.next_consumer_id();
        ctx.subscribe(BAT_1, "Volts", ms(200), a, RefreshPolicy::OnChange, killer)
            .unwrap();
        let handle = ctx
            .subscribe(BAT_1, "Volts", ms(200), b, RefreshPolicy::OnChange, victim_cb)
            .unwrap();
        *victim.lock() = Some(handle);

        let report = ctx.poll_due(Instant::now()).await;
        assert_eq!(report.notified, 1);
        assert!(victim_seen.lock().is_empty());
        assert_eq!(ctx.subscriber_count(&bat_key()), 1);
    }

    #[tokio::test]
    async fn test_invalid_unit_fails_fast() {
        let (ctx, _source) = engine();
        let consumer = ctx.next_consumer_id();
        let (cb, _) = recorder(&ctx);
        let err = ctx
            .subscribe(BAT_1, "parsecs", ms(200), consumer, RefreshPolicy::OnChange, cb)
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidUnit(_)));
        assert_eq!(ctx.bucket_count(), 0);
        assert!(ctx.snapshot().keys.is_empty());
    }

    #[tokio::test]
    async fn test_bool_unit_coerces_numeric_reads() {
        let (ctx, source) = engine();
        let key = registry::canonicalize("L:A32NX_ELEC_BAT_1_POTENTIAL_NORMAL", "Bool").unwrap();
        source.set(&key, 1.0);
        let consumer = ctx.next_consumer_id();
        let (cb, _) = recorder(&ctx);
        ctx.subscribe_key(key.clone(), ms(200), consumer, RefreshPolicy::OnChange, cb);

        ctx.poll_now().await;
        assert_eq!(ctx.value(&key), Some(Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_versions_strictly_increase() {
        let (ctx, source) = engine();
        source.set(&bat_key(), 24.1);
        let consumer = ctx.next_consumer_id();
        let (cb, _) = recorder(&ctx);
        ctx.subscribe_key(bat_key(), ms(100), consumer, RefreshPolicy::OnChange, cb);

        let mut last = 0;
        for _ in 0..5 {
            ctx.poll_now().await;
            let version = ctx.entry(&bat_key()).unwrap().version;
            assert!(version > last);
            last = version;
        }
    }

    #[tokio::test]
    async fn test_write_goes_to_host_not_cache() {
        let (ctx, source) = engine();
        let key = registry::canonicalize("L:A32NX_RMP_L_TRANSFER", "Bool").unwrap();
        let consumer = ctx.next_consumer_id();
        let (cb, _) = recorder(&ctx);
        ctx.subscribe_key(key.clone(), ms(200), consumer, RefreshPolicy::OnChange, cb);

        ctx.write("l:A32NX_RMP_L_TRANSFER", "boolean", 1.0).await.unwrap();
        assert_eq!(source.writes(), vec![(key.clone(), Value::Bool(true))]);
        assert_eq!(ctx.value(&key), None);

        ctx.poll_now().await;
        assert_eq!(ctx.value(&key), Some(Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_late_subscriber_not_notified_for_known_value() {
        let (ctx, source) = engine();
        source.set(&bat_key(), 24.1);
        let (early_cb, _) = recorder(&ctx);
        let (late_cb, late_seen) = recorder(&ctx);
        let a = ctx.next_consumer_id();
        let b = ctx.next_consumer_id();
        ctx.subscribe_key(bat_key(), ms(200), a, RefreshPolicy::OnChange, early_cb);
        ctx.poll_now().await;

        ctx.subscribe_key(bat_key(), ms(200), b, RefreshPolicy::OnChange, late_cb);
        ctx.poll_now().await;
        assert!(late_seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_serializes() {
        let (ctx, source) = engine();
        source.set(&bat_key(), 24.1);
        let consumer = ctx.next_consumer_id();
        let (cb, _) = recorder(&ctx);
        ctx.subscribe_key(bat_key(), ms(200), consumer, RefreshPolicy::OnChange, cb);
        ctx.poll_now().await;

        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.buckets.len(), 1);
        assert_eq!(snapshot.buckets[0].interval_ms, 200);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["keys"][0]["key"]["name"], BAT_1);
        assert_eq!(json["keys"][0]["key"]["unit"], "Volts");
        assert_eq!(json["keys"][0]["value"], 24.1);
        assert_eq!(json["stats"]["ticks"], 1);
    }
}
