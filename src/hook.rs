//! Consumer-facing data binding.
//!
//! A presentation unit (one instrument panel) owns a [`HookScope`]. Each
//! render pass calls [`HookScope::bind`] for the variables it displays and
//! reads them through the returned [`SimVarAccessor`]. The first `bind` for a
//! given variable and interval subscribes; later render passes get the same
//! subscription back. When the scope is torn down or dropped, every
//! subscription it made is released.
//!
//! Accessors never hold a copy of the value: `get()` reads the cache at call
//! time, so a render triggered by a notification always sees the newest value.
//!
//! # Example
//! ```ignore
//! let scope = HookScope::new(ctx.clone(), "battery-panel", Arc::new(|| redraw()));
//! let bat_1 = scope.bind("L:A32NX_ELEC_BAT_1_POTENTIAL", "Volts", 200)?;
//! let volts = bat_1.get_f64();
//! ```

use crate::context::SyncContext;
use crate::error::Result;
use crate::notifier::{Notification, NotifyFn, RefreshPolicy};
use crate::registry::{self, Key};
use crate::source::Value;
use crate::subscription::{ConsumerId, SubscriptionHandle};
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Asks the owning presentation unit to re-render.
pub type RenderFn = Arc<dyn Fn() + Send + Sync>;

/// Releases its subscription exactly once, explicitly or on drop.
struct BindingGuard {
    ctx: SyncContext,
    handle: SubscriptionHandle,
    released: AtomicBool,
}

impl BindingGuard {
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.ctx.unsubscribe(&self.handle);
        }
    }
}

impl Drop for BindingGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Read handle for one bound variable.
///
/// Clones share the subscription; it is released when the owning scope is
/// torn down or the last clone is dropped, whichever comes first.
#[derive(Clone)]
pub struct SimVarAccessor {
    key: Key,
    guard: Arc<BindingGuard>,
}

impl SimVarAccessor {
    /// Latest cached value, or `None` before the first successful poll.
    pub fn get(&self) -> Option<Value> {
        self.guard.ctx.value(&self.key)
    }

    pub fn get_f64(&self) -> Option<f64> {
        self.get().map(|v| v.as_f64())
    }

    pub fn get_bool(&self) -> Option<bool> {
        self.get().map(|v| v.as_bool())
    }

    /// Cache version of the value `get()` would return.
    pub fn version(&self) -> u64 {
        self.guard
            .ctx
            .entry(&self.key)
            .map_or(0, |entry| entry.version)
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Whether the underlying subscription is still live.
    pub fn is_bound(&self) -> bool {
        !self.guard.released.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SimVarAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimVarAccessor")
            .field("key", &self.key)
            .field("value", &self.get())
            .finish()
    }
}

type BindingSlot = (Key, Duration, RefreshPolicy);

/// Binding owner for one presentation unit.
pub struct HookScope {
    ctx: SyncContext,
    consumer: ConsumerId,
    label: String,
    request_render: RenderFn,
    bindings: Mutex<HashMap<BindingSlot, SimVarAccessor>>,
    torn_down: AtomicBool,
}

impl HookScope {
    pub fn new(ctx: SyncContext, label: impl Into<String>, request_render: RenderFn) -> Self {
        let consumer = ctx.next_consumer_id();
        let label = label.into();
        debug!("[Hook] Mounted {} as {}", label, consumer);
        Self {
            ctx,
            consumer,
            label,
            request_render,
            bindings: Mutex::new(HashMap::new()),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Bind `(name, unit)` polled every `interval_ms`, re-rendering on change.
    pub fn bind(&self, name: &str, unit: &str, interval_ms: u64) -> Result<SimVarAccessor> {
        self.bind_with(name, unit, interval_ms, RefreshPolicy::OnChange)
    }

    /// Bind with an explicit refresh policy, e.g. forced ticking for
    /// high-rate displays.
    pub fn bind_with(
        &self,
        name: &str,
        unit: &str,
        interval_ms: u64,
        policy: RefreshPolicy,
    ) -> Result<SimVarAccessor> {
        let key = registry::canonicalize(name, unit)?;
        let interval = Duration::from_millis(interval_ms);
        let slot = (key.clone(), interval, policy);

        let mut bindings = self.bindings.lock();
        if let Some(existing) = bindings.get(&slot) {
            return Ok(existing.clone());
        }
        if self.torn_down.load(Ordering::SeqCst) {
            debug!("[Hook] {} bound {} after teardown", self.label, key);
        }

        let render = Arc::clone(&self.request_render);
        let label = self.label.clone();
        let callback: NotifyFn = Arc::new(move |n: &Notification| {
            trace!("[Hook] {} re-render for {} = {}", label, n.key, n.value);
            render();
        });
        let handle = self
            .ctx
            .subscribe_key(key.clone(), interval, self.consumer, policy, callback);

        let accessor = SimVarAccessor {
            key,
            guard: Arc::new(BindingGuard {
                ctx: self.ctx.clone(),
                handle,
                released: AtomicBool::new(false),
            }),
        };
        bindings.insert(slot, accessor.clone());
        Ok(accessor)
    }

    /// Number of distinct subscriptions this scope holds.
    pub fn binding_count(&self) -> usize {
        self.bindings.lock().len()
    }

    /// Release every subscription. Safe to call more than once.
    pub fn teardown(&self) {
        let drained: Vec<SimVarAccessor> = self.bindings.lock().drain().map(|(_, a)| a).collect();
        if !self.torn_down.swap(true, Ordering::SeqCst) || !drained.is_empty() {
            debug!(
                "[Hook] Unmounted {} ({} binding(s))",
                self.label,
                drained.len()
            );
        }
        for accessor in drained {
            accessor.guard.release();
        }
    }
}

impl Drop for HookScope {
    fn drop(&mut self) {
        self.teardown();
    }
}
