//! In-memory host used by tests and dry runs.
//!
//! Values can be set directly or scripted per key as a sequence of read
//! results. Every read is counted so callers can check exactly which keys a
//! tick touched.

use super::{ExternalStateSource, ReadError, Value};
use crate::registry::Key;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

#[derive(Default)]
pub struct MemorySource {
    values: RwLock<HashMap<Key, Value>>,
    scripts: Mutex<HashMap<Key, VecDeque<Result<Value, ReadError>>>>,
    failing: RwLock<HashSet<Key>>,
    latency: RwLock<HashMap<Key, Duration>>,
    reads: Mutex<HashMap<Key, usize>>,
    writes: Mutex<Vec<(Key, Value)>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the value returned once any script for `key` is exhausted.
    pub fn set(&self, key: &Key, value: impl Into<Value>) {
        self.values.write().insert(key.clone(), value.into());
    }

    /// Queue read results for `key`. Each read pops one; a successful
    /// scripted value also becomes the steady value afterwards.
    pub fn script<I>(&self, key: &Key, results: I)
    where
        I: IntoIterator<Item = Result<Value, ReadError>>,
    {
        self.scripts
            .lock()
            .entry(key.clone())
            .or_default()
            .extend(results);
    }

    /// Queue plain values for `key`.
    pub fn script_values<I, V>(&self, key: &Key, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.script(key, values.into_iter().map(|v| Ok(v.into())));
    }

    /// Make every read of `key` fail until [`MemorySource::recover`] is called.
    pub fn fail(&self, key: &Key) {
        self.failing.write().insert(key.clone());
    }

    pub fn recover(&self, key: &Key) {
        self.failing.write().remove(key);
    }

    /// Delay every read of `key` by `delay`.
    pub fn set_latency(&self, key: &Key, delay: Duration) {
        self.latency.write().insert(key.clone(), delay);
    }

    /// Number of reads issued for `key`, including failed ones.
    pub fn read_count(&self, key: &Key) -> usize {
        self.reads.lock().get(key).copied().unwrap_or(0)
    }

    pub fn total_reads(&self) -> usize {
        self.reads.lock().values().sum()
    }

    /// All writes received, in order.
    pub fn writes(&self) -> Vec<(Key, Value)> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl ExternalStateSource for MemorySource {
    async fn read(&self, key: &Key) -> Result<Value, ReadError> {
        *self.reads.lock().entry(key.clone()).or_insert(0) += 1;

        let delay = self.latency.read().get(key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.read().contains(key) {
            return Err(ReadError::Busy(key.to_string()));
        }

        let scripted = self
            .scripts
            .lock()
            .get_mut(key)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(Ok(value)) => {
                self.values.write().insert(key.clone(), value);
                Ok(value)
            }
            Some(Err(e)) => Err(e),
            None => self
                .values
                .read()
                .get(key)
                .copied()
                .ok_or_else(|| ReadError::Unavailable(key.to_string())),
        }
    }

    async fn write(&self, key: &Key, value: Value) -> Result<(), ReadError> {
        self.writes.lock().push((key.clone(), value));
        self.values.write().insert(key.clone(), value);
        Ok(())
    }
}
