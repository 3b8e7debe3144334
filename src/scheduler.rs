//! Interval buckets driving periodic reads.
//!
//! One bucket exists per distinct effective interval. Every polled key lives
//! in exactly one bucket, the one matching its effective interval, so a key is
//! never read twice in a tick and is never left without a bucket while it has
//! subscribers. Buckets are logical timers: the poll loop asks for the next
//! deadline and for the keys that are due at a given instant.

use crate::registry::Key;
use crate::subscription::InterestChange;
use log::debug;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

struct Bucket {
    keys: BTreeSet<Key>,
    next_due: Instant,
}

#[derive(Default)]
pub struct PollScheduler {
    buckets: BTreeMap<Duration, Bucket>,
    assignments: HashMap<Key, Duration>,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow an interest change reported by the subscription manager.
    ///
    /// Returns `true` when a new bucket was created; new buckets are due
    /// immediately, so the poll loop should wake up.
    pub fn apply(&mut self, change: &InterestChange, now: Instant) -> bool {
        match change {
            InterestChange::Added { key, interval } => self.assign(key, *interval, now),
            InterestChange::Retimed { key, to, .. } => self.assign(key, *to, now),
            InterestChange::Unchanged { .. } => false,
            InterestChange::Removed { key } => {
                self.remove(key);
                false
            }
        }
    }

    /// Place `key` in the bucket for `interval`, moving it out of its previous
    /// bucket if needed.
    pub fn assign(&mut self, key: &Key, interval: Duration, now: Instant) -> bool {
        match self.assignments.get(key) {
            Some(current) if *current == interval => return false,
            Some(_) => self.remove(key),
            None => {}
        }

        let created = !self.buckets.contains_key(&interval);
        let bucket = self.buckets.entry(interval).or_insert_with(|| {
            debug!("[Poll] Starting {:?} bucket", interval);
            Bucket {
                keys: BTreeSet::new(),
                next_due: now,
            }
        });
        bucket.keys.insert(key.clone());
        self.assignments.insert(key.clone(), interval);
        created
    }

    /// Stop polling `key`. Empty buckets are dropped.
    pub fn remove(&mut self, key: &Key) {
        let Some(interval) = self.assignments.remove(key) else {
            return;
        };
        if let Some(bucket) = self.buckets.get_mut(&interval) {
            bucket.keys.remove(key);
            if bucket.keys.is_empty() {
                self.buckets.remove(&interval);
                debug!("[Poll] Stopping {:?} bucket", interval);
            }
        }
    }

    /// Collect the keys of every bucket due at `now` and reschedule those
    /// buckets. Missed ticks are skipped rather than replayed.
    pub fn take_due(&mut self, now: Instant) -> Vec<Key> {
        let mut due = BTreeSet::new();
        for (interval, bucket) in self.buckets.iter_mut() {
            if bucket.next_due > now {
                continue;
            }
            due.extend(bucket.keys.iter().cloned());
            bucket.next_due += *interval;
            if bucket.next_due <= now {
                bucket.next_due = now + *interval;
            }
        }
        due.into_iter().collect()
    }

    /// Every scheduled key, regardless of deadlines.
    pub fn all_keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.assignments.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Earliest deadline across all buckets.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buckets.values().map(|b| b.next_due).min()
    }

    /// Interval of the bucket currently holding `key`.
    pub fn bucket_of(&self, key: &Key) -> Option<Duration> {
        self.assignments.get(key).copied()
    }

    /// `(interval, key count)` for each live bucket, fastest first.
    pub fn buckets(&self) -> impl Iterator<Item = (Duration, usize)> + '_ {
        self.buckets.iter().map(|(i, b)| (*i, b.keys.len()))
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_scheduled(&self, key: &Key) -> bool {
        self.assignments.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::canonicalize;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn key(name: &str) -> Key {
        canonicalize(name, "Number").unwrap()
    }

    #[test]
    fn test_new_bucket_due_immediately() {
        let mut scheduler = PollScheduler::new();
        let t0 = Instant::now();
        assert!(scheduler.assign(&key("L:A"), ms(200), t0));
        assert_eq!(scheduler.next_deadline(), Some(t0));
        assert_eq!(scheduler.take_due(t0), vec![key("L:A")]);
        assert_eq!(scheduler.next_deadline(), Some(t0 + ms(200)));
    }

    #[test]
    fn test_joining_existing_bucket_keeps_deadline() {
        let mut scheduler = PollScheduler::new();
        let t0 = Instant::now();
        scheduler.assign(&key("L:A"), ms(200), t0);
        scheduler.take_due(t0);

        assert!(!scheduler.assign(&key("L:B"), ms(200), t0 + ms(50)));
        assert_eq!(scheduler.bucket_count(), 1);
        assert!(scheduler.take_due(t0 + ms(100)).is_empty());
        assert_eq!(
            scheduler.take_due(t0 + ms(200)),
            vec![key("L:A"), key("L:B")]
        );
    }

    #[test]
    fn test_migration_moves_key_without_duplicate() {
        let mut scheduler = PollScheduler::new();
        let t0 = Instant::now();
        scheduler.assign(&key("L:A"), ms(500), t0);
        scheduler.assign(&key("L:B"), ms(200), t0);
        scheduler.take_due(t0);

        scheduler.assign(&key("L:A"), ms(200), t0 + ms(10));
        assert_eq!(scheduler.bucket_of(&key("L:A")), Some(ms(200)));
        // The 500ms bucket emptied and stopped.
        assert_eq!(scheduler.bucket_count(), 1);

        let due = scheduler.take_due(t0 + ms(200));
        assert_eq!(due, vec![key("L:A"), key("L:B")]);
    }

    #[test]
    fn test_key_due_once_when_buckets_coincide() {
        let mut scheduler = PollScheduler::new();
        let t0 = Instant::now();
        scheduler.assign(&key("L:A"), ms(100), t0);
        scheduler.assign(&key("L:B"), ms(200), t0);
        let due = scheduler.take_due(t0);
        assert_eq!(due, vec![key("L:A"), key("L:B")]);
    }

    #[test]
    fn test_removing_last_key_stops_bucket() {
        let mut scheduler = PollScheduler::new();
        let t0 = Instant::now();
        scheduler.assign(&key("L:A"), ms(200), t0);
        scheduler.remove(&key("L:A"));
        assert_eq!(scheduler.bucket_count(), 0);
        assert_eq!(scheduler.next_deadline(), None);
        assert!(scheduler.take_due(t0 + ms(1000)).is_empty());
        // Removing again is a no-op.
        scheduler.remove(&key("L:A"));
    }

    #[test]
    fn test_missed_ticks_are_skipped() {
        let mut scheduler = PollScheduler::new();
        let t0 = Instant::now();
        scheduler.assign(&key("L:A"), ms(100), t0);
        scheduler.take_due(t0);

        // Loop stalled for 1s: one read, next deadline one interval later.
        assert_eq!(scheduler.take_due(t0 + ms(1000)).len(), 1);
        assert_eq!(scheduler.next_deadline(), Some(t0 + ms(1100)));
    }

    #[test]
    fn test_apply_follows_interest_changes() {
        let mut scheduler = PollScheduler::new();
        let t0 = Instant::now();
        let a = key("L:A");

        assert!(scheduler.apply(
            &InterestChange::Added {
                key: a.clone(),
                interval: ms(500)
            },
            t0
        ));
        assert!(scheduler.apply(
            &InterestChange::Retimed {
                key: a.clone(),
                from: ms(500),
                to: ms(200)
            },
            t0
        ));
        assert_eq!(scheduler.bucket_of(&a), Some(ms(200)));
        assert!(!scheduler.apply(&InterestChange::Removed { key: a.clone() }, t0));
        assert!(!scheduler.is_scheduled(&a));
    }
}
