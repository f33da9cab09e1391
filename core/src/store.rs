//! Shared state store.
//!
//! A keyed, kind-checked, expiring value store with per-key observers. Values
//! are stored type-erased and handed back as clones, so a caller can never
//! mutate what another agent reads. Expired entries are evicted lazily on read,
//! by [`SharedStateStore::purge_expired`], or by the optional background sweeper.

mod pattern;

pub use pattern::{LearningPattern, DEFAULT_PATTERN_CONFIDENCE, FEEDBACK_STEP};

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::config::DEFAULT_ENTRY_TTL;

/// Type-erased value held by the store
pub type SharedValue = Arc<dyn Any + Send + Sync>;

/// Callback invoked synchronously after a key is written
pub type Observer = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// A stored value with its kind tag and expiry information
#[derive(Clone)]
struct SharedEntry {
    value: SharedValue,
    kind: &'static str,
    written_at: DateTime<Utc>,
    written: Instant,
    ttl: Duration,
}

impl SharedEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.written) >= self.ttl
    }
}

/// Notification handed to observers after a write
#[derive(Clone)]
pub struct StateChange {
    pub key: String,
    pub kind: &'static str,
    pub written_at: DateTime<Utc>,
    pub ttl: Duration,
    value: SharedValue,
}

impl StateChange {
    /// Borrow the written value if it is of kind `T`
    pub fn value<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for StateChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateChange")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("written_at", &self.written_at)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Result of a kind-checked read that keeps the reason for a miss.
///
/// [`SharedStateStore::get`] collapses every miss into `None`; use
/// [`SharedStateStore::lookup`] when the caller needs to tell them apart.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    Absent,
    Expired,
    KindMismatch {
        expected: &'static str,
        actual: &'static str,
    },
}

impl<T> Lookup<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Lookup::Found(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

struct ObserverSlot {
    id: String,
    callback: Observer,
}

/// Concurrent shared state store
pub struct SharedStateStore {
    entries: DashMap<String, SharedEntry>,
    observers: DashMap<String, Vec<ObserverSlot>>,
    patterns: DashMap<String, LearningPattern>,
    default_ttl: Duration,
    last_update_ms: AtomicI64,
}

impl Default for SharedStateStore {
    fn default() -> Self {
        Self::new(DEFAULT_ENTRY_TTL)
    }
}

impl SharedStateStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            observers: DashMap::new(),
            patterns: DashMap::new(),
            default_ttl,
            last_update_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Write `value` under `key` with the store's default ttl
    pub fn set_default<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.set(key, value, self.default_ttl);
    }

    /// Write `value` under `key`, silently replacing any previous entry, then
    /// notify the key's observers in registration order.
    pub fn set<T>(&self, key: impl Into<String>, value: T, ttl: Duration)
    where
        T: Any + Send + Sync,
    {
        let key = key.into();
        let entry = SharedEntry {
            value: Arc::new(value),
            kind: std::any::type_name::<T>(),
            written_at: Utc::now(),
            written: Instant::now(),
            ttl,
        };
        let change = StateChange {
            key: key.clone(),
            kind: entry.kind,
            written_at: entry.written_at,
            ttl,
            value: Arc::clone(&entry.value),
        };

        trace!(key = %key, kind = entry.kind, ttl_ms = ttl.as_millis() as u64, "shared state write");
        self.entries.insert(key, entry);
        self.touch();
        self.notify(&change);
    }

    /// Kind-checked read. Absent, expired and mismatched entries all read as `None`.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Any + Clone,
    {
        self.lookup(key).into_option()
    }

    /// Kind-checked read that reports why a read missed. An expired entry is
    /// evicted as part of the read.
    pub fn lookup<T>(&self, key: &str) -> Lookup<T>
    where
        T: Any + Clone,
    {
        match self.entries.get(key) {
            None => return Lookup::Absent,
            Some(entry) if !entry.is_expired(Instant::now()) => {
                return match entry.value.downcast_ref::<T>() {
                    Some(v) => Lookup::Found(v.clone()),
                    None => Lookup::KindMismatch {
                        expected: std::any::type_name::<T>(),
                        actual: entry.kind,
                    },
                };
            }
            Some(_) => {}
        }

        // Re-check under the write guard so a concurrent fresh write survives.
        if self
            .entries
            .remove_if(key, |_, e| e.is_expired(Instant::now()))
            .is_some()
        {
            debug!(key = %key, "evicted expired shared entry on read");
        }
        Lookup::Expired
    }

    /// Whether an unexpired entry exists for `key`
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| !e.is_expired(Instant::now()))
            .unwrap_or(false)
    }

    /// Kind tag of the stored entry, if any
    pub fn kind_of(&self, key: &str) -> Option<&'static str> {
        self.entries.get(key).map(|e| e.kind)
    }

    pub fn remove(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.touch();
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of stored keys
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Register `callback` for writes to `key`. Several observers may watch one key;
    /// registering an existing `observer_id` again adds a second slot.
    pub fn observe<F>(&self, key: impl Into<String>, observer_id: impl Into<String>, callback: F)
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let key = key.into();
        let observer_id = observer_id.into();
        debug!(key = %key, observer_id = %observer_id, "observer registered");
        self.observers.entry(key).or_default().push(ObserverSlot {
            id: observer_id,
            callback: Arc::new(callback),
        });
    }

    /// Remove every slot registered by `observer_id` on `key`
    pub fn unobserve(&self, key: &str, observer_id: &str) -> bool {
        let mut removed = false;
        if let Some(mut slots) = self.observers.get_mut(key) {
            let before = slots.len();
            slots.retain(|s| s.id != observer_id);
            removed = slots.len() != before;
        }
        self.observers.remove_if(key, |_, slots| slots.is_empty());
        removed
    }

    pub fn observer_count(&self, key: &str) -> usize {
        self.observers.get(key).map(|s| s.len()).unwrap_or(0)
    }

    /// Evict every expired entry; returns the number removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "purged expired shared entries");
            self.touch();
        }
        removed
    }

    /// Periodically purge expired entries. The task ends once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        info!(interval_ms = interval.as_millis() as u64, "starting shared state sweeper");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(store) => {
                        store.purge_expired();
                    }
                    None => break,
                }
            }
            debug!("shared state sweeper stopped");
        })
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_update_ms.load(Ordering::Relaxed))
            .unwrap_or_else(Utc::now)
    }

    pub(crate) fn touch(&self) {
        self.last_update_ms
            .fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn notify(&self, change: &StateChange) {
        // Clone callbacks out so no map guard is held while user code runs.
        let callbacks: Vec<(String, Observer)> = match self.observers.get(&change.key) {
            Some(slots) => slots
                .iter()
                .map(|s| (s.id.clone(), Arc::clone(&s.callback)))
                .collect(),
            None => return,
        };

        for (observer_id, callback) in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(change))) {
                error!(
                    key = %change.key,
                    observer_id = %observer_id,
                    reason = %panic_message(&panic),
                    "state observer panicked; continuing with remaining observers"
                );
            }
        }
    }
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
